use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;

use crate::internal::filetransfer::info::hold_codes;
use crate::internal::filetransfer::plugin::PluginRegistry;
use crate::internal::filetransfer::queue::TransferQueue;
use crate::internal::messages::transfer::ProtocolFeatures;
use crate::Map;

/// Sandboxes up to this size are transferred without asking the transfer queue.
pub const DEFAULT_MIN_BYTES_TO_QUEUE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MIN_ALIVE_INTERVAL: Duration = Duration::from_secs(300);
pub const ALIVE_SLOP: Duration = Duration::from_secs(20);

/// Which end of the job the local process represents. It decides whether a size
/// limit violation counts against the input or the output sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferSide {
    /// Uploads the input sandbox, downloads the output sandbox.
    #[default]
    Submit,
    /// Downloads the input sandbox, uploads the output sandbox.
    Execute,
}

impl TransferSide {
    pub(crate) fn upload_limit_hold_code(self) -> i32 {
        match self {
            TransferSide::Submit => hold_codes::MAX_TRANSFER_INPUT_SIZE_EXCEEDED,
            TransferSide::Execute => hold_codes::MAX_TRANSFER_OUTPUT_SIZE_EXCEEDED,
        }
    }

    pub(crate) fn download_limit_hold_code(self) -> i32 {
        match self {
            TransferSide::Submit => hold_codes::MAX_TRANSFER_OUTPUT_SIZE_EXCEEDED,
            TransferSide::Execute => hold_codes::MAX_TRANSFER_INPUT_SIZE_EXCEEDED,
        }
    }
}

#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct FileTransferConfig {
    /// Directory the uploaded entries are relative to, and the directory downloads land in.
    #[builder(setter(into))]
    pub(crate) sandbox_dir: PathBuf,

    /// Spool directory for intermediate (non-final) downloads.
    #[builder(default, setter(strip_option, into))]
    pub(crate) spool_dir: Option<PathBuf>,

    #[builder(default)]
    pub(crate) side: TransferSide,

    /// Entries to upload: relative/absolute paths or URLs. A trailing `/` on a
    /// directory transfers its contents only.
    #[builder(default)]
    pub(crate) files: Vec<String>,

    /// Name of the entry that must arrive with the executable bit set.
    #[builder(default, setter(strip_option, into))]
    pub(crate) executable: Option<String>,

    /// Credential delegated to the peer before the sandbox.
    #[builder(default, setter(strip_option, into))]
    pub(crate) proxy_file: Option<PathBuf>,

    /// Output entries that go to a URL instead of back to the peer (name -> URL).
    #[builder(default)]
    pub(crate) output_destinations: Map<String, String>,

    #[builder(default = "true")]
    pub(crate) encrypt_by_default: bool,
    #[builder(default)]
    pub(crate) encrypt_files: Vec<String>,
    #[builder(default)]
    pub(crate) dont_encrypt_files: Vec<String>,

    #[builder(default, setter(strip_option))]
    pub(crate) max_upload_bytes: Option<u64>,
    #[builder(default, setter(strip_option))]
    pub(crate) max_download_bytes: Option<u64>,

    #[builder(default = "ProtocolFeatures::all()")]
    pub(crate) features: ProtocolFeatures,

    #[builder(default = "MIN_ALIVE_INTERVAL")]
    pub(crate) client_timeout: Duration,
    #[builder(default = "MIN_ALIVE_INTERVAL")]
    pub(crate) min_alive_interval: Duration,

    #[builder(default = "DEFAULT_MIN_BYTES_TO_QUEUE")]
    pub(crate) min_bytes_to_queue: u64,
    #[builder(default, setter(strip_option))]
    pub(crate) transfer_queue: Option<TransferQueue>,

    #[builder(default)]
    pub(crate) plugins: PluginRegistry,

    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    pub(crate) chunk_size: usize,
}

impl FileTransferConfig {
    pub fn sandbox_dir(&self) -> &std::path::Path {
        &self.sandbox_dir
    }

    /// Explicit per-file choices win over the session default.
    pub(crate) fn wants_encryption(&self, name: &str) -> Option<bool> {
        if self.encrypt_files.iter().any(|f| f == name) {
            Some(true)
        } else if self.dont_encrypt_files.iter().any(|f| f == name) {
            Some(false)
        } else {
            None
        }
    }
}
