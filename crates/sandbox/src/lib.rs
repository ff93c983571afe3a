#![deny(clippy::await_holding_refcell_ref)]

mod internal;

pub mod connection;

pub use crate::internal::common::WrappedRcRefCell;
pub use crate::internal::common::{Map, Set};

pub type Error = internal::common::error::SandboxError;
pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

pub mod transfer {
    pub use crate::internal::filetransfer::commit::{
        COMMIT_FILENAME, commit_files, swap_dir_for, tmp_spool_for,
    };
    pub use crate::internal::filetransfer::config::{
        FileTransferConfig, FileTransferConfigBuilder, TransferSide,
    };
    pub use crate::internal::filetransfer::engine::{FileTransfer, TransferMode, TransferUpdate};
    pub use crate::internal::filetransfer::info::{
        TransferFailure, TransferInfo, TransferStatus, hold_codes,
    };
    pub use crate::internal::filetransfer::items::{
        FileTransferItem, ItemKind, expand_file_list, url_scheme,
    };
    pub use crate::internal::filetransfer::paths::resolve_in_sandbox;
    pub use crate::internal::filetransfer::plugin::PluginRegistry;
    pub use crate::internal::filetransfer::queue::{SlotPoll, SlotRequest, TransferQueue};
    pub use crate::internal::filetransfer::registry::{
        CapabilityToken, RequestState, TransferDirection, TransferRequest,
        TransferRequestRegistry, TransferRequestRegistryRef,
    };
    pub use crate::internal::filetransfer::server::{
        queue_transfer_request, serve_transfer_connection, start_requested_transfer,
    };
    pub use crate::internal::messages::transfer::{
        GoAheadMessage, ProtocolFeatures, TransferAck, TransferCommand, TransferMessage,
    };

    pub type TransferConnection<T = tokio::net::TcpStream> =
        crate::connection::Connection<TransferMessage, TransferMessage, T>;
}
