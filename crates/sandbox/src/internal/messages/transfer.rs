use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::Map;

bitflags! {
    /// Optional protocol extensions. Both peers announce what they support and the
    /// intersection is used for the rest of the connection.
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolFeatures: u32 {
        const GO_AHEAD = 0b001;
        const TRANSFER_ACK = 0b010;
        const SANDBOX_SIZE = 0b100;
    }
}

/// Per-item command codes. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCommand {
    Finished,
    XferFile,
    EnableEncryption,
    DisableEncryption,
    XferX509,
    DownloadUrl,
    Mkdir,
    Other,
}

impl TransferCommand {
    pub fn code(self) -> i32 {
        match self {
            TransferCommand::Finished => 0,
            TransferCommand::XferFile => 1,
            TransferCommand::EnableEncryption => 2,
            TransferCommand::DisableEncryption => 3,
            TransferCommand::XferX509 => 4,
            TransferCommand::DownloadUrl => 5,
            TransferCommand::Mkdir => 6,
            TransferCommand::Other => 999,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => TransferCommand::Finished,
            1 => TransferCommand::XferFile,
            2 => TransferCommand::EnableEncryption,
            3 => TransferCommand::DisableEncryption,
            4 => TransferCommand::XferX509,
            5 => TransferCommand::DownloadUrl,
            6 => TransferCommand::Mkdir,
            999 => TransferCommand::Other,
            _ => return None,
        })
    }

    /// Does this command stream the bytes of a regular file?
    pub fn carries_file_data(self) -> bool {
        matches!(
            self,
            TransferCommand::XferFile
                | TransferCommand::EnableEncryption
                | TransferCommand::DisableEncryption
        )
    }
}

/// Sub-command of [`TransferCommand::Other`]
pub const SUBCOMMAND_UPLOAD_URL: i32 = 7;

pub const GO_AHEAD_FAILED: i32 = -1;
pub const GO_AHEAD_UNDEFINED: i32 = 0;
pub const GO_AHEAD_ALWAYS: i32 = 2;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GoAheadMessage {
    pub result: i32,
    pub timeout: Option<u32>,
    pub max_transfer_bytes: Option<u64>,
    pub try_again: bool,
    pub hold_code: i32,
    pub hold_subcode: i32,
    pub message: Option<String>,
}

impl GoAheadMessage {
    pub fn new(result: i32) -> Self {
        GoAheadMessage {
            result,
            timeout: None,
            max_transfer_bytes: None,
            try_again: true,
            hold_code: 0,
            hold_subcode: 0,
            message: None,
        }
    }
}

/// `result`: 0 success, positive means "try again later", negative means "put the job on hold".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferAck {
    pub result: i32,
    pub hold_code: i32,
    pub hold_subcode: i32,
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferRequestMessage {
    pub download: bool,
    pub job_ads: Vec<Map<String, String>>,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum TransferMessage {
    Hello {
        features: ProtocolFeatures,
    },
    Header {
        final_transfer: bool,
        sandbox_size: Option<u64>,
    },
    Command {
        code: i32,
        name: String,
    },
    FileHeader {
        size: u64,
        mode: u32,
        executable: bool,
    },
    Chunk(#[serde(with = "serde_bytes")] Vec<u8>),
    FileEnd,
    /// The sender could not provide the rest of the file.
    FileAbort {
        reason: String,
    },
    DirMode(u32),
    Url(String),
    Delegation {
        expiration: Option<u64>,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    SubCommand {
        code: i32,
        info: Map<String, String>,
    },
    AliveInterval(u32),
    GoAhead(GoAheadMessage),
    Ack(TransferAck),

    // Request registry
    QueueRequest(TransferRequestMessage),
    RequestQueued {
        token: String,
    },
    StartTransfer {
        token: String,
    },
    TransferAccepted,
    TransferRejected {
        reason: String,
    },
}

impl TransferMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TransferMessage::Hello { .. } => "hello",
            TransferMessage::Header { .. } => "header",
            TransferMessage::Command { .. } => "command",
            TransferMessage::FileHeader { .. } => "file header",
            TransferMessage::Chunk(_) => "chunk",
            TransferMessage::FileEnd => "file end",
            TransferMessage::FileAbort { .. } => "file abort",
            TransferMessage::DirMode(_) => "directory mode",
            TransferMessage::Url(_) => "url",
            TransferMessage::Delegation { .. } => "delegation",
            TransferMessage::SubCommand { .. } => "sub-command",
            TransferMessage::AliveInterval(_) => "alive interval",
            TransferMessage::GoAhead(_) => "go-ahead",
            TransferMessage::Ack(_) => "ack",
            TransferMessage::QueueRequest(_) => "queue request",
            TransferMessage::RequestQueued { .. } => "request queued",
            TransferMessage::StartTransfer { .. } => "start transfer",
            TransferMessage::TransferAccepted => "transfer accepted",
            TransferMessage::TransferRejected { .. } => "transfer rejected",
        }
    }
}
