use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl SandboxError {
    /// Errors that were caused by the connection itself rather than by the local
    /// filesystem; the transfer may be retried later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SandboxError::ProtocolError(_))
    }
}

impl From<bincode::Error> for SandboxError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
impl From<String> for SandboxError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}
impl From<&str> for SandboxError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
