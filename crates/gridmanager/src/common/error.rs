use thiserror::Error;

#[derive(Debug, Error)]
pub enum GmError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Invalid job constraint {constraint:?}: {reason}")]
    InvalidConstraint { constraint: String, reason: String },
    #[error("Job queue error: {0}")]
    QueueError(String),
    #[error("Sandbox error: {0}")]
    SandboxError(#[from] sandbox::Error),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<toml::de::Error> for GmError {
    fn from(error: toml::de::Error) -> Self {
        Self::ConfigError(error.to_string())
    }
}

impl From<anyhow::Error> for GmError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:#}"))
    }
}

impl From<String> for GmError {
    fn from(message: String) -> Self {
        Self::GenericError(message)
    }
}

impl From<&str> for GmError {
    fn from(message: &str) -> Self {
        Self::GenericError(message.to_string())
    }
}
