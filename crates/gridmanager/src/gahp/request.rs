use serde::{Deserialize, Serialize};

/// Error code of a reply produced locally when a call did not finish in time.
pub const TIMEOUT_ERROR_CODE: &str = "TIMEOUT";
/// Error code reported by the helper when the credentials were rejected.
pub const AUTH_FAILED_ERROR_CODE: &str = "AUTH_FAILED";
/// Error code of a reply produced locally when the helper could not be reached.
pub const GAHP_ERROR_CODE: &str = "GAHP_ERROR";

/// One remote operation. Two requests are the same logical call only when
/// both the command and every argument match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GahpRequest {
    pub command: String,
    pub args: Vec<String>,
}

impl GahpRequest {
    pub fn new<I, S>(command: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.to_string(),
            args: args.into_iter().map(|a| a.into()).collect(),
        }
    }
}

impl std::fmt::Display for GahpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GahpReply {
    pub success: bool,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
}

impl GahpReply {
    pub fn ok<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            success: true,
            values: values.into_iter().map(|v| v.into()).collect(),
            ..Default::default()
        }
    }

    pub fn failed(code: &str, error: &str) -> Self {
        Self {
            success: false,
            error_code: Some(code.to_string()),
            error: Some(error.to_string()),
            values: vec![],
        }
    }

    /// The call did not reach a definite outcome and may be repeated.
    pub fn is_transient(&self) -> bool {
        !self.success && matches!(self.error_code(), TIMEOUT_ERROR_CODE | GAHP_ERROR_CODE)
    }

    pub fn timeout() -> Self {
        Self::failed(TIMEOUT_ERROR_CODE, "Remote operation timed out")
    }

    pub fn error_code(&self) -> &str {
        self.error_code.as_deref().unwrap_or("")
    }

    pub fn error_string(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(|v| v.as_str())
    }
}
