use std::time::Duration;

/// Hold codes reported to the job when a transfer fails for a non-transient reason.
pub mod hold_codes {
    pub const INVALID_TRANSFER_ACK: i32 = 11;
    pub const DOWNLOAD_FILE_ERROR: i32 = 12;
    pub const UPLOAD_FILE_ERROR: i32 = 13;
    pub const INVALID_TRANSFER_GO_AHEAD: i32 = 18;
    pub const MAX_TRANSFER_INPUT_SIZE_EXCEEDED: i32 = 32;
    pub const MAX_TRANSFER_OUTPUT_SIZE_EXCEEDED: i32 = 33;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    #[default]
    None,
    /// Waiting for a slot of the transfer queue.
    Queued,
    Active,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub try_again: bool,
    pub hold_code: i32,
    pub hold_subcode: i32,
    pub reason: String,
}

impl TransferFailure {
    pub fn retry(reason: impl Into<String>) -> Self {
        TransferFailure {
            try_again: true,
            hold_code: 0,
            hold_subcode: 0,
            reason: reason.into(),
        }
    }

    pub fn hold(hold_code: i32, hold_subcode: i32, reason: impl Into<String>) -> Self {
        TransferFailure {
            try_again: false,
            hold_code,
            hold_subcode,
            reason: reason.into(),
        }
    }

    /// Hold with the OS error number as subcode.
    pub fn from_io(hold_code: i32, error: &std::io::Error, reason: impl Into<String>) -> Self {
        Self::hold(
            hold_code,
            error.raw_os_error().unwrap_or(0),
            format!("{}: {error}", reason.into()),
        )
    }
}

impl From<crate::Error> for TransferFailure {
    fn from(error: crate::Error) -> Self {
        if error.is_transient() {
            TransferFailure::retry(format!("Connection to the peer failed: {error}"))
        } else {
            TransferFailure::hold(
                hold_codes::INVALID_TRANSFER_GO_AHEAD,
                0,
                format!("Transfer protocol violated: {error}"),
            )
        }
    }
}

/// Outcome of one upload or download.
#[derive(Debug, Clone, Default)]
pub struct TransferInfo {
    pub upload: bool,
    pub success: bool,
    pub in_progress: bool,
    pub try_again: bool,
    pub hold_code: i32,
    pub hold_subcode: i32,
    pub error_description: String,
    pub bytes: u64,
    pub files: u32,
    pub duration: Duration,
    pub status: TransferStatus,
    /// Files written into the intermediate spool.
    pub spooled_files: Vec<String>,
}

impl TransferInfo {
    pub(crate) fn started(upload: bool) -> Self {
        TransferInfo {
            upload,
            in_progress: true,
            status: TransferStatus::Active,
            ..Default::default()
        }
    }

    pub(crate) fn finish(&mut self, failure: Option<TransferFailure>) {
        self.in_progress = false;
        self.status = TransferStatus::Done;
        match failure {
            None => self.success = true,
            Some(failure) => {
                self.success = false;
                self.try_again = failure.try_again;
                self.hold_code = failure.hold_code;
                self.hold_subcode = failure.hold_subcode;
                self.error_description = failure.reason;
            }
        }
    }

    pub fn failure(&self) -> Option<TransferFailure> {
        if self.success || self.in_progress {
            return None;
        }
        Some(TransferFailure {
            try_again: self.try_again,
            hold_code: self.hold_code,
            hold_subcode: self.hold_subcode,
            reason: self.error_description.clone(),
        })
    }
}

/// Keeps the first failure of a transfer; later ones are only logged.
#[derive(Default, Debug)]
pub(crate) struct FirstFailure(Option<TransferFailure>);

impl FirstFailure {
    pub fn record(&mut self, failure: TransferFailure) {
        match &self.0 {
            None => {
                log::debug!("Transfer failure recorded: {}", failure.reason);
                self.0 = Some(failure);
            }
            Some(first) => log::debug!(
                "Ignoring subsequent failure ({}), keeping: {}",
                failure.reason,
                first.reason
            ),
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn get(&self) -> Option<&TransferFailure> {
        self.0.as_ref()
    }

    pub fn take(self) -> Option<TransferFailure> {
        self.0
    }
}
