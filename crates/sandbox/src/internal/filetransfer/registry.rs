use std::fmt;
use std::time::SystemTime;

use crate::{Map, WrappedRcRefCell};

/// Direction of a queued transfer, seen from the client that queued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// The client sends a sandbox to the daemon.
    Upload,
    /// The client fetches a sandbox from the daemon.
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Active,
    Rejected(String),
    Done { success: bool },
}

/// Opaque token handed to the client; presenting it later starts the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityToken(String);

impl CapabilityToken {
    fn generate() -> Self {
        CapabilityToken(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CapabilityToken {
    fn from(value: String) -> Self {
        CapabilityToken(value)
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub job_ads: Vec<Map<String, String>>,
    pub state: RequestState,
    pub queued_at: SystemTime,
}

pub type TransferRequestRegistryRef = WrappedRcRefCell<TransferRequestRegistry>;

/// Transfer requests keyed by capability token. A token stays unique until it is retired.
#[derive(Default)]
pub struct TransferRequestRegistry {
    requests: Map<CapabilityToken, TransferRequest>,
}

impl TransferRequestRegistry {
    pub fn new_ref() -> TransferRequestRegistryRef {
        WrappedRcRefCell::wrap(Self::default())
    }

    pub fn queue(
        &mut self,
        direction: TransferDirection,
        job_ads: Vec<Map<String, String>>,
    ) -> CapabilityToken {
        let token = loop {
            let token = CapabilityToken::generate();
            if !self.requests.contains_key(&token) {
                break token;
            }
        };
        log::debug!(
            "Queued {direction:?} request for {} job(s) as {token}",
            job_ads.len()
        );
        self.requests.insert(
            token.clone(),
            TransferRequest {
                direction,
                job_ads,
                state: RequestState::Queued,
                queued_at: SystemTime::now(),
            },
        );
        token
    }

    pub fn get(&self, token: &CapabilityToken) -> Option<&TransferRequest> {
        self.requests.get(token)
    }

    /// Moves a queued request to the active state.
    pub fn activate(&mut self, token: &CapabilityToken) -> Result<&TransferRequest, String> {
        let Some(request) = self.requests.get_mut(token) else {
            return Err("unknown capability".to_string());
        };
        match &request.state {
            RequestState::Queued => {
                request.state = RequestState::Active;
                Ok(request)
            }
            state => Err(format!("request is not queued ({state:?})")),
        }
    }

    /// Finished requests keep their outcome.
    pub fn reject(&mut self, token: &CapabilityToken, reason: String) {
        if let Some(request) = self.requests.get_mut(token) {
            if matches!(request.state, RequestState::Queued | RequestState::Active) {
                request.state = RequestState::Rejected(reason);
            }
        }
    }

    pub fn complete(&mut self, token: &CapabilityToken, success: bool) {
        if let Some(request) = self.requests.get_mut(token) {
            request.state = RequestState::Done { success };
        }
    }

    pub fn retire(&mut self, token: &CapabilityToken) -> Option<TransferRequest> {
        self.requests.remove(token)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
