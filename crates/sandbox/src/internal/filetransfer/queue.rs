use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Process-wide authority limiting the number of concurrently streaming sandboxes.
///
/// A granted slot is held by the connection until it is dropped.
#[derive(Clone, Debug)]
pub struct TransferQueue {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl TransferQueue {
    pub fn new(limit: usize) -> Self {
        TransferQueue {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active_transfers(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn request_slot(&self, description: &str) -> SlotRequest {
        log::debug!("Requesting a transfer slot for {description}");
        SlotRequest {
            acquire: Box::pin(self.semaphore.clone().acquire_owned()),
        }
    }

    /// Refuses all waiting and future requests.
    pub fn shutdown(&self) {
        self.semaphore.close();
    }
}

pub enum SlotPoll {
    Granted(OwnedSemaphorePermit),
    Pending,
    Failed(String),
}

type AcquireFuture = Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>>>>;

/// Outstanding request for a slot. Keeps its place in the queue between polls.
pub struct SlotRequest {
    acquire: AcquireFuture,
}

impl SlotRequest {
    pub async fn poll(&mut self, timeout: Duration) -> SlotPoll {
        match tokio::time::timeout(timeout, &mut self.acquire).await {
            Ok(Ok(permit)) => SlotPoll::Granted(permit),
            Ok(Err(_)) => SlotPoll::Failed("transfer queue is shutting down".to_string()),
            Err(_) => SlotPoll::Pending,
        }
    }
}
