use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::WrappedRcRefCell;
use crate::gahp::request::{GAHP_ERROR_CODE, GahpReply, GahpRequest};
use crate::gahp::server::{GahpFuture, GahpServerRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GahpMode {
    /// Calls are issued in the background and the owner is woken up on completion.
    Normal,
    /// Calls are awaited in place. Only used for one-time setup.
    Blocking,
    /// No new calls are issued, results of already issued calls are still handed out.
    ResultsOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    /// The call was not issued; try again on a later evaluation.
    NotSubmitted,
    /// A call is outstanding. Either it is this very call, or a different call that has to
    /// finish (or be purged) first.
    Pending,
    Done(GahpReply),
}

struct PendingCall {
    request: GahpRequest,
    result: WrappedRcRefCell<Option<GahpReply>>,
    handle: JoinHandle<()>,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Per-job view of a helper. At most one call is outstanding at any time.
pub struct GahpClient {
    server: GahpServerRef,
    mode: GahpMode,
    timeout: Duration,
    waker: Rc<Notify>,
    pending: Option<PendingCall>,
    error_code: String,
    error_string: String,
}

async fn run_with_timeout(future: GahpFuture<GahpReply>, timeout: Duration) -> GahpReply {
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(error)) => GahpReply::failed(GAHP_ERROR_CODE, &format!("{error:#}")),
        Err(_) => GahpReply::timeout(),
    }
}

impl GahpClient {
    /// `waker` is notified whenever a background call completes.
    pub fn new(server: GahpServerRef, waker: Rc<Notify>, timeout: Duration) -> Self {
        Self {
            server,
            mode: GahpMode::Normal,
            timeout,
            waker,
            pending: None,
            error_code: String::new(),
            error_string: String::new(),
        }
    }

    pub fn server(&self) -> &GahpServerRef {
        &self.server
    }

    pub fn mode(&self) -> GahpMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: GahpMode) {
        self.mode = mode;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn startup(&self) -> Result<(), String> {
        self.server.startup().await
    }

    pub fn pending_request_issued(&self) -> bool {
        self.pending.is_some()
    }

    /// Forgets the outstanding call, its result will never be delivered.
    pub fn purge_pending_requests(&mut self) {
        if let Some(pending) = self.pending.take() {
            log::debug!("Purging outstanding call {}", pending.request.command);
        }
    }

    /// Error code of the last completed call
    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    /// Error text of the last completed call
    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub async fn call(&mut self, request: GahpRequest) -> CallResult {
        if let Some(pending) = &self.pending {
            if pending.request != request {
                log::debug!(
                    "Not issuing {}, {} is still outstanding",
                    request.command,
                    pending.request.command
                );
                return CallResult::Pending;
            }
            let reply = pending.result.get_mut().take();
            if let Some(reply) = reply {
                self.pending = None;
                return self.finish(reply);
            }
            if self.mode != GahpMode::Blocking {
                return CallResult::Pending;
            }
            // The background call is replaced by a blocking one
            self.pending = None;
        }

        match self.mode {
            GahpMode::ResultsOnly => CallResult::NotSubmitted,
            GahpMode::Blocking => {
                let reply = run_with_timeout(self.server.execute(request), self.timeout).await;
                self.finish(reply)
            }
            GahpMode::Normal => {
                log::trace!("Issuing {request}");
                let result = WrappedRcRefCell::wrap(None);
                let future = self.server.execute(request.clone());
                let slot = result.clone();
                let waker = self.waker.clone();
                let timeout = self.timeout;
                let handle = tokio::task::spawn_local(async move {
                    let reply = run_with_timeout(future, timeout).await;
                    *slot.get_mut() = Some(reply);
                    waker.notify_one();
                });
                self.pending = Some(PendingCall {
                    request,
                    result,
                    handle,
                });
                CallResult::Pending
            }
        }
    }

    fn finish(&mut self, reply: GahpReply) -> CallResult {
        self.error_code = reply.error_code().to_string();
        self.error_string = reply.error_string().to_string();
        CallResult::Done(reply)
    }
}
