use std::fmt::{Debug, Formatter};
use std::future::Future;

use tokio::sync::{mpsc, oneshot};

pub type RpcSender<T> = mpsc::UnboundedSender<T>;
pub type RpcReceiver<T> = mpsc::UnboundedReceiver<T>;

pub fn make_rpc_queue<T>() -> (RpcSender<T>, RpcReceiver<T>) {
    mpsc::unbounded_channel()
}

/// Answers one request sent through [`call`].
#[must_use = "the caller waits until the token is answered or dropped"]
pub struct ResponseToken<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Debug for ResponseToken<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseToken")
    }
}

impl<T> ResponseToken<T> {
    pub fn respond(self, response: T) {
        if self.sender.send(response).is_err() {
            log::debug!("Caller is no longer waiting for the response");
        }
    }
}

/// Sends a message carrying a fresh [`ResponseToken`] and waits for the answer.
///
/// The message is sent immediately; the returned future resolves to an error
/// when the receiving process is gone or drops the token.
pub fn call<M, T, F>(
    sender: &RpcSender<M>,
    make_message: F,
) -> impl Future<Output = anyhow::Result<T>> + use<M, T, F>
where
    F: FnOnce(ResponseToken<T>) -> M,
{
    let (tx, rx) = oneshot::channel();
    let sent = sender.send(make_message(ResponseToken { sender: tx })).is_ok();
    async move {
        if !sent {
            anyhow::bail!("Receiving process has stopped");
        }
        rx.await
            .map_err(|_| anyhow::anyhow!("Request was dropped without a response"))
    }
}
