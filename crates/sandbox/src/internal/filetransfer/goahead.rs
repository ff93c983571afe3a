use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OwnedSemaphorePermit;

use crate::connection::Connection;
use crate::internal::filetransfer::config::{ALIVE_SLOP, FileTransferConfig};
use crate::internal::filetransfer::engine::Progress;
use crate::internal::filetransfer::info::{TransferFailure, TransferStatus, hold_codes};
use crate::internal::filetransfer::queue::SlotPoll;
use crate::internal::messages::transfer::{
    GO_AHEAD_ALWAYS, GO_AHEAD_FAILED, GO_AHEAD_UNDEFINED, GoAheadMessage, TransferMessage,
};

const FIRST_SLOT_POLL: Duration = Duration::from_secs(5);

type Conn<T> = Connection<TransferMessage, TransferMessage, T>;

/// Go-ahead bookkeeping of one connection. Once a side answered "always", no more
/// handshakes happen in that direction.
#[derive(Default)]
pub(crate) struct GoAheadState {
    pub i_go_ahead_always: bool,
    pub peer_goes_ahead_always: bool,
    pub peer_max_transfer_bytes: Option<u64>,
    slot: Option<OwnedSemaphorePermit>,
}

impl GoAheadState {
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }
}

fn unexpected(message: &TransferMessage) -> TransferFailure {
    TransferFailure::hold(
        hold_codes::INVALID_TRANSFER_GO_AHEAD,
        0,
        format!(
            "Received unexpected {} message during go-ahead",
            message.kind()
        ),
    )
}

/// Decides whether the peer may proceed and tells it.
///
/// The peer first announces how long it is willing to wait between messages;
/// while waiting for a queue slot, keep-alive messages are sent within that interval.
pub(crate) async fn obtain_and_send_go_ahead<T: AsyncRead + AsyncWrite>(
    conn: &mut Conn<T>,
    config: &FileTransferConfig,
    state: &mut GoAheadState,
    progress: &Progress,
    sandbox_size: u64,
    downloading: bool,
    item_name: &str,
) -> Result<(), TransferFailure> {
    let message = conn.expect_message().await?;
    let TransferMessage::AliveInterval(peer_interval) = message else {
        return Err(unexpected(&message));
    };
    let mut alive_interval = Duration::from_secs(peer_interval.into());
    if alive_interval < config.min_alive_interval {
        let mut message = GoAheadMessage::new(GO_AHEAD_UNDEFINED);
        message.timeout = Some(config.min_alive_interval.as_secs() as u32);
        conn.send(TransferMessage::GoAhead(message)).await?;
        alive_interval = config.min_alive_interval;
    }
    let keepalive = alive_interval
        .saturating_sub(ALIVE_SLOP)
        .max(Duration::from_secs(1));

    let mut outcome = Ok(());
    match &config.transfer_queue {
        Some(queue) if sandbox_size > config.min_bytes_to_queue => {
            let mut request = queue.request_slot(item_name);
            let mut wait = FIRST_SLOT_POLL;
            loop {
                match request.poll(wait).await {
                    SlotPoll::Granted(permit) => {
                        state.slot = Some(permit);
                        break;
                    }
                    SlotPoll::Pending => {
                        progress.status(TransferStatus::Queued);
                        conn.send(TransferMessage::GoAhead(GoAheadMessage::new(
                            GO_AHEAD_UNDEFINED,
                        )))
                        .await?;
                        wait = keepalive;
                    }
                    SlotPoll::Failed(reason) => {
                        outcome = Err(reason);
                        break;
                    }
                }
            }
        }
        _ => {}
    }

    let mut message = match &outcome {
        Ok(()) => GoAheadMessage::new(GO_AHEAD_ALWAYS),
        Err(reason) => {
            let mut message = GoAheadMessage::new(GO_AHEAD_FAILED);
            message.message = Some(reason.clone());
            message
        }
    };
    if downloading {
        message.max_transfer_bytes = config.max_download_bytes;
    }
    conn.send(TransferMessage::GoAhead(message)).await?;
    match outcome {
        Ok(()) => {
            state.i_go_ahead_always = true;
            progress.status(TransferStatus::Active);
            Ok(())
        }
        Err(reason) => Err(TransferFailure::retry(reason)),
    }
}

/// Waits until the peer allows the transfer to proceed.
pub(crate) async fn receive_go_ahead<T: AsyncRead + AsyncWrite>(
    conn: &mut Conn<T>,
    config: &FileTransferConfig,
    state: &mut GoAheadState,
    progress: &Progress,
) -> Result<(), TransferFailure> {
    let alive_interval = config.client_timeout.max(config.min_alive_interval);
    conn.send(TransferMessage::AliveInterval(alive_interval.as_secs() as u32))
        .await?;
    let mut timeout = alive_interval + ALIVE_SLOP;

    loop {
        let message = tokio::time::timeout(timeout, conn.expect_message())
            .await
            .map_err(|_| TransferFailure::retry("Timed out waiting for transfer go-ahead"))??;
        let TransferMessage::GoAhead(go_ahead) = message else {
            return Err(unexpected(&message));
        };
        if let Some(seconds) = go_ahead.timeout {
            timeout = Duration::from_secs(seconds.into()) + ALIVE_SLOP;
        }
        if go_ahead.max_transfer_bytes.is_some() {
            state.peer_max_transfer_bytes = go_ahead.max_transfer_bytes;
        }
        match go_ahead.result {
            GO_AHEAD_UNDEFINED => progress.status(TransferStatus::Queued),
            GO_AHEAD_FAILED => {
                return Err(TransferFailure {
                    try_again: go_ahead.try_again,
                    hold_code: go_ahead.hold_code,
                    hold_subcode: go_ahead.hold_subcode,
                    reason: go_ahead
                        .message
                        .unwrap_or_else(|| "Peer refused to go ahead with the transfer".into()),
                });
            }
            result if result > 0 => {
                if result == GO_AHEAD_ALWAYS {
                    state.peer_goes_ahead_always = true;
                }
                progress.status(TransferStatus::Active);
                return Ok(());
            }
            result => {
                return Err(TransferFailure::hold(
                    hold_codes::INVALID_TRANSFER_GO_AHEAD,
                    0,
                    format!("Received invalid go-ahead value {result}"),
                ));
            }
        }
    }
}
