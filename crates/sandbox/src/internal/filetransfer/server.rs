use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::Connection;
use crate::internal::filetransfer::config::FileTransferConfig;
use crate::internal::filetransfer::engine::{FileTransfer, TransferMode};
use crate::internal::filetransfer::info::TransferInfo;
use crate::internal::filetransfer::registry::{
    CapabilityToken, TransferDirection, TransferRequest, TransferRequestRegistryRef,
};
use crate::internal::messages::transfer::{TransferMessage, TransferRequestMessage};
use crate::Map;

type Conn<T> = Connection<TransferMessage, TransferMessage, T>;

/// Client side: queue a transfer and receive the capability for it.
pub async fn queue_transfer_request<T: AsyncRead + AsyncWrite>(
    conn: &mut Conn<T>,
    direction: TransferDirection,
    job_ads: Vec<Map<String, String>>,
) -> crate::Result<CapabilityToken> {
    let request = TransferRequestMessage {
        download: direction == TransferDirection::Download,
        job_ads,
    };
    match conn
        .send_and_receive(TransferMessage::QueueRequest(request))
        .await?
    {
        TransferMessage::RequestQueued { token } => Ok(token.into()),
        TransferMessage::TransferRejected { reason } => Err(reason.into()),
        other => Err(crate::Error::ProtocolError(format!(
            "Expected queued request, received {}",
            other.kind()
        ))),
    }
}

/// Client side: present a capability. On success the connection is ready for
/// [`FileTransfer::upload`] or [`FileTransfer::download`].
pub async fn start_requested_transfer<T: AsyncRead + AsyncWrite>(
    conn: &mut Conn<T>,
    token: &CapabilityToken,
) -> crate::Result<()> {
    match conn
        .send_and_receive(TransferMessage::StartTransfer {
            token: token.to_string(),
        })
        .await?
    {
        TransferMessage::TransferAccepted => Ok(()),
        TransferMessage::TransferRejected { reason } => {
            Err(format!("Transfer request rejected: {reason}").into())
        }
        other => Err(crate::Error::ProtocolError(format!(
            "Expected transfer acceptance, received {}",
            other.kind()
        ))),
    }
}

/// Daemon side: handles one client connection.
///
/// Either queues a new request, or runs the transfer belonging to the presented
/// capability. `make_config` builds the transfer configuration for an accepted request.
pub async fn serve_transfer_connection<T, F>(
    mut conn: Conn<T>,
    registry: &TransferRequestRegistryRef,
    make_config: F,
) -> crate::Result<Option<TransferInfo>>
where
    T: AsyncRead + AsyncWrite + 'static,
    F: FnOnce(&TransferRequest) -> crate::Result<FileTransferConfig>,
{
    match conn.expect_message().await? {
        TransferMessage::QueueRequest(request) => {
            let direction = if request.download {
                TransferDirection::Download
            } else {
                TransferDirection::Upload
            };
            let token = registry.get_mut().queue(direction, request.job_ads);
            conn.send(TransferMessage::RequestQueued {
                token: token.to_string(),
            })
            .await?;
            Ok(None)
        }
        TransferMessage::StartTransfer { token } => {
            let token = CapabilityToken::from(token);
            let request = registry.get_mut().activate(&token).cloned();
            let config = request.and_then(|request| {
                make_config(&request)
                    .map(|config| (request.direction, config))
                    .map_err(|e| e.to_string())
            });
            let (direction, config) = match config {
                Ok(config) => config,
                Err(reason) => {
                    log::debug!("Rejecting transfer {token}: {reason}");
                    registry.get_mut().reject(&token, reason.clone());
                    conn.send(TransferMessage::TransferRejected { reason })
                        .await?;
                    return Ok(None);
                }
            };
            conn.send(TransferMessage::TransferAccepted).await?;

            let mut transfer = FileTransfer::new(config);
            let success = match direction {
                TransferDirection::Upload => transfer.download(conn, TransferMode::Blocking).await,
                TransferDirection::Download => {
                    transfer.upload(conn, TransferMode::Blocking, true).await
                }
            };
            registry.get_mut().complete(&token, success);
            Ok(Some(transfer.info().clone()))
        }
        other => Err(crate::Error::ProtocolError(format!(
            "Expected transfer request, received {}",
            other.kind()
        ))),
    }
}
