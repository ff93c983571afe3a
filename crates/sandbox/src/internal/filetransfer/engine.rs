use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::internal::filetransfer::config::FileTransferConfig;
use crate::internal::filetransfer::info::{TransferFailure, TransferInfo, TransferStatus};
use crate::internal::filetransfer::receive::download_sandbox;
use crate::internal::filetransfer::send::upload_sandbox;
use crate::internal::messages::transfer::TransferMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// The call returns once the transfer is finished.
    Blocking,
    /// The transfer runs in a local task; progress is reported through updates.
    Background,
}

#[derive(Debug)]
pub enum TransferUpdate {
    Status(TransferStatus),
    Finished(TransferInfo),
}

/// Sink for status pings of a running transfer.
#[derive(Default)]
pub(crate) struct Progress {
    sender: Option<UnboundedSender<TransferUpdate>>,
}

impl Progress {
    pub fn status(&self, status: TransferStatus) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(TransferUpdate::Status(status));
        }
    }
}

struct BackgroundTransfer {
    updates: UnboundedReceiver<TransferUpdate>,
    handle: JoinHandle<()>,
}

/// One side of a sandbox transfer.
pub struct FileTransfer {
    config: Rc<FileTransferConfig>,
    info: TransferInfo,
    background: Option<BackgroundTransfer>,
}

impl FileTransfer {
    pub fn new(config: FileTransferConfig) -> Self {
        FileTransfer {
            config: Rc::new(config),
            info: TransferInfo::default(),
            background: None,
        }
    }

    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn is_running(&self) -> bool {
        self.background.is_some()
    }

    /// Sends the configured sandbox to the peer.
    ///
    /// In blocking mode returns whether the transfer succeeded; in background mode
    /// returns `true` once the transfer was started.
    pub async fn upload<T>(
        &mut self,
        conn: Connection<TransferMessage, TransferMessage, T>,
        mode: TransferMode,
        final_transfer: bool,
    ) -> bool
    where
        T: AsyncRead + AsyncWrite + 'static,
    {
        let config = self.config.clone();
        self.run(mode, true, move |progress| async move {
            upload_sandbox(conn, &config, final_transfer, &progress).await
        })
        .await
    }

    /// Receives a sandbox from the peer into the configured directory.
    pub async fn download<T>(
        &mut self,
        conn: Connection<TransferMessage, TransferMessage, T>,
        mode: TransferMode,
    ) -> bool
    where
        T: AsyncRead + AsyncWrite + 'static,
    {
        let config = self.config.clone();
        self.run(mode, false, move |progress| async move {
            download_sandbox(conn, &config, &progress).await
        })
        .await
    }

    async fn run<F, Fut>(&mut self, mode: TransferMode, upload: bool, transfer: F) -> bool
    where
        F: FnOnce(Progress) -> Fut,
        Fut: Future<Output = TransferInfo> + 'static,
    {
        if self.background.is_some() {
            log::warn!("A transfer is already running, refusing to start another one");
            return false;
        }
        self.info = TransferInfo::started(upload);
        match mode {
            TransferMode::Blocking => {
                self.info = transfer(Progress::default()).await;
                self.info.success
            }
            TransferMode::Background => {
                let (sender, updates) = unbounded_channel();
                let finished = sender.clone();
                let future = transfer(Progress {
                    sender: Some(sender),
                });
                let handle = tokio::task::spawn_local(async move {
                    let info = future.await;
                    let _ = finished.send(TransferUpdate::Finished(info));
                });
                self.background = Some(BackgroundTransfer { updates, handle });
                true
            }
        }
    }

    /// Applies every update that already arrived. Returns `true` when the
    /// background transfer has finished.
    pub fn poll_updates(&mut self) -> bool {
        loop {
            let Some(background) = &mut self.background else {
                return true;
            };
            match background.updates.try_recv() {
                Ok(update) => {
                    if self.apply(update) {
                        return true;
                    }
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    self.lost_task();
                    return true;
                }
            }
        }
    }

    /// Waits for the background transfer to finish.
    pub async fn wait(&mut self) -> &TransferInfo {
        loop {
            let Some(background) = &mut self.background else {
                break;
            };
            let Some(update) = background.updates.recv().await else {
                self.lost_task();
                break;
            };
            if self.apply(update) {
                break;
            }
        }
        &self.info
    }

    fn lost_task(&mut self) {
        log::error!("Background transfer ended without reporting a result");
        self.background = None;
        self.info.finish(Some(TransferFailure::retry(
            "Transfer task terminated unexpectedly",
        )));
    }

    fn apply(&mut self, update: TransferUpdate) -> bool {
        match update {
            TransferUpdate::Status(status) => {
                self.info.status = status;
                false
            }
            TransferUpdate::Finished(info) => {
                self.info = info;
                self.background = None;
                true
            }
        }
    }

    /// Stops a running background transfer.
    pub fn abort(&mut self) {
        if let Some(background) = self.background.take() {
            background.handle.abort();
            self.info
                .finish(Some(TransferFailure::retry("Transfer aborted")));
        }
    }
}

impl Drop for FileTransfer {
    fn drop(&mut self) {
        self.abort();
    }
}
