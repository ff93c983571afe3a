use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::connection::Connection;
use crate::internal::filetransfer::commit::{commit_files, tmp_spool_for, write_commit_marker};
use crate::internal::filetransfer::config::FileTransferConfig;
use crate::internal::filetransfer::engine::Progress;
use crate::internal::filetransfer::goahead::{
    GoAheadState, obtain_and_send_go_ahead, receive_go_ahead,
};
use crate::internal::filetransfer::info::{
    FirstFailure, TransferFailure, TransferInfo, hold_codes,
};
use crate::internal::filetransfer::paths::resolve_in_sandbox;
use crate::internal::filetransfer::send::{exchange_hello, failure_from_ack, make_ack};
use crate::internal::messages::transfer::{
    ProtocolFeatures, SUBCOMMAND_UPLOAD_URL, TransferCommand, TransferMessage,
};

type Conn<T> = Connection<TransferMessage, TransferMessage, T>;

const EPERM: i32 = 1;

fn protocol_violation(expected: &str, received: &TransferMessage) -> TransferFailure {
    crate::Error::ProtocolError(format!(
        "Expected {expected}, received {}",
        received.kind()
    ))
    .into()
}

/// Where the bytes of one file end up.
enum Destination {
    File { file: tokio::fs::File, path: PathBuf },
    Discard(tokio::io::Sink),
}

impl Destination {
    fn discard() -> Self {
        Destination::Discard(tokio::io::sink())
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Destination::File { file, .. } => file.write_all(data).await,
            Destination::Discard(sink) => sink.write_all(data).await,
        }
    }

    /// Removes a partially written file and continues discarding.
    async fn abandon(&mut self) {
        if let Destination::File { path, .. } = self {
            let path = std::mem::take(path);
            *self = Destination::discard();
            if let Err(error) = tokio::fs::remove_file(&path).await {
                log::debug!("Cannot remove partial file {}: {error}", path.display());
            }
        }
    }
}

struct Downloader<'a, T> {
    conn: Conn<T>,
    config: &'a FileTransferConfig,
    progress: &'a Progress,
    features: ProtocolFeatures,
    go_ahead: GoAheadState,
    failures: FirstFailure,
    target: PathBuf,
    spooling: bool,
    sandbox_size: u64,
    bytes: u64,
    files: u32,
    spooled_files: Vec<String>,
}

pub(crate) async fn download_sandbox<T: AsyncRead + AsyncWrite>(
    mut conn: Conn<T>,
    config: &FileTransferConfig,
    progress: &Progress,
) -> TransferInfo {
    let start = Instant::now();
    let mut info = TransferInfo::started(false);

    let features = match exchange_hello(&mut conn, config.features).await {
        Ok(features) => features,
        Err(error) => {
            info.finish(Some(error.into()));
            return info;
        }
    };
    let mut downloader = Downloader {
        conn,
        config,
        progress,
        features,
        go_ahead: GoAheadState::default(),
        failures: FirstFailure::default(),
        target: config.sandbox_dir.clone(),
        spooling: false,
        sandbox_size: u64::MAX,
        bytes: 0,
        files: 0,
        spooled_files: Vec::new(),
    };
    if let Err(abort) = downloader.run().await {
        downloader.failures.record(abort);
    }
    info.bytes = downloader.bytes;
    info.files = downloader.files;
    info.spooled_files = std::mem::take(&mut downloader.spooled_files);
    info.duration = start.elapsed();
    info.finish(downloader.failures.take());
    log::debug!(
        "Download of {} file(s) ({} bytes) finished in {:?}: success={}",
        info.files,
        info.bytes,
        info.duration,
        info.success
    );
    info
}

impl<T: AsyncRead + AsyncWrite> Downloader<'_, T> {
    async fn run(&mut self) -> Result<(), TransferFailure> {
        let message = self.conn.expect_message().await?;
        let TransferMessage::Header {
            final_transfer,
            sandbox_size,
        } = message
        else {
            return Err(protocol_violation("transfer header", &message));
        };
        if let Some(size) = sandbox_size {
            self.sandbox_size = size;
        }
        self.prepare_target(final_transfer).await;

        loop {
            let message = self.conn.expect_message().await?;
            let TransferMessage::Command { code, name } = message else {
                return Err(protocol_violation("transfer command", &message));
            };
            let Some(command) = TransferCommand::from_code(code) else {
                return Err(crate::Error::ProtocolError(format!(
                    "Unknown transfer command {code}"
                ))
                .into());
            };
            match command {
                TransferCommand::Finished => break,
                TransferCommand::XferFile
                | TransferCommand::EnableEncryption
                | TransferCommand::DisableEncryption => {
                    // Plain XferFile follows the session; explicit commands override it
                    let encrypt = command != TransferCommand::DisableEncryption
                        && self.conn.is_encrypted();
                    let dest = self.resolve(&name);
                    self.go_ahead(&name).await?;
                    self.receive_file(&name, dest, encrypt).await?;
                }
                TransferCommand::Mkdir => {
                    let message = self.conn.expect_message().await?;
                    let TransferMessage::DirMode(mode) = message else {
                        return Err(protocol_violation("directory mode", &message));
                    };
                    if let Some(dir) = self.resolve(&name) {
                        self.make_directory(&dir, mode).await;
                    }
                }
                TransferCommand::XferX509 => {
                    let dest = self.resolve(&name);
                    self.receive_delegation(&name, dest).await?
                }
                TransferCommand::DownloadUrl => {
                    let message = self.conn.expect_message().await?;
                    let TransferMessage::Url(url) = message else {
                        return Err(protocol_violation("url", &message));
                    };
                    if let Some(dest) = self.resolve(&name) {
                        self.fetch_url(&name, &url, &dest).await;
                    }
                }
                TransferCommand::Other => {
                    let message = self.conn.expect_message().await?;
                    let TransferMessage::SubCommand { code, info } = message else {
                        return Err(protocol_violation("sub-command", &message));
                    };
                    if code != SUBCOMMAND_UPLOAD_URL {
                        log::warn!("Ignoring unknown transfer sub-command {code} for {name}");
                    } else if info.get("Result").map(|r| r.as_str()) != Some("Success") {
                        let reason = info
                            .get("ErrorMessage")
                            .cloned()
                            .unwrap_or_else(|| format!("Peer failed to upload {name}"));
                        self.failures
                            .record(TransferFailure::hold(hold_codes::UPLOAD_FILE_ERROR, 0, reason));
                    }
                }
            }
        }

        let mut peer_failure = None;
        if self.features.contains(ProtocolFeatures::TRANSFER_ACK) {
            let message = self.conn.expect_message().await?;
            peer_failure = failure_from_ack(message);
        }
        if !self.failures.is_set() && peer_failure.is_none() {
            self.finish_spool(final_transfer);
        }
        if let Some(failure) = peer_failure {
            self.failures.record(failure);
        }
        if self.features.contains(ProtocolFeatures::TRANSFER_ACK) {
            let ack = make_ack(self.failures.get());
            self.conn.send(TransferMessage::Ack(ack)).await?;
        }
        Ok(())
    }

    async fn prepare_target(&mut self, final_transfer: bool) {
        if let (Some(spool), false) = (&self.config.spool_dir, final_transfer) {
            self.target = tmp_spool_for(spool);
            self.spooling = true;
        }
        if let Err(error) = tokio::fs::create_dir_all(&self.target).await {
            self.failures.record(TransferFailure::from_io(
                hold_codes::DOWNLOAD_FILE_ERROR,
                &error,
                format!("Cannot create {}", self.target.display()),
            ));
        }
    }

    fn finish_spool(&mut self, final_transfer: bool) {
        let Some(spool) = &self.config.spool_dir else {
            return;
        };
        let result = if final_transfer {
            commit_files(spool).map(|committed| {
                if committed {
                    log::debug!("Intermediate files committed into {}", spool.display());
                }
            })
        } else {
            write_commit_marker(&self.target)
        };
        if let Err(error) = result {
            self.failures.record(TransferFailure::from_io(
                hold_codes::DOWNLOAD_FILE_ERROR,
                &error,
                format!("Cannot commit spooled files in {}", spool.display()),
            ));
        }
    }

    fn resolve(&mut self, name: &str) -> Option<PathBuf> {
        let resolved = resolve_in_sandbox(&self.target, name);
        if resolved.is_none() {
            self.failures.record(TransferFailure::hold(
                hold_codes::DOWNLOAD_FILE_ERROR,
                EPERM,
                format!("Peer sent an illegal path: {name}"),
            ));
        }
        resolved
    }

    async fn go_ahead(&mut self, name: &str) -> Result<(), TransferFailure> {
        if !self.features.contains(ProtocolFeatures::GO_AHEAD) {
            return Ok(());
        }
        if !self.go_ahead.i_go_ahead_always {
            obtain_and_send_go_ahead(
                &mut self.conn,
                self.config,
                &mut self.go_ahead,
                self.progress,
                self.sandbox_size,
                true,
                name,
            )
            .await?;
        }
        if !self.go_ahead.peer_goes_ahead_always {
            receive_go_ahead(&mut self.conn, self.config, &mut self.go_ahead, self.progress)
                .await?;
        }
        Ok(())
    }

    async fn open_destination(&mut self, name: &str, path: Option<PathBuf>) -> Destination {
        let Some(path) = path else {
            return Destination::discard();
        };
        if let Some(parent) = path.parent() {
            if let Err(error) = tokio::fs::create_dir_all(parent).await {
                self.failures.record(TransferFailure::from_io(
                    hold_codes::DOWNLOAD_FILE_ERROR,
                    &error,
                    format!("Cannot create directory for {name}"),
                ));
                return Destination::discard();
            }
        }
        match tokio::fs::File::create(&path).await {
            Ok(file) => Destination::File { file, path },
            Err(error) => {
                self.failures.record(TransferFailure::from_io(
                    hold_codes::DOWNLOAD_FILE_ERROR,
                    &error,
                    format!("Cannot create {}", path.display()),
                ));
                Destination::discard()
            }
        }
    }

    async fn receive_file(
        &mut self,
        name: &str,
        path: Option<PathBuf>,
        encrypt: bool,
    ) -> Result<(), TransferFailure> {
        let message = self.conn.expect_message_as(encrypt).await?;
        let (mode, executable) = match message {
            TransferMessage::FileHeader {
                mode, executable, ..
            } => (mode, executable),
            TransferMessage::FileAbort { reason } => {
                self.failures.record(TransferFailure::hold(
                    hold_codes::UPLOAD_FILE_ERROR,
                    0,
                    format!("Peer could not send {name}: {reason}"),
                ));
                return Ok(());
            }
            other => return Err(protocol_violation("file header", &other)),
        };

        let mut dest = self.open_destination(name, path).await;
        let mut complete = true;
        loop {
            match self.conn.expect_message_as(encrypt).await? {
                TransferMessage::Chunk(data) => {
                    self.bytes += data.len() as u64;
                    if let Some(max) = self.config.max_download_bytes {
                        if self.bytes > max && complete {
                            complete = false;
                            self.failures.record(TransferFailure::hold(
                                self.config.side.download_limit_hold_code(),
                                0,
                                format!(
                                    "Sandbox exceeds the download limit of {max} bytes while receiving {name}"
                                ),
                            ));
                            dest.abandon().await;
                        }
                    }
                    if let Err(error) = dest.write_all(&data).await {
                        complete = false;
                        self.failures.record(TransferFailure::from_io(
                            hold_codes::DOWNLOAD_FILE_ERROR,
                            &error,
                            format!("Writing {name} failed"),
                        ));
                        dest.abandon().await;
                    }
                }
                TransferMessage::FileEnd => break,
                TransferMessage::FileAbort { reason } => {
                    complete = false;
                    self.failures.record(TransferFailure::hold(
                        hold_codes::UPLOAD_FILE_ERROR,
                        0,
                        format!("Peer aborted sending {name}: {reason}"),
                    ));
                    dest.abandon().await;
                    break;
                }
                other => return Err(protocol_violation("file data", &other)),
            }
        }

        let flushed = match &mut dest {
            Destination::File { file, path } => Some((file.flush().await, path.clone())),
            Destination::Discard(_) => None,
        };
        match flushed {
            Some((Err(error), _)) => {
                self.failures.record(TransferFailure::from_io(
                    hold_codes::DOWNLOAD_FILE_ERROR,
                    &error,
                    format!("Writing {name} failed"),
                ));
                dest.abandon().await;
            }
            Some((Ok(()), path)) => {
                let mode = if executable { mode | 0o111 } else { mode };
                if let Err(error) = set_mode(&path, mode).await {
                    self.failures.record(TransferFailure::from_io(
                        hold_codes::DOWNLOAD_FILE_ERROR,
                        &error,
                        format!("Cannot set permissions of {name}"),
                    ));
                }
                if complete {
                    self.files += 1;
                    if self.spooling {
                        self.spooled_files.push(name.to_string());
                    }
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn make_directory(&mut self, dir: &Path, mode: u32) {
        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            set_mode(dir, mode | 0o700).await
        }
        .await;
        if let Err(error) = result {
            self.failures.record(TransferFailure::from_io(
                hold_codes::DOWNLOAD_FILE_ERROR,
                &error,
                format!("Cannot create directory {}", dir.display()),
            ));
        }
    }

    async fn receive_delegation(
        &mut self,
        name: &str,
        path: Option<PathBuf>,
    ) -> Result<(), TransferFailure> {
        let data = match self.conn.expect_message().await? {
            TransferMessage::Delegation { expiration, data } => {
                log::debug!("Received delegated credential {name} (expiration: {expiration:?})");
                data
            }
            TransferMessage::FileAbort { reason } => {
                self.failures.record(TransferFailure::hold(
                    hold_codes::UPLOAD_FILE_ERROR,
                    0,
                    format!("Peer could not delegate {name}: {reason}"),
                ));
                return Ok(());
            }
            other => return Err(protocol_violation("delegation", &other)),
        };
        let Some(path) = path else {
            return Ok(());
        };
        let result = async {
            tokio::fs::write(&path, &data).await?;
            set_mode(&path, 0o600).await
        }
        .await;
        match result {
            Ok(()) => self.files += 1,
            Err(error) => self.failures.record(TransferFailure::from_io(
                hold_codes::DOWNLOAD_FILE_ERROR,
                &error,
                format!("Cannot store credential {name}"),
            )),
        }
        Ok(())
    }

    async fn fetch_url(&mut self, name: &str, url: &str, dest: &Path) {
        match self.config.plugins.download(url, dest).await {
            Ok(bytes) => {
                self.bytes += bytes;
                self.files += 1;
            }
            Err(error) => self.failures.record(TransferFailure::hold(
                hold_codes::DOWNLOAD_FILE_ERROR,
                0,
                format!("Downloading {name} from {url} failed: {error:#}"),
            )),
        }
    }
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await
}
