use std::path::Path;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::Map;
use crate::connection::Connection;
use crate::internal::filetransfer::config::FileTransferConfig;
use crate::internal::filetransfer::engine::Progress;
use crate::internal::filetransfer::goahead::{
    GoAheadState, obtain_and_send_go_ahead, receive_go_ahead,
};
use crate::internal::filetransfer::info::{
    FirstFailure, TransferFailure, TransferInfo, hold_codes,
};
use crate::internal::filetransfer::items::{
    FileTransferItem, ItemKind, expand_file_list, sandbox_size,
};
use crate::internal::filetransfer::paths::base_name;
use crate::internal::messages::transfer::{
    ProtocolFeatures, SUBCOMMAND_UPLOAD_URL, TransferAck, TransferCommand, TransferMessage,
};

type Conn<T> = Connection<TransferMessage, TransferMessage, T>;

/// Both sides announce their features; the intersection is used.
pub(crate) async fn exchange_hello<T: AsyncRead + AsyncWrite>(
    conn: &mut Conn<T>,
    features: ProtocolFeatures,
) -> crate::Result<ProtocolFeatures> {
    conn.send(TransferMessage::Hello { features }).await?;
    match conn.expect_message().await? {
        TransferMessage::Hello { features: peer } => Ok(features & peer),
        other => Err(crate::Error::ProtocolError(format!(
            "Expected hello, received {}",
            other.kind()
        ))),
    }
}

pub(crate) fn make_ack(failure: Option<&TransferFailure>) -> TransferAck {
    match failure {
        None => TransferAck {
            result: 0,
            hold_code: 0,
            hold_subcode: 0,
            reason: None,
        },
        Some(failure) => TransferAck {
            result: if failure.try_again { 1 } else { -1 },
            hold_code: failure.hold_code,
            hold_subcode: failure.hold_subcode,
            // The reason travels as a single line
            reason: Some(failure.reason.replace('\n', "\\n")),
        },
    }
}

pub(crate) fn failure_from_ack(message: TransferMessage) -> Option<TransferFailure> {
    match message {
        TransferMessage::Ack(ack) if ack.result == 0 => None,
        TransferMessage::Ack(ack) => Some(TransferFailure {
            try_again: ack.result > 0,
            hold_code: ack.hold_code,
            hold_subcode: ack.hold_subcode,
            reason: ack
                .reason
                .map(|r| r.replace("\\n", "\n"))
                .unwrap_or_else(|| "Peer reported a failed transfer".to_string()),
        }),
        other => Some(TransferFailure::hold(
            hold_codes::INVALID_TRANSFER_ACK,
            0,
            format!("Expected transfer acknowledgement, received {}", other.kind()),
        )),
    }
}

struct Uploader<'a, T> {
    conn: Conn<T>,
    config: &'a FileTransferConfig,
    progress: &'a Progress,
    features: ProtocolFeatures,
    go_ahead: GoAheadState,
    failures: FirstFailure,
    sandbox_size: u64,
    bytes: u64,
    files: u32,
}

pub(crate) async fn upload_sandbox<T: AsyncRead + AsyncWrite>(
    mut conn: Conn<T>,
    config: &FileTransferConfig,
    final_transfer: bool,
    progress: &Progress,
) -> TransferInfo {
    let start = Instant::now();
    let mut info = TransferInfo::started(true);

    let features = match exchange_hello(&mut conn, config.features).await {
        Ok(features) => features,
        Err(error) => {
            info.finish(Some(error.into()));
            return info;
        }
    };
    let mut uploader = Uploader {
        conn,
        config,
        progress,
        features,
        go_ahead: GoAheadState::default(),
        failures: FirstFailure::default(),
        sandbox_size: 0,
        bytes: 0,
        files: 0,
    };
    let failure = match uploader.run(final_transfer).await {
        Ok(()) => uploader.failures.take(),
        Err(abort) => {
            uploader.failures.record(abort);
            uploader.failures.take()
        }
    };
    info.bytes = uploader.bytes;
    info.files = uploader.files;
    info.duration = start.elapsed();
    info.finish(failure);
    log::debug!(
        "Upload of {} file(s) ({} bytes) finished in {:?}: success={}",
        info.files,
        info.bytes,
        info.duration,
        info.success
    );
    info
}

impl<T: AsyncRead + AsyncWrite> Uploader<'_, T> {
    async fn run(&mut self, final_transfer: bool) -> Result<(), TransferFailure> {
        let config = self.config;
        let (items, errors) = expand_file_list(
            &config.files,
            &config.sandbox_dir,
            config.executable.as_deref(),
            &config.output_destinations,
        );
        for error in &errors {
            log::warn!("Skipping input entry: {error}");
            self.failures.record(TransferFailure::from_io(
                hold_codes::UPLOAD_FILE_ERROR,
                &error.error,
                format!("Cannot read input entry {}", error.entry),
            ));
        }
        self.sandbox_size = sandbox_size(&items);
        let announced_size = self
            .features
            .contains(ProtocolFeatures::SANDBOX_SIZE)
            .then_some(self.sandbox_size);
        self.conn
            .send(TransferMessage::Header {
                final_transfer,
                sandbox_size: announced_size,
            })
            .await?;

        if let Some(proxy) = &config.proxy_file {
            self.send_proxy(proxy).await?;
        }
        for item in &items {
            if let Some(url) = &item.dest_url {
                self.upload_to_url(item, url).await?;
                continue;
            }
            match item.kind {
                ItemKind::Directory => {
                    self.send_command(TransferCommand::Mkdir, &item.dest_name)
                        .await?;
                    self.conn.send(TransferMessage::DirMode(item.mode)).await?;
                }
                ItemKind::Url => {
                    self.send_command(TransferCommand::DownloadUrl, &item.dest_name)
                        .await?;
                    self.conn
                        .send(TransferMessage::Url(item.source.clone()))
                        .await?;
                }
                ItemKind::File => self.send_file(item).await?,
            }
        }
        self.send_command(TransferCommand::Finished, "").await?;

        if self.features.contains(ProtocolFeatures::TRANSFER_ACK) {
            let ack = make_ack(self.failures.get());
            self.conn.send(TransferMessage::Ack(ack)).await?;
            let message = self.conn.expect_message().await?;
            if let Some(failure) = failure_from_ack(message) {
                self.failures.record(failure);
            }
        }
        Ok(())
    }

    async fn send_command(&mut self, command: TransferCommand, name: &str) -> crate::Result<()> {
        self.conn
            .send(TransferMessage::Command {
                code: command.code(),
                name: name.to_string(),
            })
            .await
    }

    async fn send_proxy(&mut self, proxy: &Path) -> Result<(), TransferFailure> {
        let name = base_name(&proxy.to_string_lossy()).to_string();
        self.send_command(TransferCommand::XferX509, &name).await?;
        match tokio::fs::read(proxy).await {
            Ok(data) => {
                self.conn
                    .send(TransferMessage::Delegation {
                        expiration: None,
                        data,
                    })
                    .await?;
                self.files += 1;
            }
            Err(error) => {
                self.failures.record(TransferFailure::from_io(
                    hold_codes::UPLOAD_FILE_ERROR,
                    &error,
                    format!("Cannot read credential {}", proxy.display()),
                ));
                self.conn
                    .send(TransferMessage::FileAbort {
                        reason: error.to_string(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn upload_to_url(
        &mut self,
        item: &FileTransferItem,
        url: &str,
    ) -> Result<(), TransferFailure> {
        let mut info = Map::new();
        info.insert("Url".to_string(), url.to_string());
        match self
            .config
            .plugins
            .upload(Path::new(&item.source), url)
            .await
        {
            Ok(bytes) => {
                info.insert("Result".to_string(), "Success".to_string());
                self.bytes += bytes;
                self.files += 1;
            }
            Err(error) => {
                let reason = format!("Uploading {} to {url} failed: {error:#}", item.dest_name);
                info.insert("Result".to_string(), "Failed".to_string());
                info.insert("ErrorMessage".to_string(), reason.clone());
                self.failures
                    .record(TransferFailure::hold(hold_codes::UPLOAD_FILE_ERROR, 0, reason));
            }
        }
        self.send_command(TransferCommand::Other, &item.dest_name)
            .await?;
        self.conn
            .send(TransferMessage::SubCommand {
                code: SUBCOMMAND_UPLOAD_URL,
                info,
            })
            .await?;
        Ok(())
    }

    async fn go_ahead(&mut self, item: &FileTransferItem) -> Result<(), TransferFailure> {
        if !self.features.contains(ProtocolFeatures::GO_AHEAD) {
            return Ok(());
        }
        if !self.go_ahead.peer_goes_ahead_always {
            receive_go_ahead(&mut self.conn, self.config, &mut self.go_ahead, self.progress)
                .await?;
        }
        if !self.go_ahead.i_go_ahead_always {
            obtain_and_send_go_ahead(
                &mut self.conn,
                self.config,
                &mut self.go_ahead,
                self.progress,
                self.sandbox_size,
                false,
                &item.dest_name,
            )
            .await?;
            log::debug!(
                "Go-ahead obtained for {} (queue slot held: {})",
                item.dest_name,
                self.go_ahead.holds_slot()
            );
        }
        Ok(())
    }

    async fn send_file(&mut self, item: &FileTransferItem) -> Result<(), TransferFailure> {
        let session_encrypted = self.conn.is_encrypted();
        let choice = self.config.wants_encryption(&item.dest_name);
        if choice == Some(true) && !session_encrypted {
            self.failures.record(TransferFailure::hold(
                hold_codes::UPLOAD_FILE_ERROR,
                0,
                format!(
                    "{} requires encryption, but the connection is not encrypted",
                    item.dest_name
                ),
            ));
            return Ok(());
        }
        let (command, encrypt) = match choice.unwrap_or(self.config.encrypt_by_default) {
            _ if !session_encrypted => (TransferCommand::XferFile, false),
            true if choice.is_some() => (TransferCommand::EnableEncryption, true),
            true => (TransferCommand::XferFile, true),
            false => (TransferCommand::DisableEncryption, false),
        };
        self.send_command(command, &item.dest_name).await?;
        self.go_ahead(item).await?;

        let limit = match (self.config.max_upload_bytes, self.go_ahead.peer_max_transfer_bytes) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(limit) = limit {
            if self.bytes + item.size > limit {
                let reason = format!(
                    "Transferring {} would exceed the sandbox size limit of {limit} bytes",
                    item.dest_name
                );
                self.failures.record(TransferFailure::hold(
                    self.config.side.upload_limit_hold_code(),
                    0,
                    reason.clone(),
                ));
                self.conn
                    .send_as(TransferMessage::FileAbort { reason }, encrypt)
                    .await?;
                return Ok(());
            }
        }

        let mut file = match tokio::fs::File::open(&item.source).await {
            Ok(file) => file,
            Err(error) => {
                self.failures.record(TransferFailure::from_io(
                    hold_codes::UPLOAD_FILE_ERROR,
                    &error,
                    format!("Cannot open {}", item.source),
                ));
                self.conn
                    .send_as(
                        TransferMessage::FileAbort {
                            reason: error.to_string(),
                        },
                        encrypt,
                    )
                    .await?;
                return Ok(());
            }
        };
        self.conn
            .send_as(
                TransferMessage::FileHeader {
                    size: item.size,
                    mode: item.mode,
                    executable: item.executable,
                },
                encrypt,
            )
            .await?;

        let mut buffer = vec![0u8; self.config.chunk_size];
        loop {
            let n = match file.read(&mut buffer).await {
                Ok(n) => n,
                Err(error) => {
                    self.failures.record(TransferFailure::from_io(
                        hold_codes::UPLOAD_FILE_ERROR,
                        &error,
                        format!("Reading {} failed", item.source),
                    ));
                    self.conn
                        .send_as(
                            TransferMessage::FileAbort {
                                reason: error.to_string(),
                            },
                            encrypt,
                        )
                        .await?;
                    return Ok(());
                }
            };
            if n == 0 {
                break;
            }
            self.conn
                .send_as(TransferMessage::Chunk(buffer[..n].to_vec()), encrypt)
                .await?;
            self.bytes += n as u64;
        }
        self.conn.send_as(TransferMessage::FileEnd, encrypt).await?;
        self.files += 1;
        Ok(())
    }
}
