use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use orion::kdf::SecretKey;
use tempfile::TempDir;
use tokio::io::DuplexStream;

use crate::Map;
use crate::connection::Connection;
use crate::internal::filetransfer::commit::{COMMIT_FILENAME, tmp_spool_for};
use crate::internal::filetransfer::config::{FileTransferConfigBuilder, TransferSide};
use crate::internal::filetransfer::engine::{FileTransfer, TransferMode};
use crate::internal::filetransfer::info::{TransferStatus, hold_codes};
use crate::internal::filetransfer::queue::{SlotPoll, TransferQueue};
use crate::internal::filetransfer::registry::{
    RequestState, TransferDirection, TransferRequestRegistry,
};
use crate::internal::filetransfer::server::{
    queue_transfer_request, serve_transfer_connection, start_requested_transfer,
};
use crate::internal::messages::transfer::{ProtocolFeatures, TransferCommand, TransferMessage};

type TestConnection = Connection<TransferMessage, TransferMessage, DuplexStream>;

const PROTOCOL: u32 = 1;

fn init_log() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

async fn connect(key: Option<Arc<SecretKey>>) -> (TestConnection, TestConnection) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (uploader, downloader) = tokio::join!(
        TestConnection::init_stream(a, PROTOCOL, "uploader", "downloader", key.clone()),
        TestConnection::init_stream(b, PROTOCOL, "downloader", "uploader", key)
    );
    (uploader.unwrap(), downloader.unwrap())
}

fn sandbox(prefix: &str) -> TempDir {
    TempDir::with_prefix(prefix).unwrap()
}

fn write_file(dir: &Path, name: &str, content: &[u8]) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn uploader(dir: &Path, files: &[&str]) -> FileTransferConfigBuilder {
    FileTransferConfigBuilder::default()
        .sandbox_dir(dir)
        .files(files.iter().map(|f| f.to_string()).collect())
}

fn downloader(dir: &Path) -> FileTransferConfigBuilder {
    FileTransferConfigBuilder::default().sandbox_dir(dir)
}

async fn run_transfer(
    upload: FileTransferConfigBuilder,
    download: FileTransferConfigBuilder,
    key: Option<Arc<SecretKey>>,
    final_transfer: bool,
) -> (FileTransfer, FileTransfer) {
    init_log();
    let (up_conn, down_conn) = connect(key).await;
    let mut up = FileTransfer::new(upload.build().unwrap());
    let mut down = FileTransfer::new(download.build().unwrap());
    tokio::join!(
        up.upload(up_conn, TransferMode::Blocking, final_transfer),
        down.download(down_conn, TransferMode::Blocking)
    );
    (up, down)
}

#[tokio::test]
async fn test_three_files_through_transfer_queue() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "run.sh", b"#!/bin/sh\necho hi\n");
    write_file(src.path(), "input.dat", &[7u8; 1000]);
    write_file(src.path(), "data/params.txt", b"a=1");

    let upload = uploader(src.path(), &["run.sh", "input.dat", "data"])
        .executable("run.sh")
        .chunk_size(64);
    let download = downloader(dst.path())
        .transfer_queue(TransferQueue::new(1))
        .min_bytes_to_queue(0);
    let (up, down) = run_transfer(upload, download, None, true).await;

    assert!(up.info().success, "{:?}", up.info());
    assert!(down.info().success, "{:?}", down.info());
    assert_eq!(down.info().files, 3);
    assert_eq!(down.info().bytes, 1000 + 18 + 3);
    assert_eq!(down.info().status, TransferStatus::Done);

    assert_eq!(
        fs::read(dst.path().join("input.dat")).unwrap(),
        vec![7u8; 1000]
    );
    assert_eq!(
        fs::read_to_string(dst.path().join("data/params.txt")).unwrap(),
        "a=1"
    );
    let mode = fs::metadata(dst.path().join("run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o111, 0);
    let mode = fs::metadata(dst.path().join("input.dat"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o111, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_transfer_is_kept_alive_until_slot_frees() {
    init_log();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let src = sandbox("src");
            let dst = sandbox("dst");
            write_file(src.path(), "input.dat", &[3u8; 100]);

            let queue = TransferQueue::new(1);
            let permit = match queue.request_slot("other").poll(Duration::from_secs(1)).await {
                SlotPoll::Granted(permit) => permit,
                _ => panic!("the only slot must be granted"),
            };

            let (up_conn, down_conn) = connect(None).await;
            let mut up = FileTransfer::new(uploader(src.path(), &["input.dat"]).build().unwrap());
            let mut down = FileTransfer::new(
                downloader(dst.path())
                    .transfer_queue(queue.clone())
                    .min_bytes_to_queue(0)
                    .build()
                    .unwrap(),
            );
            assert!(up.upload(up_conn, TransferMode::Background, true).await);
            assert!(down.download(down_conn, TransferMode::Background).await);

            // Several alive intervals pass; the uploader would time out without keep-alives
            tokio::time::sleep(Duration::from_secs(1000)).await;
            assert!(!up.poll_updates());
            assert!(!down.poll_updates());
            assert_eq!(up.info().status, TransferStatus::Queued);
            assert_eq!(down.info().status, TransferStatus::Queued);
            assert!(!dst.path().join("input.dat").exists());

            drop(permit);
            let info = down.wait().await;
            assert!(info.success, "{info:?}");
            assert_eq!(info.status, TransferStatus::Done);
            assert!(up.wait().await.success);
            assert_eq!(
                fs::read(dst.path().join("input.dat")).unwrap(),
                vec![3u8; 100]
            );
            assert_eq!(queue.active_transfers(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_encrypted_session_with_plain_file() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "secret.txt", b"secret");
    write_file(src.path(), "public.txt", b"public");

    let key = Arc::new(SecretKey::generate(32).unwrap());
    let upload = uploader(src.path(), &["secret.txt", "public.txt"])
        .encrypt_files(vec!["secret.txt".into()])
        .dont_encrypt_files(vec!["public.txt".into()]);
    let (up, down) = run_transfer(upload, downloader(dst.path()), Some(key), true).await;

    assert!(up.info().success);
    assert!(down.info().success);
    assert_eq!(
        fs::read_to_string(dst.path().join("public.txt")).unwrap(),
        "public"
    );
    assert_eq!(
        fs::read_to_string(dst.path().join("secret.txt")).unwrap(),
        "secret"
    );
}

#[tokio::test]
async fn test_required_encryption_without_key_fails() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "secret.txt", b"secret");

    let upload = uploader(src.path(), &["secret.txt"]).encrypt_files(vec!["secret.txt".into()]);
    let (up, down) = run_transfer(upload, downloader(dst.path()), None, true).await;

    assert!(!up.info().success);
    assert_eq!(up.info().hold_code, hold_codes::UPLOAD_FILE_ERROR);
    assert!(!down.info().success);
    assert!(!dst.path().join("secret.txt").exists());
}

#[tokio::test]
async fn test_receiver_download_limit() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "small.txt", b"12345");
    write_file(src.path(), "big.dat", &[1u8; 100]);

    // Without go-ahead the sender never learns the limit, the receiver enforces it
    let upload = uploader(src.path(), &["small.txt", "big.dat"])
        .features(ProtocolFeatures::TRANSFER_ACK | ProtocolFeatures::SANDBOX_SIZE)
        .side(TransferSide::Execute)
        .chunk_size(16);
    let download = downloader(dst.path())
        .side(TransferSide::Submit)
        .max_download_bytes(50);
    let (up, down) = run_transfer(upload, download, None, true).await;

    let info = down.info();
    assert!(!info.success);
    assert!(!info.try_again);
    assert_eq!(info.hold_code, hold_codes::MAX_TRANSFER_OUTPUT_SIZE_EXCEEDED);
    assert!(dst.path().join("small.txt").exists());
    assert!(!dst.path().join("big.dat").exists());

    // The failure is reported back to the sender through the acknowledgement
    let info = up.info();
    assert!(!info.success);
    assert_eq!(info.hold_code, hold_codes::MAX_TRANSFER_OUTPUT_SIZE_EXCEEDED);
}

#[tokio::test]
async fn test_sender_respects_advertised_limit() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "big.dat", &[1u8; 100]);

    let upload = uploader(src.path(), &["big.dat"]).side(TransferSide::Submit);
    let download = downloader(dst.path())
        .side(TransferSide::Execute)
        .max_download_bytes(10);
    let (up, down) = run_transfer(upload, download, None, true).await;

    assert_eq!(
        up.info().hold_code,
        hold_codes::MAX_TRANSFER_INPUT_SIZE_EXCEEDED
    );
    assert_eq!(up.info().bytes, 0);
    assert!(!down.info().success);
    assert!(!dst.path().join("big.dat").exists());
}

#[tokio::test]
async fn test_missing_input_is_reported_to_peer() {
    let src = sandbox("src");
    let dst = sandbox("dst");

    let upload = uploader(src.path(), &["missing.txt"]);
    let (up, down) = run_transfer(upload, downloader(dst.path()), None, true).await;

    assert_eq!(up.info().hold_code, hold_codes::UPLOAD_FILE_ERROR);
    assert_eq!(up.info().hold_subcode, 2);
    assert!(up.info().error_description.contains("missing.txt"));
    assert_eq!(down.info().hold_code, hold_codes::UPLOAD_FILE_ERROR);
}

#[tokio::test]
async fn test_missing_input_does_not_stop_other_files() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "a.txt", b"a");
    write_file(src.path(), "b.txt", b"bb");

    let upload = uploader(src.path(), &["a.txt", "missing.txt", "gone.txt", "b.txt"]);
    let (up, down) = run_transfer(upload, downloader(dst.path()), None, true).await;

    assert_eq!(up.info().files, 2);
    assert_eq!(up.info().bytes, 3);
    assert_eq!(up.info().hold_code, hold_codes::UPLOAD_FILE_ERROR);
    assert!(up.info().error_description.contains("missing.txt"));
    assert!(!up.info().error_description.contains("gone.txt"));
    assert_eq!(down.info().files, 2);
    assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "a");
    assert_eq!(fs::read_to_string(dst.path().join("b.txt")).unwrap(), "bb");
}

#[tokio::test]
async fn test_illegal_path_is_discarded() {
    init_log();
    let root = sandbox("root");
    let dst = root.path().join("sandbox");
    fs::create_dir_all(&dst).unwrap();

    let (mut peer, down_conn) = connect(None).await;
    let mut down = FileTransfer::new(downloader(&dst).build().unwrap());

    let malicious = async {
        peer.send(TransferMessage::Hello {
            features: ProtocolFeatures::empty(),
        })
        .await
        .unwrap();
        assert!(matches!(
            peer.expect_message().await.unwrap(),
            TransferMessage::Hello { .. }
        ));
        let messages = vec![
            TransferMessage::Header {
                final_transfer: true,
                sandbox_size: None,
            },
            TransferMessage::Command {
                code: TransferCommand::XferFile.code(),
                name: "../escape.txt".to_string(),
            },
            TransferMessage::FileHeader {
                size: 4,
                mode: 0o644,
                executable: false,
            },
            TransferMessage::Chunk(b"evil".to_vec()),
            TransferMessage::FileEnd,
            TransferMessage::Command {
                code: TransferCommand::XferFile.code(),
                name: "ok.txt".to_string(),
            },
            TransferMessage::FileHeader {
                size: 2,
                mode: 0o644,
                executable: false,
            },
            TransferMessage::Chunk(b"ok".to_vec()),
            TransferMessage::FileEnd,
            TransferMessage::Command {
                code: TransferCommand::Finished.code(),
                name: String::new(),
            },
        ];
        for message in messages {
            peer.send(message).await.unwrap();
        }
    };
    tokio::join!(malicious, down.download(down_conn, TransferMode::Blocking));

    let info = down.info();
    assert!(!info.success);
    assert_eq!(info.hold_code, hold_codes::DOWNLOAD_FILE_ERROR);
    assert_eq!(info.hold_subcode, 1);
    assert!(!root.path().join("escape.txt").exists());
    assert_eq!(fs::read_to_string(dst.join("ok.txt")).unwrap(), "ok");
}

#[tokio::test]
async fn test_intermediate_files_are_committed_by_final_transfer() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    let spool_root = sandbox("spool");
    let spool = spool_root.path().join("job_1_0");
    write_file(src.path(), "checkpoint", b"v1");
    write_file(&spool, "checkpoint", b"v0");

    let upload = uploader(src.path(), &["checkpoint"]);
    let download = downloader(dst.path()).spool_dir(&spool);
    let (up, down) = run_transfer(upload, download, None, false).await;
    assert!(up.info().success);
    assert_eq!(down.info().spooled_files, vec!["checkpoint".to_string()]);
    let tmp = tmp_spool_for(&spool);
    assert!(tmp.join(COMMIT_FILENAME).exists());
    assert_eq!(fs::read_to_string(spool.join("checkpoint")).unwrap(), "v0");

    write_file(src.path(), "result.txt", b"done");
    let upload = uploader(src.path(), &["result.txt"]);
    let download = downloader(dst.path()).spool_dir(&spool);
    let (_, down) = run_transfer(upload, download, None, true).await;
    assert!(down.info().success);
    assert!(down.info().spooled_files.is_empty());
    assert_eq!(fs::read_to_string(spool.join("checkpoint")).unwrap(), "v1");
    assert_eq!(
        fs::read_to_string(dst.path().join("result.txt")).unwrap(),
        "done"
    );
    assert!(!tmp.exists());
}

#[tokio::test]
async fn test_url_entries_and_output_destinations() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    let remote = sandbox("remote");
    write_file(remote.path(), "dataset.csv", b"x,y");
    write_file(src.path(), "out.log", b"log");

    let url = format!("file://{}", remote.path().join("dataset.csv").display());
    let mut destinations = Map::new();
    destinations.insert(
        "out.log".to_string(),
        format!("file://{}", remote.path().join("out.log").display()),
    );
    let upload = uploader(src.path(), &[url.as_str(), "out.log"]).output_destinations(destinations);
    let (up, down) = run_transfer(upload, downloader(dst.path()), None, true).await;

    assert!(up.info().success, "{:?}", up.info());
    assert!(down.info().success, "{:?}", down.info());
    assert_eq!(
        fs::read_to_string(dst.path().join("dataset.csv")).unwrap(),
        "x,y"
    );
    assert_eq!(
        fs::read_to_string(remote.path().join("out.log")).unwrap(),
        "log"
    );
    assert!(!dst.path().join("out.log").exists());
}

#[tokio::test]
async fn test_proxy_is_delegated() {
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "x509up_u1000", b"credential");

    let key = Arc::new(SecretKey::generate(32).unwrap());
    let upload = uploader(src.path(), &[]).proxy_file(src.path().join("x509up_u1000"));
    let (up, down) = run_transfer(upload, downloader(dst.path()), Some(key), true).await;

    assert!(up.info().success);
    assert!(down.info().success);
    let path = dst.path().join("x509up_u1000");
    assert_eq!(fs::read_to_string(&path).unwrap(), "credential");
    assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
}

#[tokio::test]
async fn test_background_transfer() {
    init_log();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let src = sandbox("src");
            let dst = sandbox("dst");
            write_file(src.path(), "a.txt", b"a");

            let (up_conn, down_conn) = connect(None).await;
            let mut up = FileTransfer::new(uploader(src.path(), &["a.txt"]).build().unwrap());
            let mut down = FileTransfer::new(downloader(dst.path()).build().unwrap());

            assert!(
                up.upload(up_conn, TransferMode::Background, true)
                    .await
            );
            assert!(up.is_running());
            let (spare, _peer) = connect(None).await;
            assert!(!up.upload(spare, TransferMode::Background, true).await);

            assert!(down.download(down_conn, TransferMode::Blocking).await);
            assert!(up.wait().await.success);
            assert!(!up.is_running());
            assert!(up.poll_updates());
        })
        .await;
}

#[tokio::test]
async fn test_transfer_through_request_registry() {
    init_log();
    let src = sandbox("src");
    let dst = sandbox("dst");
    write_file(src.path(), "input.txt", b"input");
    let registry = TransferRequestRegistry::new_ref();

    let mut ad = Map::new();
    ad.insert("ClusterId".to_string(), "12".to_string());
    let (mut client, server) = connect(None).await;
    let (token, served) = tokio::join!(
        queue_transfer_request(&mut client, TransferDirection::Upload, vec![ad]),
        serve_transfer_connection(server, &registry, |_| Err("not a transfer".into()))
    );
    let token = token.unwrap();
    assert!(served.unwrap().is_none());
    assert_eq!(
        registry.get().get(&token).unwrap().state,
        RequestState::Queued
    );

    let (mut client, server) = connect(None).await;
    let upload_config = uploader(src.path(), &["input.txt"]).build().unwrap();
    let client_side = async {
        start_requested_transfer(&mut client, &token).await.unwrap();
        let mut transfer = FileTransfer::new(upload_config);
        transfer
            .upload(client, TransferMode::Blocking, true)
            .await
    };
    let dst_path = dst.path().to_path_buf();
    let (uploaded, served) = tokio::join!(
        client_side,
        serve_transfer_connection(server, &registry, |request| {
            assert_eq!(request.job_ads[0]["ClusterId"], "12");
            Ok(downloader(&dst_path).build().unwrap())
        })
    );
    assert!(uploaded);
    assert!(served.unwrap().unwrap().success);
    assert_eq!(
        fs::read_to_string(dst.path().join("input.txt")).unwrap(),
        "input"
    );
    assert_eq!(
        registry.get().get(&token).unwrap().state,
        RequestState::Done { success: true }
    );

    // The capability cannot be used twice
    let (mut client, server) = connect(None).await;
    let (started, _) = tokio::join!(
        start_requested_transfer(&mut client, &token),
        serve_transfer_connection(server, &registry, |_| Err("unused".into()))
    );
    assert!(started.is_err());
}
