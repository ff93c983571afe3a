//! Daemon that stores job sandboxes and streams them to and from remote clients.
//!
//! A client first queues a request describing the job and receives a capability token.
//! Presenting the token on a later connection runs the transfer.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context;
use derive_builder::Builder;
use itertools::Itertools;
use orion::kdf::SecretKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::queue::{AttrValue, JobAttributes, JobConstraint};
use sandbox::transfer::{
    FileTransferConfig, FileTransferConfigBuilder, TransferConnection, TransferDirection,
    TransferQueue, TransferRequest, TransferRequestRegistry, TransferRequestRegistryRef,
    serve_transfer_connection,
};

pub const TRANSFER_PROTOCOL: u32 = 1;
pub const DAEMON_ROLE: &str = "transferd";
pub const CLIENT_ROLE: &str = "transfer-client";

const KEY_LENGTH: usize = 32;
/// Comma separated list of files a client downloads from the sandbox.
pub const TRANSFER_OUTPUT_ATTR: &str = "TransferOutput";

/// Sandboxes streamed at the same time.
pub const DEFAULT_MAX_TRANSFERS: usize = 10;

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct TransferDaemonConfig {
    /// Zero picks a free port.
    #[builder(default)]
    pub port: u16,
    /// Hex encoded access key; connections are not encrypted without it.
    #[builder(default)]
    pub key_file: Option<PathBuf>,
    #[builder(setter(into))]
    pub sandbox_root: PathBuf,
    #[builder(default = "DEFAULT_MAX_TRANSFERS")]
    pub max_transfers: usize,
    /// Only sandboxes of matching jobs are transferred.
    #[builder(default)]
    pub constraint: Option<JobConstraint>,
}

pub fn generate_key() -> anyhow::Result<SecretKey> {
    Ok(SecretKey::generate(KEY_LENGTH)?)
}

pub fn serialize_key(key: &SecretKey) -> String {
    hex::encode(key.unprotected_as_bytes())
}

pub fn deserialize_key(key: &str) -> anyhow::Result<SecretKey> {
    let data = hex::decode(key.trim())?;
    Ok(SecretKey::from_slice(&data)?)
}

/// Reads the access key from `path`, a missing file is created with a fresh key.
pub fn load_or_create_key(path: &Path) -> anyhow::Result<Arc<SecretKey>> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read access key {}", path.display()))?;
        let key = deserialize_key(&text)
            .with_context(|| format!("Invalid access key in {}", path.display()))?;
        return Ok(Arc::new(key));
    }
    let key = generate_key()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Cannot create access key {}", path.display()))?;
        file.write_all(serialize_key(&key).as_bytes())?;
    }
    log::info!("Generated a new access key in {}", path.display());
    Ok(Arc::new(key))
}

pub struct TransferDaemon {
    registry: TransferRequestRegistryRef,
    queue: TransferQueue,
    sandbox_root: PathBuf,
    constraint: Option<JobConstraint>,
    key: Option<Arc<SecretKey>>,
}

impl TransferDaemon {
    pub fn new(config: TransferDaemonConfig, key: Option<Arc<SecretKey>>) -> Self {
        Self {
            registry: TransferRequestRegistry::new_ref(),
            queue: TransferQueue::new(config.max_transfers),
            sandbox_root: config.sandbox_root,
            constraint: config.constraint,
            key,
        }
    }

    pub fn registry(&self) -> &TransferRequestRegistryRef {
        &self.registry
    }

    pub fn sandbox_dir(&self, cluster: &str, proc: &str) -> PathBuf {
        self.sandbox_root.join(format!("{cluster}.{proc}"))
    }

    fn make_config(&self, request: &TransferRequest) -> sandbox::Result<FileTransferConfig> {
        let ad = request
            .job_ads
            .first()
            .ok_or("Transfer request does not describe a job")?;
        let (Some(cluster), Some(proc)) = (ad.get("ClusterId"), ad.get("ProcId")) else {
            return Err("Transfer request is missing the job id".into());
        };
        if let Some(constraint) = &self.constraint {
            let attrs: JobAttributes = ad
                .iter()
                .map(|(name, value)| (name.clone(), AttrValue::parse(value)))
                .collect();
            if !constraint.matches(&attrs) {
                return Err(format!("Job {cluster}.{proc} is not served by this daemon").into());
            }
        }
        let directory = self.sandbox_dir(cluster, proc);
        let builder = FileTransferConfigBuilder::default()
            .sandbox_dir(directory.clone())
            .transfer_queue(self.queue.clone());
        let builder = match request.direction {
            TransferDirection::Upload => {
                std::fs::create_dir_all(&directory)?;
                log::debug!("Receiving sandbox of {cluster}.{proc}");
                builder
            }
            TransferDirection::Download => {
                if !directory.is_dir() {
                    return Err(format!("No sandbox is stored for {cluster}.{proc}").into());
                }
                let files: Vec<String> = ad
                    .get(TRANSFER_OUTPUT_ATTR)
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                log::debug!(
                    "Sending {} of {cluster}.{proc}",
                    if files.is_empty() {
                        "nothing".to_string()
                    } else {
                        files.iter().join(", ")
                    }
                );
                builder.files(files)
            }
        };
        builder.build().map_err(|error| error.to_string().into())
    }

    /// Handles one client connection whose handshake is already done.
    pub async fn serve_client<T>(&self, conn: TransferConnection<T>) -> sandbox::Result<()>
    where
        T: AsyncRead + AsyncWrite + 'static,
    {
        let info =
            serve_transfer_connection(conn, &self.registry, |request| self.make_config(request))
                .await?;
        if let Some(info) = info {
            if info.success {
                log::info!(
                    "Transferred {} file(s), {} bytes in {:?}",
                    info.files,
                    info.bytes,
                    info.duration
                );
            } else {
                log::warn!("Sandbox transfer failed: {}", info.error_description);
            }
        }
        Ok(())
    }
}

/// Accepts clients until the listener fails.
pub async fn run_transfer_daemon(config: TransferDaemonConfig) -> anyhow::Result<()> {
    let key = match &config.key_file {
        Some(path) => Some(load_or_create_key(path)?),
        None => None,
    };
    if key.is_none() {
        log::warn!("No access key is configured, transfers are not encrypted");
    }
    let port = config.port;
    std::fs::create_dir_all(&config.sandbox_root).with_context(|| {
        format!(
            "Cannot create sandbox directory {}",
            config.sandbox_root.display()
        )
    })?;

    let listener = TcpListener::bind(SocketAddr::new(
        Ipv4Addr::UNSPECIFIED.into(),
        port,
    ))
    .await
    .with_context(|| "Cannot create transfer daemon socket".to_string())?;
    let port = listener.local_addr()?.port();
    let hostname = gethostname::gethostname()
        .into_string()
        .map_err(|name| anyhow::anyhow!("Invalid hostname {name:?}"))?;
    log::info!("Transfer daemon listening at {hostname}:{port}");

    let daemon = Rc::new(TransferDaemon::new(config, key));
    loop {
        let (socket, address) = listener.accept().await?;
        log::debug!("New transfer connection from {address}");
        let daemon = daemon.clone();
        tokio::task::spawn_local(async move {
            let conn = match TransferConnection::init(
                socket,
                TRANSFER_PROTOCOL,
                DAEMON_ROLE,
                CLIENT_ROLE,
                daemon.key.clone(),
            )
            .await
            {
                Ok(conn) => conn,
                Err(error) => {
                    log::warn!("Handshake with {address} failed: {error}");
                    return;
                }
            };
            if let Err(error) = daemon.serve_client(conn).await {
                log::warn!("Transfer connection from {address} failed: {error}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use orion::kdf::SecretKey;
    use tokio::io::DuplexStream;

    use sandbox::Map;
    use sandbox::transfer::{
        FileTransfer, FileTransferConfigBuilder, RequestState, TransferConnection,
        TransferDirection, TransferMode, queue_transfer_request, start_requested_transfer,
    };

    use super::{
        CLIENT_ROLE, DAEMON_ROLE, DEFAULT_MAX_TRANSFERS, TRANSFER_OUTPUT_ATTR, TRANSFER_PROTOCOL,
        TransferDaemon, TransferDaemonConfig, TransferDaemonConfigBuilder, deserialize_key,
        load_or_create_key, serialize_key,
    };
    use crate::queue::JobConstraint;
    use crate::tests::utils::init_test_logging;

    async fn connect(
        key: Option<Arc<SecretKey>>,
    ) -> (TransferConnection<DuplexStream>, TransferConnection<DuplexStream>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (client, daemon) = tokio::join!(
            TransferConnection::init_stream(
                a,
                TRANSFER_PROTOCOL,
                CLIENT_ROLE,
                DAEMON_ROLE,
                key.clone()
            ),
            TransferConnection::init_stream(b, TRANSFER_PROTOCOL, DAEMON_ROLE, CLIENT_ROLE, key)
        );
        (client.unwrap(), daemon.unwrap())
    }

    fn daemon_config(root: &std::path::Path) -> TransferDaemonConfig {
        TransferDaemonConfigBuilder::default()
            .sandbox_root(root)
            .max_transfers(2)
            .build()
            .unwrap()
    }

    fn job_ad(output: Option<&str>) -> Map<String, String> {
        let mut ad = Map::new();
        ad.insert("ClusterId".to_string(), "3".to_string());
        ad.insert("ProcId".to_string(), "0".to_string());
        if let Some(output) = output {
            ad.insert(TRANSFER_OUTPUT_ATTR.to_string(), output.to_string());
        }
        ad
    }

    #[test]
    fn test_config_defaults() {
        let config = TransferDaemonConfigBuilder::default()
            .sandbox_root("/var/lib/gridmanager/sandboxes")
            .build()
            .unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.key_file, None);
        assert_eq!(config.max_transfers, DEFAULT_MAX_TRANSFERS);
        assert!(TransferDaemonConfigBuilder::default().build().is_err());
    }

    #[test]
    fn test_key_file() {
        let dir = tempfile::TempDir::with_prefix("gm").unwrap();
        let path = dir.path().join("keys").join("transferd.key");
        let created = load_or_create_key(&path).unwrap();
        let loaded = load_or_create_key(&path).unwrap();
        assert_eq!(
            created.unprotected_as_bytes(),
            loaded.unprotected_as_bytes()
        );
        assert_eq!(
            deserialize_key(&serialize_key(&created))
                .unwrap()
                .unprotected_as_bytes(),
            created.unprotected_as_bytes()
        );

        fs::write(&path, "not a key").unwrap();
        assert!(load_or_create_key(&path).is_err());
    }

    #[tokio::test]
    async fn test_sandbox_upload_and_download() {
        init_test_logging();
        let root = tempfile::TempDir::with_prefix("gm").unwrap();
        let client_dir = tempfile::TempDir::with_prefix("gm").unwrap();
        fs::write(client_dir.path().join("input.txt"), "input").unwrap();
        let key = Some(Arc::new(super::generate_key().unwrap()));
        let daemon = TransferDaemon::new(daemon_config(root.path()), key.clone());

        // Queue and run the upload
        let (mut client, server) = connect(key.clone()).await;
        let (token, served) = tokio::join!(
            queue_transfer_request(&mut client, TransferDirection::Upload, vec![job_ad(None)]),
            daemon.serve_client(server)
        );
        let token = token.unwrap();
        served.unwrap();

        let (mut client, server) = connect(key.clone()).await;
        let upload_config = FileTransferConfigBuilder::default()
            .sandbox_dir(client_dir.path())
            .files(vec!["input.txt".to_string()])
            .build()
            .unwrap();
        let client_side = async {
            start_requested_transfer(&mut client, &token).await.unwrap();
            FileTransfer::new(upload_config)
                .upload(client, TransferMode::Blocking, true)
                .await
        };
        let (uploaded, served) = tokio::join!(client_side, daemon.serve_client(server));
        assert!(uploaded);
        served.unwrap();
        let sandbox_dir = daemon.sandbox_dir("3", "0");
        assert_eq!(
            fs::read_to_string(sandbox_dir.join("input.txt")).unwrap(),
            "input"
        );
        assert_eq!(
            daemon.registry().get().get(&token).unwrap().state,
            RequestState::Done { success: true }
        );

        // Fetch a produced file back
        fs::write(sandbox_dir.join("output.txt"), "result").unwrap();
        let fetch_dir = tempfile::TempDir::with_prefix("gm").unwrap();
        let (mut client, server) = connect(key.clone()).await;
        let (token, served) = tokio::join!(
            queue_transfer_request(
                &mut client,
                TransferDirection::Download,
                vec![job_ad(Some("output.txt"))]
            ),
            daemon.serve_client(server)
        );
        let token = token.unwrap();
        served.unwrap();

        let (mut client, server) = connect(key).await;
        let download_config = FileTransferConfigBuilder::default()
            .sandbox_dir(fetch_dir.path())
            .build()
            .unwrap();
        let client_side = async {
            start_requested_transfer(&mut client, &token).await.unwrap();
            FileTransfer::new(download_config)
                .download(client, TransferMode::Blocking)
                .await
        };
        let (downloaded, served) = tokio::join!(client_side, daemon.serve_client(server));
        assert!(downloaded);
        served.unwrap();
        assert_eq!(
            fs::read_to_string(fetch_dir.path().join("output.txt")).unwrap(),
            "result"
        );
    }

    #[tokio::test]
    async fn test_download_of_unknown_sandbox_is_rejected() {
        init_test_logging();
        let root = tempfile::TempDir::with_prefix("gm").unwrap();
        let daemon = TransferDaemon::new(daemon_config(root.path()), None);

        let (mut client, server) = connect(None).await;
        let (token, served) = tokio::join!(
            queue_transfer_request(
                &mut client,
                TransferDirection::Download,
                vec![job_ad(Some("output.txt"))]
            ),
            daemon.serve_client(server)
        );
        let token = token.unwrap();
        served.unwrap();

        let (mut client, server) = connect(None).await;
        let (started, served) = tokio::join!(
            start_requested_transfer(&mut client, &token),
            daemon.serve_client(server)
        );
        assert!(started.is_err());
        served.unwrap();
        assert!(matches!(
            daemon.registry().get().get(&token).unwrap().state,
            RequestState::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_constraint_rejects_other_jobs() {
        init_test_logging();
        let root = tempfile::TempDir::with_prefix("gm").unwrap();
        let mut config = daemon_config(root.path());
        config.constraint = Some(JobConstraint::parse("Owner == \"alice\"").unwrap());
        let daemon = TransferDaemon::new(config, None);

        let mut ad = job_ad(None);
        ad.insert("Owner".to_string(), "bob".to_string());
        let (mut client, server) = connect(None).await;
        let (token, served) = tokio::join!(
            queue_transfer_request(&mut client, TransferDirection::Upload, vec![ad]),
            daemon.serve_client(server)
        );
        let token = token.unwrap();
        served.unwrap();

        let (mut client, server) = connect(None).await;
        let (started, served) = tokio::join!(
            start_requested_transfer(&mut client, &token),
            daemon.serve_client(server)
        );
        assert!(started.is_err());
        served.unwrap();
        assert!(!daemon.sandbox_dir("3", "0").exists());
    }
}
