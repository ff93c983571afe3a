use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;

use anyhow::{Context, anyhow};
use bstr::ByteSlice;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::common::config::GridManagerConfig;
use crate::common::env::{GM_PARENT_PID, is_gm_env};
use crate::gahp::request::{GahpReply, GahpRequest};
use crate::gahp::server::{GahpFuture, GahpTransport};
use crate::{Map, WrappedRcRefCell};

const DEFAULT_GAHP_PROGRAM: &str = "gm_gahp";

sandbox::define_id_type!(RequestId, u64);

/// How the helper binary is launched.
#[derive(Debug, Clone)]
pub struct GahpProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log: Option<PathBuf>,
    pub workers_min: u32,
    pub workers_max: u32,
    pub debug: u32,
}

impl GahpProcessConfig {
    pub fn from_config(config: &GridManagerConfig) -> anyhow::Result<Self> {
        let program = match &config.gahp_path {
            Some(path) => path.clone(),
            None => which::which(DEFAULT_GAHP_PROGRAM)
                .with_context(|| format!("Cannot find {DEFAULT_GAHP_PROGRAM} in PATH"))?,
        };
        Ok(Self {
            program,
            args: config.gahp_args.clone(),
            log: config.gahp_log.clone(),
            workers_min: config.gahp_workers_min,
            workers_max: config.gahp_workers_max,
            debug: config.gahp_debug,
        })
    }

    /// Helpers are shared by jobs whose launch parameters are identical.
    pub fn server_name(&self) -> String {
        let mut name = self.program.display().to_string();
        for arg in &self.args {
            name.push(' ');
            name.push_str(arg);
        }
        name
    }

    fn command(&self) -> anyhow::Result<Command> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--workers-min")
            .arg(self.workers_min.to_string())
            .arg("--workers-max")
            .arg(self.workers_max.to_string());
        if self.debug > 0 {
            command.arg("--debug").arg(self.debug.to_string());
        }

        let stderr = match &self.log {
            Some(path) => Stdio::from(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Cannot open helper log {}", path.display()))?,
            ),
            None => Stdio::null(),
        };

        // Our own settings are not meant for the helper
        for (name, _) in std::env::vars_os() {
            if is_gm_env(name.as_encoded_bytes().as_bstr()) {
                command.env_remove(&name);
            }
        }
        command
            .env(GM_PARENT_PID, std::process::id().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true);
        Ok(command)
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    id: RequestId,
    #[serde(flatten)]
    request: &'a GahpRequest,
}

#[derive(Deserialize)]
struct WireReply {
    id: RequestId,
    #[serde(flatten)]
    reply: GahpReply,
}

#[derive(Default)]
struct ProcessState {
    writer: Option<mpsc::UnboundedSender<String>>,
    pending: Map<RequestId, oneshot::Sender<GahpReply>>,
    next_id: u64,
    pid: Option<u32>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessState {
    /// Dropping the reply senders fails every outstanding call.
    fn disconnect(&mut self) {
        self.writer = None;
        self.pid = None;
        if !self.pending.is_empty() {
            log::warn!(
                "Helper disconnected with {} outstanding request(s)",
                self.pending.len()
            );
        }
        self.pending.clear();
    }
}

/// Helper process that exchanges one JSON line per request and reply over its
/// standard input and output.
pub struct ProcessTransport {
    config: Rc<GahpProcessConfig>,
    state: WrappedRcRefCell<ProcessState>,
}

impl ProcessTransport {
    pub fn new(config: GahpProcessConfig) -> Self {
        Self {
            config: Rc::new(config),
            state: WrappedRcRefCell::wrap(Default::default()),
        }
    }
}

impl GahpTransport for ProcessTransport {
    fn start(&self) -> GahpFuture<()> {
        let config = self.config.clone();
        let state = self.state.clone();
        Box::pin(async move {
            let mut child = config
                .command()?
                .spawn()
                .with_context(|| format!("Cannot start {}", config.program.display()))?;
            let stdin = child.stdin.take().context("Helper stdin is not available")?;
            let stdout = child.stdout.take().context("Helper stdout is not available")?;
            let pid = child.id();
            log::debug!("Helper {} started with pid {pid:?}", config.program.display());

            let (tx, rx) = mpsc::unbounded_channel();
            let writer = tokio::task::spawn_local(write_requests(stdin, rx));
            let reader_state = state.clone();
            let reader = tokio::task::spawn_local(async move {
                read_replies(stdout, &reader_state).await;
                reader_state.get_mut().disconnect();
                match child.wait().await {
                    Ok(status) => log::warn!("Helper exited with {status}"),
                    Err(error) => log::warn!("Cannot get helper exit status: {error}"),
                }
            });

            let mut state = state.get_mut();
            state.writer = Some(tx);
            state.pid = pid;
            state.tasks = vec![writer, reader];
            Ok(())
        })
    }

    fn execute(&self, request: GahpRequest) -> GahpFuture<GahpReply> {
        let state = self.state.clone();
        Box::pin(async move {
            let receiver = {
                let mut state = state.get_mut();
                let writer = state
                    .writer
                    .clone()
                    .ok_or_else(|| anyhow!("Helper is not running"))?;
                state.next_id += 1;
                let id = RequestId::new(state.next_id);
                let line = serde_json::to_string(&WireRequest {
                    id,
                    request: &request,
                })?;
                let (tx, rx) = oneshot::channel();
                state.pending.insert(id, tx);
                writer
                    .send(line)
                    .map_err(|_| anyhow!("Helper is not running"))?;
                rx
            };
            receiver
                .await
                .map_err(|_| anyhow!("Helper exited before replying"))
        })
    }

    fn shutdown(&self) {
        let mut state = self.state.get_mut();
        if let Some(pid) = state.pid {
            if let Err(error) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                log::debug!("Cannot terminate helper {pid}: {error}");
            }
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.disconnect();
    }
}

async fn write_requests(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(error) = result {
            log::error!("Cannot write to helper: {error}");
            break;
        }
    }
}

async fn read_replies(stdout: ChildStdout, state: &WrappedRcRefCell<ProcessState>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                log::error!("Cannot read from helper: {error}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply: WireReply = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(error) => {
                log::warn!("Ignoring malformed helper reply {line:?}: {error}");
                continue;
            }
        };
        let sender = state.get_mut().pending.remove(&reply.id);
        match sender {
            Some(sender) => {
                let _ = sender.send(reply.reply);
            }
            None => log::warn!("Helper replied to unknown request {}", reply.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GahpProcessConfig, ProcessTransport};
    use crate::gahp::{GahpRequest, GahpTransport};
    use std::path::PathBuf;

    fn shell(script: &str) -> GahpProcessConfig {
        GahpProcessConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            log: None,
            workers_min: 1,
            workers_max: 2,
            debug: 0,
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_pipes() {
        let script = r#"while read -r line; do id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/'); printf '{"id":%s,"success":true,"values":["pong"]}\n' "$id"; done"#;
        tokio::task::LocalSet::new()
            .run_until(async move {
                let transport = ProcessTransport::new(shell(script));
                transport.start().await.unwrap();
                for _ in 0..3 {
                    let reply = transport
                        .execute(GahpRequest::new("PING", ["a b"]))
                        .await
                        .unwrap();
                    assert!(reply.success);
                    assert_eq!(reply.value(0), Some("pong"));
                }
                transport.shutdown();
            })
            .await;
    }

    #[tokio::test]
    async fn test_exited_helper_fails_calls() {
        tokio::task::LocalSet::new()
            .run_until(async move {
                let transport = ProcessTransport::new(shell("exit 0"));
                transport.start().await.unwrap();
                assert!(
                    transport
                        .execute(GahpRequest::new("PING", Vec::<String>::new()))
                        .await
                        .is_err()
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_missing_program() {
        let mut config = shell("");
        config.program = PathBuf::from("/nonexistent/gahp");
        let transport = ProcessTransport::new(config);
        assert!(transport.start().await.is_err());
    }

    #[test]
    fn test_server_name() {
        assert_eq!(shell("x").server_name(), "sh -c x");
    }
}
