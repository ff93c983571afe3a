use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use tokio::sync::OnceCell;

use crate::Map;
use crate::gahp::request::{GahpReply, GahpRequest};

pub type GahpResult<T> = anyhow::Result<T>;
pub type GahpFuture<T> = Pin<Box<dyn Future<Output = GahpResult<T>>>>;

/// Channel to a helper that executes remote operations.
pub trait GahpTransport {
    /// Launches the helper. Called at most once.
    fn start(&self) -> GahpFuture<()>;

    /// Executes one operation. An `Err` means that the helper could not be asked at all;
    /// failures of the operation itself are reported inside the reply.
    fn execute(&self, request: GahpRequest) -> GahpFuture<GahpReply>;

    fn shutdown(&self) {}
}

pub type GahpServerRef = Rc<GahpServer>;

pub struct GahpServer {
    name: String,
    transport: Box<dyn GahpTransport>,
    startup: OnceCell<Result<(), String>>,
}

impl GahpServer {
    pub fn new(name: &str, transport: Box<dyn GahpTransport>) -> GahpServerRef {
        Rc::new(Self {
            name: name.to_string(),
            transport,
            startup: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the helper on first use. The outcome is remembered, so a failed
    /// start is reported to every later caller without trying again.
    pub async fn startup(&self) -> Result<(), String> {
        self.startup
            .get_or_init(|| async {
                log::info!("Starting helper {}", self.name);
                let result = self.transport.start().await.map_err(|e| format!("{e:#}"));
                if let Err(error) = &result {
                    log::error!("Helper {} failed to start: {error}", self.name);
                }
                result
            })
            .await
            .clone()
    }

    pub fn is_started(&self) -> bool {
        matches!(self.startup.get(), Some(Ok(())))
    }

    pub fn execute(&self, request: GahpRequest) -> GahpFuture<GahpReply> {
        self.transport.execute(request)
    }
}

impl Drop for GahpServer {
    fn drop(&mut self) {
        if self.is_started() {
            log::debug!("Stopping helper {}", self.name);
            self.transport.shutdown();
        }
    }
}

/// Helpers by name; jobs with the same helper configuration share one helper.
#[derive(Default)]
pub struct GahpServers {
    servers: Map<String, GahpServerRef>,
}

impl GahpServers {
    pub fn get_or_create<F>(&mut self, name: &str, create: F) -> GahpServerRef
    where
        F: FnOnce() -> Box<dyn GahpTransport>,
    {
        self.servers
            .entry(name.to_string())
            .or_insert_with(|| GahpServer::new(name, create()))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<&GahpServerRef> {
        self.servers.get(name)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{GahpFuture, GahpServer, GahpServers, GahpTransport};
    use crate::gahp::{GahpReply, GahpRequest};
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingTransport {
        starts: Rc<Cell<u32>>,
        fail: bool,
    }

    impl GahpTransport for CountingTransport {
        fn start(&self) -> GahpFuture<()> {
            self.starts.set(self.starts.get() + 1);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    anyhow::bail!("no such helper");
                }
                Ok(())
            })
        }

        fn execute(&self, _request: GahpRequest) -> GahpFuture<GahpReply> {
            Box::pin(async { Ok(GahpReply::ok(["x"])) })
        }
    }

    #[tokio::test]
    async fn test_startup_once() {
        let starts = Rc::new(Cell::new(0));
        let server = GahpServer::new(
            "test",
            Box::new(CountingTransport {
                starts: starts.clone(),
                fail: false,
            }),
        );
        assert!(!server.is_started());
        assert!(server.startup().await.is_ok());
        assert!(server.startup().await.is_ok());
        assert!(server.is_started());
        assert_eq!(starts.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_startup_is_remembered() {
        let starts = Rc::new(Cell::new(0));
        let server = GahpServer::new(
            "test",
            Box::new(CountingTransport {
                starts: starts.clone(),
                fail: true,
            }),
        );
        assert_eq!(server.startup().await.unwrap_err(), "no such helper");
        assert!(server.startup().await.is_err());
        assert_eq!(starts.get(), 1);
    }

    #[test]
    fn test_servers_are_shared_by_name() {
        let mut servers = GahpServers::default();
        let starts = Rc::new(Cell::new(0));
        let make = || -> Box<dyn GahpTransport> {
            Box::new(CountingTransport {
                starts: starts.clone(),
                fail: false,
            })
        };
        let a = servers.get_or_create("ec2", make);
        let b = servers.get_or_create("ec2", make);
        let c = servers.get_or_create("gce", make);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(servers.len(), 2);
    }
}
