//! Staging servers that hold job sandboxes for backends which fetch them by URL.
//!
//! One helper process runs per credential. It is started through a [`LocalScheduler`]
//! and kept alive for as long as some job is registered with it.

mod scheduler;
mod server;


use std::path::PathBuf;
use std::rc::Rc;

use crate::Map;
use crate::common::config::GridManagerConfig;
use crate::proxy::{Proxy, ProxyManagerRef};

pub use scheduler::{
    HelperJobDescription, HelperJobId, HelperJobState, HelperJobStatus, LEASE_EXPIRATION_ATTR,
    LocalScheduler, ProcessScheduler, SchedulerFuture,
};
pub use server::{
    CHECK_INTERVAL, DEFAULT_PORT, LEASE_DURATION, LEASE_RENEW_INTERVAL, POLL_INTERVAL,
    StagingServer, StagingServerRef, StagingState, SUBMIT_ATTEMPT_INTERVAL,
};

/// Staging servers keyed by credential subject.
pub struct StagingServerManager {
    servers: Map<String, StagingServerRef>,
    scheduler: Rc<dyn LocalScheduler>,
    proxies: ProxyManagerRef,
    helper_path: Option<PathBuf>,
}

sandbox::define_wrapped_type!(StagingServerManagerRef, StagingServerManager, pub);

impl StagingServerManager {
    pub fn get(&self, subject: &str) -> Option<&StagingServerRef> {
        self.servers.get(subject)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl StagingServerManagerRef {
    /// Returns `None` when a fixed staging URL is configured, no helpers are needed then.
    pub fn from_config(
        config: &GridManagerConfig,
        scheduler: Rc<dyn LocalScheduler>,
        proxies: ProxyManagerRef,
    ) -> Option<Self> {
        if config.staging_url_base.is_some() {
            return None;
        }
        Some(Self(crate::WrappedRcRefCell::wrap(StagingServerManager {
            servers: Default::default(),
            scheduler,
            proxies,
            helper_path: config.staging_server_path.clone(),
        })))
    }

    pub fn find_or_create(&self, proxy: &Proxy) -> StagingServerRef {
        let mut manager = self.get_mut();
        if let Some(server) = manager.servers.get(&proxy.subject) {
            return server.clone();
        }
        log::debug!("Creating staging server for {}", proxy.subject);
        let server = StagingServerRef::new(StagingServer::new(
            proxy,
            manager.proxies.clone(),
            manager.scheduler.clone(),
            manager.helper_path.clone(),
        ));
        manager
            .servers
            .insert(proxy.subject.clone(), server.clone());
        server
    }

    pub fn reconfig(&self, config: &GridManagerConfig) {
        let mut manager = self.get_mut();
        manager.helper_path = config.staging_server_path.clone();
        for server in manager.servers.values() {
            server
                .get_mut()
                .set_helper_path(config.staging_server_path.clone());
        }
    }

    /// Drops servers without clients whose helper is gone. Returns how many were dropped.
    pub fn reap(&self) -> usize {
        let mut manager = self.get_mut();
        let before = manager.servers.len();
        manager.servers.retain(|_, server| {
            let server = server.get();
            server.client_count() > 0 || server.is_running()
        });
        before - manager.servers.len()
    }
}
