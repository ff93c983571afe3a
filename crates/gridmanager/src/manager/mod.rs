//! Owner of every managed job and the registries the jobs share.

mod process;
mod service;

#[cfg(test)]
mod tests;

use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::common::config::GridManagerConfig;
use crate::common::rpc::{RpcSender, make_rpc_queue};
use crate::gahp::{GahpProcessConfig, GahpServerRef, GahpServers, GahpTransport, ProcessTransport};
use crate::job::{
    EventLogRef, JobContext, JobEvent, JobInstance, JobStatus, RemoteIdIndex, RemoteJob,
    job_process,
};
use crate::proxy::ProxyManagerRef;
use crate::queue::attrs::*;
use crate::queue::{JobAttributes, JobConstraint, JobQueueRef};
use crate::resource::ResourceRegistry;
use crate::staging::{LocalScheduler, StagingServerManagerRef};
use crate::{JobId, Map};

pub use process::{ManagerMessage, SCAN_INTERVAL, manager_process};
pub use service::{GridManagerService, create_manager_service};

/// Creates the transport of the helper that executes remote operations, together with
/// the name under which the helper is shared.
pub type TransportFactory =
    Box<dyn Fn(&GridManagerConfig) -> anyhow::Result<(String, Box<dyn GahpTransport>)>>;

/// Helper processes launched from the configured program.
pub fn process_transports() -> TransportFactory {
    Box::new(|config| {
        let process = GahpProcessConfig::from_config(config)?;
        let name = process.server_name();
        let transport: Box<dyn GahpTransport> = Box::new(ProcessTransport::new(process));
        Ok((name, transport))
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub jobs: usize,
    pub resources: usize,
    pub helpers: usize,
    pub staging_servers: usize,
    pub events: usize,
}

pub struct GridManager {
    ctx: JobContext,
    resources: ResourceRegistry,
    servers: GahpServers,
    transports: TransportFactory,
    constraint: Option<JobConstraint>,
    jobs: Map<JobId, RpcSender<JobEvent>>,
    tasks: JoinSet<JobId>,
}

impl GridManager {
    pub fn new(
        config: GridManagerConfig,
        queue: JobQueueRef,
        transports: TransportFactory,
        staging: Rc<dyn LocalScheduler>,
    ) -> crate::Result<Self> {
        let constraint = config
            .constraint
            .as_deref()
            .map(JobConstraint::parse)
            .transpose()?;
        let proxies = ProxyManagerRef::default();
        let staging = StagingServerManagerRef::from_config(&config, staging, proxies.clone());
        Ok(Self {
            ctx: JobContext {
                config: Rc::new(config),
                queue,
                proxies,
                remote_ids: RemoteIdIndex::default(),
                events: EventLogRef::default(),
                staging,
            },
            resources: Default::default(),
            servers: Default::default(),
            transports,
            constraint,
            jobs: Default::default(),
            tasks: JoinSet::new(),
        })
    }

    pub fn config(&self) -> &Rc<GridManagerConfig> {
        &self.ctx.config
    }

    pub fn queue(&self) -> &JobQueueRef {
        &self.ctx.queue
    }

    pub fn events(&self) -> &EventLogRef {
        &self.ctx.events
    }

    pub fn proxies(&self) -> &ProxyManagerRef {
        &self.ctx.proxies
    }

    /// Job that owns the given remote job id.
    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<JobId> {
        self.ctx.remote_ids.lookup(remote_id)
    }

    pub fn is_managed(&self, job: JobId) -> bool {
        self.jobs.contains_key(&job)
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            jobs: self.jobs.len(),
            resources: self.resources.len(),
            helpers: self.servers.len(),
            staging_servers: self
                .ctx
                .staging
                .as_ref()
                .map(|staging| staging.get().len())
                .unwrap_or(0),
            events: self.ctx.events.get().len(),
        }
    }

    fn wants_job(&self, attrs: &JobAttributes) -> bool {
        if !attrs.contains_key(GRID_RESOURCE) {
            return false;
        }
        let managed = attrs.get(MANAGED).and_then(|v| v.as_str());
        if matches!(managed, Some(MANAGED_DONE) | Some(MANAGED_SCHEDD)) {
            return false;
        }
        let status = attrs
            .get(JOB_STATUS)
            .and_then(|v| v.as_int())
            .and_then(JobStatus::from_code);
        if matches!(status, Some(JobStatus::Completed) | Some(JobStatus::Held)) {
            return false;
        }
        self.constraint
            .as_ref()
            .is_none_or(|constraint| constraint.matches(attrs))
    }

    fn gahp_server(&mut self) -> anyhow::Result<GahpServerRef> {
        let (name, transport) = (self.transports)(&self.ctx.config)?;
        Ok(self.servers.get_or_create(&name, move || transport))
    }

    /// Starts managing jobs of the queue that are not managed yet. Returns how many
    /// jobs were picked up.
    pub fn scan(&mut self) -> usize {
        let candidates: Vec<(JobId, JobAttributes)> = {
            let queue = self.ctx.queue.get();
            queue
                .jobs()
                .into_iter()
                .filter(|job| !self.jobs.contains_key(job))
                .filter_map(|job| queue.attributes(job).map(|attrs| (job, attrs)))
                .filter(|(_, attrs)| self.wants_job(attrs))
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }
        let server = match self.gahp_server() {
            Ok(server) => server,
            Err(error) => {
                log::error!("Cannot create helper for remote operations: {error:?}");
                return 0;
            }
        };

        let count = candidates.len();
        for (id, attrs) in candidates {
            log::debug!("({id}) Starting to manage job");
            self.ctx
                .queue
                .get_mut()
                .assign(id, MANAGED, MANAGED_EXTERNAL.into());
            let instance = JobInstance::new(&attrs, &self.ctx.config);
            let job = RemoteJob::new(
                id,
                instance,
                self.ctx.clone(),
                &server,
                &mut self.resources,
            );
            let (sender, receiver) = make_rpc_queue();
            self.tasks.spawn_local(job_process(job, receiver));
            self.jobs.insert(id, sender);
        }
        log::info!("Managing {count} new job(s)");
        count
    }

    fn send(&self, job: JobId, event: JobEvent) -> bool {
        match self.jobs.get(&job) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Delivers attributes changed outside of the grid manager. Returns false when the
    /// job is not managed.
    pub fn update_job(&self, job: JobId, attrs: JobAttributes) -> bool {
        self.send(job, JobEvent::AdUpdate(attrs))
    }

    pub fn remove_job(&self, job: JobId) -> bool {
        let mut attrs = JobAttributes::default();
        attrs.insert(JOB_STATUS.to_string(), JobStatus::Removed.code().into());
        self.update_job(job, attrs)
    }

    pub fn hold_job(&self, job: JobId, reason: &str) -> bool {
        let mut attrs = JobAttributes::default();
        attrs.insert(JOB_STATUS.to_string(), JobStatus::Held.code().into());
        attrs.insert(HOLD_REASON.to_string(), reason.into());
        self.update_job(job, attrs)
    }

    pub fn check_remote_status(&self) {
        for sender in self.jobs.values() {
            let _ = sender.send(JobEvent::CheckRemoteStatus);
        }
    }

    pub fn reconfig(&mut self, config: GridManagerConfig) -> crate::Result<()> {
        self.constraint = config
            .constraint
            .as_deref()
            .map(JobConstraint::parse)
            .transpose()?;
        let config = Rc::new(config);
        self.resources.reconfig(&config);
        if let Some(staging) = &self.ctx.staging {
            staging.reconfig(&config);
        }
        for sender in self.jobs.values() {
            let _ = sender.send(JobEvent::Reconfig(config.clone()));
        }
        self.ctx.config = config;
        log::info!("Configuration reloaded");
        Ok(())
    }

    /// Forgets a job whose task ended and drops registries nobody uses anymore.
    pub fn job_finished(&mut self, job: JobId) {
        log::debug!("({job}) Job is no longer managed");
        self.jobs.remove(&job);
        self.resources.remove_unused();
        if let Some(staging) = &self.ctx.staging {
            staging.reap();
        }
    }

    /// Asks every job to stop, their tasks end at the next wake-up.
    pub fn stop_jobs(&mut self) {
        for sender in self.jobs.values() {
            let _ = sender.send(JobEvent::Stop);
        }
    }

    /// Appends events that were not reported yet to `path`, one JSON object per line.
    pub fn report_events(&self, path: &Path) -> crate::Result<usize> {
        let events = self.ctx.events.get_mut().take_unreported();
        if events.is_empty() {
            return Ok(0);
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for event in &events {
            serde_json::to_writer(&mut file, event)?;
            file.write_all(b"\n")?;
        }
        Ok(events.len())
    }
}
