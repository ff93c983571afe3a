use std::future::Future;
use std::rc::Rc;

use anyhow::Context;

use crate::JobId;
use crate::common::config::GridManagerConfig;
use crate::common::rpc::{RpcSender, call, make_rpc_queue};
use crate::manager::process::{ManagerMessage, manager_process};
use crate::manager::{GridManager, ManagerStatus, TransportFactory};
use crate::queue::{JobAttributes, JobQueueRef};
use crate::staging::LocalScheduler;

/// Handle used to talk to a running [`manager_process`].
#[derive(Clone)]
pub struct GridManagerService {
    sender: RpcSender<ManagerMessage>,
}

impl GridManagerService {
    pub fn scan_queue(&self) {
        self.send(ManagerMessage::ScanQueue);
    }

    pub fn update_job(&self, job: JobId, attrs: JobAttributes) {
        self.send(ManagerMessage::UpdateJob(job, attrs));
    }

    pub fn remove_job(&self, job: JobId) {
        self.send(ManagerMessage::RemoveJob(job));
    }

    pub fn hold_job(&self, job: JobId, reason: &str) {
        self.send(ManagerMessage::HoldJob {
            job,
            reason: reason.to_string(),
        });
    }

    pub fn check_remote_status(&self) {
        self.send(ManagerMessage::CheckRemoteStatus);
    }

    /// Resolves once the new configuration has been applied.
    pub async fn reconfig(&self, config: GridManagerConfig) -> anyhow::Result<()> {
        call(&self.sender, |token| ManagerMessage::Reconfig(config, token))
            .await
            .context("Grid manager is not running")?
    }

    pub async fn status(&self) -> anyhow::Result<ManagerStatus> {
        call(&self.sender, ManagerMessage::GetStatus)
            .await
            .context("Grid manager is not running")
    }

    pub fn quit(&self) {
        self.send(ManagerMessage::Quit);
    }

    fn send(&self, msg: ManagerMessage) {
        let _ = self.sender.send(msg);
    }
}

pub fn create_manager_service(
    config: GridManagerConfig,
    queue: JobQueueRef,
    transports: TransportFactory,
    scheduler: Rc<dyn LocalScheduler>,
) -> crate::Result<(GridManagerService, impl Future<Output = ()>)> {
    let manager = GridManager::new(config, queue, transports, scheduler)?;
    let (tx, rx) = make_rpc_queue();
    let process = manager_process(manager, rx);
    Ok((GridManagerService { sender: tx }, process))
}
