use std::path::PathBuf;
use std::time::Duration;

use crate::JobId;
use crate::common::config::GridManagerConfig;
use crate::common::rpc::{ResponseToken, RpcReceiver};
use crate::manager::{GridManager, ManagerStatus};
use crate::queue::{JobAttributes, flush_process};

/// How often the queue is searched for new jobs when nobody asks for it.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// How long running jobs get to stop before their tasks are aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum ManagerMessage {
    // Events
    ScanQueue,
    UpdateJob(JobId, JobAttributes),
    RemoveJob(JobId),
    HoldJob {
        job: JobId,
        reason: String,
    },
    CheckRemoteStatus,
    // Requests
    Reconfig(GridManagerConfig, ResponseToken<anyhow::Result<()>>),
    GetStatus(ResponseToken<ManagerStatus>),
    Quit,
}

impl GridManager {
    /// Waits until some job task ends. Never resolves while no job is managed.
    async fn next_finished(&mut self) -> Option<JobId> {
        if self.tasks.is_empty() {
            futures::future::pending::<()>().await;
        }
        match self.tasks.join_next().await? {
            Ok(job) => Some(job),
            Err(error) => {
                log::error!("Job task failed: {error}");
                // The failed task dropped its receiver
                self.jobs.retain(|_, sender| !sender.is_closed());
                None
            }
        }
    }

    fn report(&self) {
        let Some(path) = self.config().report_to.as_deref().map(PathBuf::from) else {
            return;
        };
        match self.report_events(&path) {
            Ok(0) => {}
            Ok(count) => log::debug!("Reported {count} event(s) to {}", path.display()),
            Err(error) => log::error!("Cannot report events to {}: {error}", path.display()),
        }
    }

    /// Returns false when the manager should quit.
    fn handle_message(&mut self, message: ManagerMessage) -> bool {
        match message {
            ManagerMessage::ScanQueue => {
                self.scan();
            }
            ManagerMessage::UpdateJob(job, attrs) => {
                if !self.update_job(job, attrs) {
                    log::debug!("({job}) Ignoring update of an unmanaged job");
                }
            }
            ManagerMessage::RemoveJob(job) => {
                if !self.remove_job(job) {
                    log::debug!("({job}) Ignoring removal of an unmanaged job");
                }
            }
            ManagerMessage::HoldJob { job, reason } => {
                if !self.hold_job(job, &reason) {
                    log::debug!("({job}) Ignoring hold of an unmanaged job");
                }
            }
            ManagerMessage::CheckRemoteStatus => self.check_remote_status(),
            ManagerMessage::Reconfig(config, response) => {
                let result = self
                    .reconfig(config)
                    .map_err(|error| anyhow::anyhow!("Cannot apply configuration: {error}"));
                response.respond(result);
                // The constraint may have changed
                self.scan();
            }
            ManagerMessage::GetStatus(response) => response.respond(self.status()),
            ManagerMessage::Quit => return false,
        }
        true
    }

    async fn shutdown(&mut self) {
        log::debug!("Stopping {} managed job(s)", self.jobs.len());
        self.stop_jobs();
        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            log::warn!("Some jobs did not stop in time, aborting them");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        self.jobs.clear();
        if let Err(error) = self.queue().get_mut().flush() {
            log::error!("Cannot flush job queue: {error}");
        }
        self.report();
    }
}

/// Main loop of the grid manager. Ends after [`ManagerMessage::Quit`] or when every
/// sender is dropped.
pub async fn manager_process(mut manager: GridManager, mut receiver: RpcReceiver<ManagerMessage>) {
    let flush = tokio::task::spawn_local(flush_process(
        manager.queue().clone(),
        manager.config().queue_flush_interval,
    ));

    let mut scan_interval = tokio::time::interval(SCAN_INTERVAL);
    let mut check_interval = tokio::time::interval(manager.config().check_remote_status_interval);
    // The first tick of an interval completes immediately
    check_interval.tick().await;

    loop {
        tokio::select! {
            _ = scan_interval.tick() => {
                manager.scan();
                manager.report();
            }
            _ = check_interval.tick() => {
                manager.check_remote_status();
            }
            Some(job) = manager.next_finished() => {
                manager.job_finished(job);
            }
            message = receiver.recv() => {
                let running = match message {
                    Some(message) => manager.handle_message(message),
                    None => false,
                };
                if !running {
                    break;
                }
            }
        }
    }

    log::info!("Grid manager is shutting down");
    manager.shutdown().await;
    flush.abort();
}
