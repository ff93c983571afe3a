use std::rc::Rc;

use tokio::time::Instant;

use crate::JobId;
use crate::common::config::GridManagerConfig;
use crate::common::rpc::RpcReceiver;
use crate::job::machine::{Evaluation, RemoteJob};
use crate::queue::JobAttributes;

/// Events delivered to a running job by the manager.
#[derive(Debug)]
pub enum JobEvent {
    /// Attributes of the job record changed outside of the grid manager.
    AdUpdate(JobAttributes),
    CheckRemoteStatus,
    Reconfig(Rc<GridManagerConfig>),
    /// The manager is shutting down.
    Stop,
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Drives a job until it finishes or is stopped. Returns the id of the job.
pub async fn job_process(mut job: RemoteJob, mut events: RpcReceiver<JobEvent>) -> JobId {
    let waker = job.waker();
    loop {
        if job.evaluate().await == Evaluation::Finished {
            log::debug!("({}) Job finished", job.id());
            break;
        }
        tokio::select! {
            _ = waker.notified() => {}
            _ = wait_for_deadline(job.deadline()) => {}
            event = events.recv() => match event {
                Some(JobEvent::AdUpdate(attrs)) => job.apply_update(attrs),
                Some(JobEvent::CheckRemoteStatus) => job.check_remote_status(),
                Some(JobEvent::Reconfig(config)) => job.reconfig(config),
                Some(JobEvent::Stop) | None => {
                    log::debug!("({}) Job stopped in state {}", job.id(), job.gm_state());
                    break;
                }
            }
        }
    }
    job.id()
}
