//! Remote lifecycle of a single grid job.
//!
//! A [`RemoteJob`] drives one job record from submission through monitoring to cleanup.
//! Its state table ([`GmState`]) is shared by every backend, only the remote operations
//! themselves come from a [`BackendDriver`].

mod driver;
mod events;
mod grid_id;
mod machine;
mod process;
mod record;
mod state;
mod validate;


use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::config::GridManagerConfig;
use crate::proxy::ProxyManagerRef;
use crate::queue::JobQueueRef;
use crate::staging::StagingServerManagerRef;

pub use driver::{
    BackendDriver, BatchDriver, CloudDriver, CloudProvider, NEEDS_CHECK_ERROR_CODE,
    NOT_FOUND_ERROR_CODE, OVER_CAPACITY_ERROR_CODE, SubmitParams, create_driver,
};
pub use events::{EventLog, EventLogRef, JobEventKind, JobEventRecord};
pub use grid_id::{GridJobId, GridResource};
pub use machine::{Evaluation, RemoteJob};
pub use process::{JobEvent, job_process};
pub use record::{JobRecord, RemoteIdIndex};
pub use state::GmState;
pub use validate::{JobInstance, JobSetup, validate_job};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub cluster_id: u32,
    pub proc_id: u32,
}

impl JobId {
    pub fn new(cluster_id: u32, proc_id: u32) -> Self {
        Self {
            cluster_id,
            proc_id,
        }
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.cluster_id, self.proc_id)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cluster, proc) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid job id {s:?}"))?;
        let parse = |value: &str| {
            value
                .parse::<u32>()
                .map_err(|e| format!("Invalid job id {s:?}: {e}"))
        };
        Ok(Self::new(parse(cluster)?, parse(proc)?))
    }
}

/// Local disposition of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Idle,
    Running,
    Removed,
    Completed,
    Held,
}

impl JobStatus {
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Idle => 1,
            JobStatus::Running => 2,
            JobStatus::Removed => 3,
            JobStatus::Completed => 4,
            JobStatus::Held => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => JobStatus::Idle,
            2 => JobStatus::Running,
            3 => JobStatus::Removed,
            4 => JobStatus::Completed,
            5 => JobStatus::Held,
            _ => return None,
        })
    }

    /// The user asked to stop the job.
    pub fn is_removed_or_held(self) -> bool {
        matches!(self, JobStatus::Removed | JobStatus::Held)
    }
}

/// Shared objects every job works with.
#[derive(Clone)]
pub struct JobContext {
    pub config: Rc<GridManagerConfig>,
    pub queue: JobQueueRef,
    pub proxies: ProxyManagerRef,
    pub remote_ids: RemoteIdIndex,
    pub events: EventLogRef,
    pub staging: Option<StagingServerManagerRef>,
}
