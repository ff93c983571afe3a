use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

const MAX_EVENT_LOG_LENGTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    Submit,
    Execute,
    Evicted,
    Terminated,
    Aborted,
    Held,
    ResourceUp,
    ResourceDown,
    StatusUnknown,
    StatusKnown,
}

impl Display for JobEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobEventKind::Submit => "submit",
            JobEventKind::Execute => "execute",
            JobEventKind::Evicted => "evicted",
            JobEventKind::Terminated => "terminated",
            JobEventKind::Aborted => "aborted",
            JobEventKind::Held => "held",
            JobEventKind::ResourceUp => "resource up",
            JobEventKind::ResourceDown => "resource down",
            JobEventKind::StatusUnknown => "status unknown",
            JobEventKind::StatusKnown => "status known",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEventRecord {
    pub job: JobId,
    pub time: DateTime<Utc>,
    pub kind: JobEventKind,
    pub message: String,
}

/// User-visible history of the managed jobs. Only the most recent events are kept.
#[derive(Default)]
pub struct EventLog {
    events: VecDeque<JobEventRecord>,
    /// Number of newest events that were not reported yet
    unreported: usize,
}

sandbox::define_wrapped_type!(EventLogRef, EventLog, pub);

impl Default for EventLogRef {
    fn default() -> Self {
        Self(crate::WrappedRcRefCell::wrap(EventLog::default()))
    }
}

impl EventLog {
    pub fn add(&mut self, job: JobId, kind: JobEventKind, message: String) {
        if message.is_empty() {
            log::info!("Job {job}: {kind}");
        } else {
            log::info!("Job {job}: {kind} ({message})");
        }
        if self.events.len() >= MAX_EVENT_LOG_LENGTH {
            self.events.pop_front();
        }
        self.events.push_back(JobEventRecord {
            job,
            time: Utc::now(),
            kind,
            message,
        });
        self.unreported = (self.unreported + 1).min(self.events.len());
    }

    /// Events added since the last call, oldest first.
    pub fn take_unreported(&mut self) -> Vec<JobEventRecord> {
        let start = self.events.len() - self.unreported;
        self.unreported = 0;
        self.events.range(start..).cloned().collect()
    }

    pub fn for_job(&self, job: JobId) -> Vec<&JobEventRecord> {
        self.events.iter().filter(|event| event.job == job).collect()
    }

    pub fn kinds_for_job(&self, job: JobId) -> Vec<JobEventKind> {
        self.for_job(job).into_iter().map(|event| event.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
