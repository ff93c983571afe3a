use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::common::utils::unix_time;
use crate::job::events::{EventLogRef, JobEventKind};
use crate::job::grid_id::GridJobId;
use crate::job::{JobId, JobStatus};
use crate::queue::attrs::*;
use crate::queue::{AttrValue, JobAttributes, JobQueueRef, UpdateStatus};
use crate::Map;

/// Remote job ids of every managed job, so that updates pushed by a remote side can be routed.
pub struct RemoteIdIndex(crate::WrappedRcRefCell<Map<String, JobId>>);

impl Clone for RemoteIdIndex {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Default for RemoteIdIndex {
    fn default() -> Self {
        Self(crate::WrappedRcRefCell::wrap(Map::new()))
    }
}

impl RemoteIdIndex {
    pub fn replace(&self, job: JobId, old: Option<&str>, new: Option<&str>) {
        let mut index = self.0.get_mut();
        if let Some(old) = old {
            if index.get(old) == Some(&job) {
                index.remove(old);
            }
        }
        if let Some(new) = new {
            index.insert(new.to_string(), job);
        }
    }

    pub fn lookup(&self, remote_id: &str) -> Option<JobId> {
        self.0.get().get(remote_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.get().is_empty()
    }
}

/// Which user-visible events were already emitted for the current submission.
#[derive(Debug, Default, Clone, Copy)]
struct LoggedEvents {
    submit: bool,
    execute: bool,
    evict: bool,
    terminate: bool,
    abort: bool,
    hold: bool,
}

/// Local side of a managed job: its queue record and the notifications derived from it.
pub struct JobRecord {
    id: JobId,
    queue: JobQueueRef,
    events: EventLogRef,
    remote_ids: RemoteIdIndex,
    logged: LoggedEvents,
    resource_down_logged: bool,
}

impl JobRecord {
    pub fn new(id: JobId, queue: JobQueueRef, events: EventLogRef, remote_ids: RemoteIdIndex) -> Self {
        let record = Self {
            id,
            queue,
            events,
            remote_ids,
            logged: Default::default(),
            resource_down_logged: false,
        };
        if let Some(grid_id) = record.get_str(GRID_JOB_ID) {
            record.remote_ids.replace(id, None, Some(&grid_id));
        }
        record
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn queue(&self) -> &JobQueueRef {
        &self.queue
    }

    pub fn lookup(&self, attr: &str) -> Option<AttrValue> {
        self.queue.get().lookup(self.id, attr)
    }

    pub fn get_str(&self, attr: &str) -> Option<String> {
        self.lookup(attr).and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    pub fn get_int(&self, attr: &str) -> Option<i64> {
        self.lookup(attr).and_then(|v| v.as_int())
    }

    pub fn get_bool(&self, attr: &str) -> bool {
        self.lookup(attr).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn assign<V: Into<AttrValue>>(&self, attr: &str, value: V) {
        self.queue.get_mut().assign(self.id, attr, value.into());
    }

    pub fn remove_attr(&self, attr: &str) {
        self.queue.get_mut().remove_attr(self.id, attr);
    }

    pub fn is_dirty(&self, attr: &str) -> bool {
        self.queue.get().is_dirty(self.id, attr)
    }

    /// Applies attributes changed outside of the grid manager.
    pub fn apply_update(&self, attrs: JobAttributes) {
        let mut queue = self.queue.get_mut();
        for (name, value) in attrs {
            queue.assign(self.id, &name, value);
        }
    }

    pub fn request_update(&self, wait: bool, waker: &Rc<Notify>) -> UpdateStatus {
        self.queue.get_mut().request_update(self.id, wait, waker)
    }

    pub fn status(&self) -> JobStatus {
        self.get_int(JOB_STATUS)
            .and_then(JobStatus::from_code)
            .unwrap_or(JobStatus::Idle)
    }

    fn set_status(&self, status: JobStatus) {
        if self.status() != status {
            self.assign(JOB_STATUS, status.code());
            self.assign(ENTERED_CURRENT_STATUS, unix_time());
        }
    }

    fn event(&self, kind: JobEventKind, message: String) {
        self.events.get_mut().add(self.id, kind, message);
    }

    pub fn submit_logged(&self) -> bool {
        self.logged.submit
    }

    pub fn reset_logged_events(&mut self) {
        self.logged = Default::default();
    }

    /// Marks notifications of an earlier run as emitted, so that they are not repeated.
    pub fn restore_logged_events(&mut self) {
        self.logged.submit = true;
        if matches!(self.status(), JobStatus::Running | JobStatus::Completed) {
            self.logged.execute = true;
        }
    }

    pub fn job_submitted(&mut self, endpoint: &str) {
        if !self.logged.submit {
            self.event(JobEventKind::Submit, endpoint.to_string());
            self.logged.submit = true;
        }
    }

    pub fn job_running(&mut self) {
        if self.status() == JobStatus::Idle {
            self.set_status(JobStatus::Running);
        }
        if !self.logged.execute {
            self.event(JobEventKind::Execute, String::new());
            self.logged.execute = true;
        }
    }

    /// A running job goes back to idle; any other disposition is kept.
    pub fn job_idle(&mut self) {
        if self.status() == JobStatus::Running {
            self.job_evicted();
        }
    }

    pub fn job_evicted(&mut self) {
        if !self.logged.evict {
            self.event(JobEventKind::Evicted, String::new());
            self.logged.evict = true;
        }
        if self.status() == JobStatus::Running {
            self.set_status(JobStatus::Idle);
        }
    }

    pub fn job_terminated(&mut self) {
        if !self.logged.execute {
            self.job_running();
        }
        if !self.logged.terminate {
            self.event(JobEventKind::Terminated, String::new());
            self.logged.terminate = true;
        }
        self.job_completed();
    }

    pub fn job_completed(&mut self) {
        if !self.status().is_removed_or_held() {
            self.set_status(JobStatus::Completed);
        }
    }

    pub fn job_removed(&mut self, reason: &str) {
        self.set_status(JobStatus::Removed);
        if !self.logged.abort {
            self.event(JobEventKind::Aborted, reason.to_string());
            self.logged.abort = true;
        }
    }

    /// Puts the job on hold; a nonessential job is removed instead.
    pub fn job_held(&mut self, reason: &str, code: i64, subcode: i64) {
        if self.get_bool(NONESSENTIAL) {
            self.job_removed(reason);
            return;
        }
        if self.status() != JobStatus::Held {
            self.set_status(JobStatus::Held);
            let holds = self.get_int(NUM_SYSTEM_HOLDS).unwrap_or(0);
            self.assign(NUM_SYSTEM_HOLDS, holds + 1);
        }
        self.assign(HOLD_REASON, reason);
        self.assign(HOLD_REASON_CODE, code);
        self.assign(HOLD_REASON_SUBCODE, subcode);
        if !self.logged.hold {
            self.event(JobEventKind::Held, reason.to_string());
            self.logged.hold = true;
        }
    }

    /// Gives the job back to the local scheduler.
    pub fn done_with_job(&mut self) {
        let managed = match self.status() {
            JobStatus::Completed | JobStatus::Removed => MANAGED_DONE,
            JobStatus::Held | JobStatus::Idle => MANAGED_SCHEDD,
            JobStatus::Running => {
                log::error!("({}) Job is still running while being released", self.id);
                MANAGED_SCHEDD
            }
        };
        self.assign(MANAGED, managed);
    }

    pub fn grid_job_id(&self) -> Option<GridJobId> {
        self.get_str(GRID_JOB_ID)
            .and_then(|text| GridJobId::parse(&text).ok())
    }

    pub fn set_grid_job_id(&mut self, id: Option<&GridJobId>) {
        let old = self.get_str(GRID_JOB_ID);
        let new = id.map(|id| id.to_string());
        if old == new {
            return;
        }
        self.remote_ids
            .replace(self.id, old.as_deref(), new.as_deref());
        match new {
            Some(new) => self.assign(GRID_JOB_ID, new),
            None => self.remove_attr(GRID_JOB_ID),
        }
    }

    pub fn remote_status(&self) -> Option<String> {
        self.get_str(GRID_JOB_STATUS)
    }

    /// Records a status reported by the remote side. Returns true when it differs from the
    /// previous one.
    pub fn set_remote_status(&mut self, status: Option<&str>) -> bool {
        self.assign(LAST_REMOTE_STATUS_UPDATE, unix_time());
        if self.get_bool(CURRENT_STATUS_UNKNOWN) {
            self.assign(CURRENT_STATUS_UNKNOWN, false);
            self.event(JobEventKind::StatusKnown, String::new());
        }
        if self.remote_status().as_deref() == status {
            return false;
        }
        match status {
            Some(status) => self.assign(GRID_JOB_STATUS, status),
            None => self.remove_attr(GRID_JOB_STATUS),
        }
        true
    }

    /// Flags the remote status as unknown when no update arrived for `stale_limit`.
    pub fn check_remote_status(&mut self, stale_limit: Duration) -> bool {
        if self.remote_status().is_none() || self.get_bool(CURRENT_STATUS_UNKNOWN) {
            return false;
        }
        let last_update = self.get_int(LAST_REMOTE_STATUS_UPDATE).unwrap_or(0);
        if unix_time() - last_update <= stale_limit.as_secs() as i64 {
            return false;
        }
        self.assign(CURRENT_STATUS_UNKNOWN, true);
        self.event(JobEventKind::StatusUnknown, String::new());
        true
    }

    pub fn notify_resource_down(&mut self, since: Option<i64>) {
        if self.resource_down_logged {
            return;
        }
        self.resource_down_logged = true;
        self.assign(GRID_RESOURCE_UNAVAILABLE_TIME, since.unwrap_or_else(unix_time));
        self.event(JobEventKind::ResourceDown, String::new());
    }

    pub fn notify_resource_up(&mut self) {
        if !self.resource_down_logged {
            return;
        }
        self.resource_down_logged = false;
        self.remove_attr(GRID_RESOURCE_UNAVAILABLE_TIME);
        self.event(JobEventKind::ResourceUp, String::new());
    }
}

impl Drop for JobRecord {
    fn drop(&mut self) {
        if let Some(grid_id) = self.get_str(GRID_JOB_ID) {
            self.remote_ids.replace(self.id, Some(&grid_id), None);
        }
    }
}
