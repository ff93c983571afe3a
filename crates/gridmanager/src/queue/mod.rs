//! Persistent store of job records.
//!
//! Jobs change their record through [`JobQueue::assign`]; changed attributes are written
//! out by the next [`JobQueue::flush`]. A job that has to be sure that its changes are
//! stored asks for a blocking update and is woken up once the flush went through.

pub mod attrs;
mod file;
mod memory;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{JobId, Map, Set, WrappedRcRefCell};

pub use file::FileJobQueue;
pub use memory::MemoryJobQueue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(value) => Some(*value),
            AttrValue::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    /// Parses a literal the way it is written in a constraint.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(inner) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            return AttrValue::String(inner.to_string());
        }
        match text {
            "true" | "TRUE" | "True" => AttrValue::Bool(true),
            "false" | "FALSE" | "False" => AttrValue::Bool(false),
            _ => match text.parse::<i64>() {
                Ok(value) => AttrValue::Int(value),
                Err(_) => AttrValue::String(text.to_string()),
            },
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::Int(value) => write!(f, "{value}"),
            AttrValue::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        AttrValue::Int(value as i64)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

pub type JobAttributes = Map<String, AttrValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Done,
    /// The update was requested, the caller is woken up once it is stored.
    Pending,
}

#[derive(Default)]
struct JobEntry {
    attrs: JobAttributes,
    dirty: Set<String>,
}

/// In-memory view of the queue shared by all implementations.
#[derive(Default)]
pub struct QueueStore {
    jobs: BTreeMap<JobId, JobEntry>,
    waiters: Vec<(JobId, Rc<Notify>)>,
}

impl QueueStore {
    fn dirty_jobs(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|(_, entry)| !entry.dirty.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    fn job_attributes(&self, job: JobId) -> Option<&JobAttributes> {
        self.jobs.get(&job).map(|entry| &entry.attrs)
    }

    fn mark_flushed(&mut self, jobs: &[JobId]) {
        for job in jobs {
            if let Some(entry) = self.jobs.get_mut(job) {
                entry.dirty.clear();
            }
        }
        for (_, waker) in self.waiters.drain(..) {
            waker.notify_one();
        }
    }
}

/// Job record store.
///
/// Implementations only decide how flushed records are persisted.
pub trait JobQueue {
    fn store(&self) -> &QueueStore;
    fn store_mut(&mut self) -> &mut QueueStore;

    /// Writes out the given jobs. On failure nothing is considered flushed.
    fn persist(&mut self, jobs: &[JobId]) -> crate::Result<()>;

    fn jobs(&self) -> Vec<JobId> {
        self.store().jobs.keys().copied().collect()
    }

    fn attributes(&self, job: JobId) -> Option<JobAttributes> {
        self.store().job_attributes(job).cloned()
    }

    fn add_job(&mut self, job: JobId, attrs: JobAttributes) {
        self.store_mut().jobs.insert(
            job,
            JobEntry {
                attrs,
                dirty: Default::default(),
            },
        );
    }

    fn lookup(&self, job: JobId, attr: &str) -> Option<AttrValue> {
        self.store()
            .job_attributes(job)
            .and_then(|attrs| attrs.get(attr))
            .cloned()
    }

    /// Assigns an attribute. Only a changed value makes the attribute dirty.
    fn assign(&mut self, job: JobId, attr: &str, value: AttrValue) {
        let entry = self.store_mut().jobs.entry(job).or_default();
        if entry.attrs.get(attr) != Some(&value) {
            entry.attrs.insert(attr.to_string(), value);
            entry.dirty.insert(attr.to_string());
        }
    }

    fn remove_attr(&mut self, job: JobId, attr: &str) {
        if let Some(entry) = self.store_mut().jobs.get_mut(&job) {
            if entry.attrs.remove(attr).is_some() {
                entry.dirty.insert(attr.to_string());
            }
        }
    }

    fn is_dirty(&self, job: JobId, attr: &str) -> bool {
        self.store()
            .jobs
            .get(&job)
            .is_some_and(|entry| entry.dirty.contains(attr))
    }

    fn has_dirty_attributes(&self, job: JobId) -> bool {
        self.store()
            .jobs
            .get(&job)
            .is_some_and(|entry| !entry.dirty.is_empty())
    }

    /// Asks for the job's dirty attributes to be stored. With `wait`, the caller gets
    /// [`UpdateStatus::Pending`] and `waker` is notified after the next flush. Asking
    /// again while the update is pending is fine.
    fn request_update(&mut self, job: JobId, wait: bool, waker: &Rc<Notify>) -> UpdateStatus {
        if !wait || !self.has_dirty_attributes(job) {
            return UpdateStatus::Done;
        }
        let store = self.store_mut();
        if !store
            .waiters
            .iter()
            .any(|(id, w)| *id == job && Rc::ptr_eq(w, waker))
        {
            store.waiters.push((job, waker.clone()));
        }
        UpdateStatus::Pending
    }

    /// Persists every dirty job and wakes the jobs waiting for it.
    fn flush(&mut self) -> crate::Result<()> {
        let jobs = self.store().dirty_jobs();
        if jobs.is_empty() && self.store().waiters.is_empty() {
            return Ok(());
        }
        self.persist(&jobs)?;
        self.store_mut().mark_flushed(&jobs);
        Ok(())
    }
}

pub type JobQueueRef = WrappedRcRefCell<dyn JobQueue>;

pub fn queue_ref<Q: JobQueue + 'static>(queue: Q) -> JobQueueRef {
    WrappedRcRefCell::new_wrapped(Rc::new(RefCell::new(queue)))
}

/// Periodically flushes the queue. Failed flushes are retried on the next tick.
pub async fn flush_process(queue: JobQueueRef, interval: Duration) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        if let Err(error) = queue.get_mut().flush() {
            log::error!("Cannot flush job queue: {error}");
        }
    }
}

/// Simple `attribute == value` job selection.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConstraint {
    attr: String,
    value: AttrValue,
}

impl JobConstraint {
    pub fn parse(text: &str) -> crate::Result<Self> {
        let invalid = |reason: &str| crate::Error::InvalidConstraint {
            constraint: text.to_string(),
            reason: reason.to_string(),
        };
        let (attr, value) = text
            .split_once("==")
            .ok_or_else(|| invalid("expected `attribute == value`"))?;
        let attr = attr.trim();
        if attr.is_empty() {
            return Err(invalid("missing attribute"));
        }
        Ok(Self {
            attr: attr.to_string(),
            value: AttrValue::parse(value),
        })
    }

    pub fn matches(&self, attrs: &JobAttributes) -> bool {
        attrs.get(&self.attr) == Some(&self.value)
    }
}
