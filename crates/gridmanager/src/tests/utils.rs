use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::{Map, WrappedRcRefCell};
use crate::common::config::GridManagerConfig;
use crate::gahp::{
    GAHP_ERROR_CODE, GahpFuture, GahpReply, GahpRequest, GahpResult, GahpServer, GahpServerRef,
    GahpTransport,
};
use crate::job::{EventLogRef, JobContext, RemoteIdIndex};
use crate::proxy::ProxyManagerRef;
use crate::queue::{JobQueueRef, MemoryJobQueue, queue_ref};
use crate::staging::{
    HelperJobDescription, HelperJobId, HelperJobState, HelperJobStatus, LocalScheduler,
    SchedulerFuture,
};

pub fn init_test_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

struct MockTransport<F> {
    handler: F,
}

impl<F, Fut> GahpTransport for MockTransport<F>
where
    F: Fn(GahpRequest) -> Fut,
    Fut: Future<Output = GahpResult<GahpReply>> + 'static,
{
    fn start(&self) -> GahpFuture<()> {
        Box::pin(async { Ok(()) })
    }

    fn execute(&self, request: GahpRequest) -> GahpFuture<GahpReply> {
        Box::pin((self.handler)(request))
    }
}

/// Transport whose calls are answered by `handler`.
pub fn mock_transport<F, Fut>(handler: F) -> Box<dyn GahpTransport>
where
    F: Fn(GahpRequest) -> Fut + 'static,
    Fut: Future<Output = GahpResult<GahpReply>> + 'static,
{
    Box::new(MockTransport { handler })
}

pub fn mock_server<F, Fut>(handler: F) -> GahpServerRef
where
    F: Fn(GahpRequest) -> Fut + 'static,
    Fut: Future<Output = GahpResult<GahpReply>> + 'static,
{
    GahpServer::new("mock", mock_transport(handler))
}

/// Holds back mocked calls until it is opened.
#[derive(Clone)]
pub struct Gate {
    open: Rc<Cell<bool>>,
    notify: Rc<Notify>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            open: Rc::new(Cell::new(false)),
            notify: Rc::new(Notify::new()),
        }
    }

    pub fn open(&self) {
        self.open.set(true);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.open.get() {
                return;
            }
            notified.await;
        }
    }
}

/// Remote endpoint simulated by the tests of the job state machine.
pub struct MockRemote {
    pub calls: Vec<GahpRequest>,
    pub up: bool,
    /// Replies of the following submit calls; an empty queue means success.
    pub submit_replies: VecDeque<GahpReply>,
    pub lookup_reply: Option<GahpReply>,
    pub cancel_reply: Option<GahpReply>,
    pub remote_status: String,
    pub submit_gate: Gate,
    pub status_gate: Gate,
    next_handle: u32,
}

impl Default for MockRemote {
    fn default() -> Self {
        let submit_gate = Gate::closed();
        submit_gate.open();
        let status_gate = Gate::closed();
        status_gate.open();
        Self {
            calls: vec![],
            up: true,
            submit_replies: Default::default(),
            lookup_reply: None,
            cancel_reply: None,
            remote_status: "RUNNING".to_string(),
            submit_gate,
            status_gate,
            next_handle: 0,
        }
    }
}

impl MockRemote {
    /// Number of issued calls whose command ends with `suffix`.
    pub fn count(&self, suffix: &str) -> usize {
        self.calls
            .iter()
            .filter(|c| c.command.ends_with(suffix))
            .count()
    }
}

pub fn mock_remote_server(remote: WrappedRcRefCell<MockRemote>) -> GahpServerRef {
    GahpServer::new("mock", mock_remote_transport(remote))
}

pub fn mock_remote_transport(remote: WrappedRcRefCell<MockRemote>) -> Box<dyn GahpTransport> {
    mock_transport(move |request: GahpRequest| {
        let remote = remote.clone();
        async move {
            remote.get_mut().calls.push(request.clone());
            let command = request.command.as_str();
            if command == crate::resource::PING_COMMAND {
                let up = remote.get().up;
                return Ok(if up {
                    GahpReply::ok(Vec::<String>::new())
                } else {
                    GahpReply::failed(GAHP_ERROR_CODE, "Connection refused")
                });
            }
            if command.ends_with("_INSERT") || command.ends_with("_SUBMIT") {
                let gate = remote.get().submit_gate.clone();
                gate.wait().await;
                let mut remote = remote.get_mut();
                return Ok(match remote.submit_replies.pop_front() {
                    Some(reply) => reply,
                    None => {
                        remote.next_handle += 1;
                        GahpReply::ok([format!("vm-{}", remote.next_handle)])
                    }
                });
            }
            if command.ends_with("_STATUS") {
                let gate = remote.get().status_gate.clone();
                gate.wait().await;
                return Ok(GahpReply::ok([remote.get().remote_status.clone()]));
            }
            if command.ends_with("_DELETE") || command.ends_with("_CANCEL") {
                return Ok(remote
                    .get()
                    .cancel_reply
                    .clone()
                    .unwrap_or_else(|| GahpReply::ok(Vec::<String>::new())));
            }
            if command.ends_with("_LOOKUP") {
                return Ok(remote
                    .get()
                    .lookup_reply
                    .clone()
                    .unwrap_or_else(|| GahpReply::ok(Vec::<String>::new())));
            }
            Ok::<_, anyhow::Error>(GahpReply::failed("UNKNOWN", "Unknown command"))
        }
    })
}

pub struct TestContext {
    pub ctx: JobContext,
    pub queue: JobQueueRef,
}

pub fn test_context(config: GridManagerConfig) -> TestContext {
    let queue = queue_ref(MemoryJobQueue::default());
    TestContext {
        ctx: JobContext {
            config: Rc::new(config),
            queue: queue.clone(),
            proxies: ProxyManagerRef::default(),
            remote_ids: RemoteIdIndex::default(),
            events: EventLogRef::default(),
            staging: None,
        },
        queue,
    }
}

pub struct MockHelperJob {
    pub description: HelperJobDescription,
    pub status: HelperJobStatus,
    pub stdout: String,
    pub stderr: String,
    pub spooled: Vec<PathBuf>,
}

#[derive(Default)]
pub struct MockSchedulerState {
    pub jobs: Map<HelperJobId, MockHelperJob>,
    pub submitted: Vec<HelperJobId>,
    pub removed: Vec<HelperJobId>,
    /// Submitted helpers start right away and listen at this address.
    pub auto_start: Option<String>,
    pub fail_submit: bool,
    next_id: u64,
}

/// Local scheduler whose helper jobs only exist in memory.
#[derive(Clone, Default)]
pub struct MockScheduler(pub WrappedRcRefCell<MockSchedulerState>);

impl MockScheduler {
    pub fn add_job(&self, owner: &str, status: HelperJobStatus, stdout: &str) -> HelperJobId {
        let mut state = self.0.get_mut();
        state.next_id += 1;
        let id = HelperJobId::new(state.next_id);
        state.jobs.insert(
            id,
            MockHelperJob {
                description: HelperJobDescription {
                    owner: owner.to_string(),
                    command: PathBuf::from("helper"),
                    args: vec![],
                    attributes: Default::default(),
                },
                status,
                stdout: stdout.to_string(),
                stderr: String::new(),
                spooled: vec![],
            },
        );
        id
    }

    pub fn set_status(&self, job: HelperJobId, status: HelperJobStatus, stdout: &str, stderr: &str) {
        let mut state = self.0.get_mut();
        let job = state.jobs.get_mut(&job).unwrap();
        job.status = status;
        job.stdout = stdout.to_string();
        job.stderr = stderr.to_string();
    }

    pub fn submitted(&self) -> Vec<HelperJobId> {
        self.0.get().submitted.clone()
    }

    pub fn args(&self, job: HelperJobId) -> Vec<String> {
        self.0.get().jobs[&job].description.args.clone()
    }

    pub fn attribute(&self, job: HelperJobId, name: &str) -> Option<String> {
        self.0.get().jobs[&job].description.attributes.get(name).cloned()
    }

    pub fn spooled(&self, job: HelperJobId) -> usize {
        self.0.get().jobs[&job].spooled.len()
    }
}

impl LocalScheduler for MockScheduler {
    fn submit(&self, job: HelperJobDescription) -> SchedulerFuture<HelperJobId> {
        let result = if self.0.get().fail_submit {
            Err(anyhow::anyhow!("Scheduler is not available"))
        } else {
            let owner = job.owner.clone();
            let auto_start = self.0.get().auto_start.clone();
            let id = match &auto_start {
                Some(address) => self.add_job(
                    &owner,
                    HelperJobStatus::Running,
                    &format!("Server listening at {address}\n"),
                ),
                None => self.add_job(&owner, HelperJobStatus::Idle, ""),
            };
            let mut state = self.0.get_mut();
            state.submitted.push(id);
            if let Some(entry) = state.jobs.get_mut(&id) {
                entry.description = job;
            }
            Ok(id)
        };
        Box::pin(async move { result })
    }

    fn spool_input_files(&self, job: HelperJobId, files: Vec<PathBuf>) -> SchedulerFuture<()> {
        let result = match self.0.get_mut().jobs.get_mut(&job) {
            Some(entry) => {
                entry.spooled.extend(files);
                Ok(())
            }
            None => Err(anyhow::anyhow!("Unknown job {job}")),
        };
        Box::pin(async move { result })
    }

    fn remove_job(&self, job: HelperJobId, _reason: &str) -> SchedulerFuture<()> {
        let mut state = self.0.get_mut();
        state.jobs.remove(&job);
        state.removed.push(job);
        Box::pin(async move { Ok(()) })
    }

    fn job_status(&self, job: HelperJobId) -> SchedulerFuture<Option<HelperJobState>> {
        let state = self.0.get().jobs.get(&job).map(|entry| HelperJobState {
            status: entry.status,
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
        });
        Box::pin(async move { Ok(state) })
    }

    fn set_attribute(&self, job: HelperJobId, name: &str, value: String) -> SchedulerFuture<()> {
        if let Some(entry) = self.0.get_mut().jobs.get_mut(&job) {
            entry.description.attributes.insert(name.to_string(), value);
        }
        Box::pin(async move { Ok(()) })
    }

    fn find_jobs(&self, owner: &str) -> SchedulerFuture<Vec<HelperJobId>> {
        let mut jobs: Vec<HelperJobId> = self
            .0
            .get()
            .jobs
            .iter()
            .filter(|(_, entry)| entry.description.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        jobs.sort();
        Box::pin(async move { Ok(jobs) })
    }
}
