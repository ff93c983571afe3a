//! Per-endpoint admission control and health tracking.
//!
//! One [`Resource`] exists for every (endpoint, credential) pair. It bounds how many of its
//! jobs may have a submission in flight, and pings the endpoint so that its jobs can stop
//! issuing calls while it is unreachable.

mod limiter;
mod registry;

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::common::config::GridManagerConfig;
use crate::common::utils::unix_time;
use crate::gahp::{AUTH_FAILED_ERROR_CODE, CallResult, GahpClient, GahpMode, GahpRequest, GahpServerRef};
use crate::{JobId, Map, Set};

pub use limiter::{RateLimiterStatus, SUBMISSION_DELAYS, SubmitRateLimiter};
pub use registry::ResourceRegistry;

pub const PING_COMMAND: &str = "PING";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub endpoint: String,
    /// Identity of the credential (e.g. proxy subject or access key).
    pub credential: String,
}

impl ResourceKey {
    pub fn new(endpoint: &str, credential: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            credential: credential.to_string(),
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.credential.is_empty() {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{}#{}", self.endpoint, self.credential)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unknown,
    Up,
    Down,
}

pub struct Resource {
    key: ResourceKey,
    server: GahpServerRef,
    state: ResourceState,
    first_ping_done: bool,
    /// A job asked for a ping that has not finished yet.
    ping_pending: bool,
    auth_failure: Option<String>,
    /// Unix time since which the resource is unreachable.
    unavailable_since: Option<i64>,

    /// Registered jobs and their wakers.
    jobs: Map<JobId, Rc<Notify>>,
    submits_allowed: Set<JobId>,
    /// Jobs waiting for a permit, in arrival order.
    submits_wanted: VecDeque<JobId>,
    max_submits_allowed: usize,
    limiter: SubmitRateLimiter,

    ping_interval: Duration,
    ping_timeout: Duration,
    probe_interval: Duration,
    ping_waker: Rc<Notify>,
    ping_task: Option<JoinHandle<()>>,
}

sandbox::define_wrapped_type!(ResourceRef, Resource, pub);

impl Resource {
    pub fn new(key: ResourceKey, server: GahpServerRef, config: &GridManagerConfig) -> Self {
        Self {
            key,
            server,
            state: ResourceState::Unknown,
            first_ping_done: false,
            ping_pending: false,
            auth_failure: None,
            unavailable_since: None,
            jobs: Default::default(),
            submits_allowed: Default::default(),
            submits_wanted: Default::default(),
            max_submits_allowed: config.max_submits_allowed.max(1),
            limiter: Default::default(),
            ping_interval: config.ping_interval,
            ping_timeout: config.gahp_call_timeout,
            probe_interval: config.probe_interval,
            ping_waker: Rc::new(Notify::new()),
            ping_task: None,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn server(&self) -> &GahpServerRef {
        &self.server
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn is_down(&self) -> bool {
        self.state == ResourceState::Down
    }

    pub fn state_known(&self) -> bool {
        self.state != ResourceState::Unknown
    }

    pub fn first_ping_done(&self) -> bool {
        self.first_ping_done
    }

    pub fn ping_pending(&self) -> bool {
        self.ping_pending
    }

    pub fn auth_failure(&self) -> Option<&str> {
        self.auth_failure.as_deref()
    }

    pub fn unavailable_since(&self) -> Option<i64> {
        self.unavailable_since
    }

    pub fn poll_interval(&self) -> Duration {
        self.probe_interval
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn submits_in_flight(&self) -> usize {
        self.submits_allowed.len()
    }

    pub fn ping_request(&self) -> GahpRequest {
        GahpRequest::new(PING_COMMAND, [&self.key.endpoint, &self.key.credential])
    }

    /// Asks for a submit permit. Calling it again while waiting or while holding the
    /// permit does not change anything. Permits are granted in the order of the
    /// first request.
    pub fn request_submit(&mut self, job: JobId) -> bool {
        if self.submits_allowed.contains(&job) {
            return true;
        }
        if !self.submits_wanted.contains(&job) {
            self.submits_wanted.push_back(job);
        }
        if self.submits_allowed.len() >= self.max_submits_allowed
            || self.submits_wanted.front() != Some(&job)
            || self.limiter.status() == RateLimiterStatus::Wait
        {
            return false;
        }
        self.submits_wanted.pop_front();
        self.submits_allowed.insert(job);
        self.limiter.on_submission_attempt();
        log::debug!(
            "Resource {}: submit permit granted to {job} ({}/{})",
            self.key,
            self.submits_allowed.len(),
            self.max_submits_allowed
        );
        true
    }

    /// Withdraws a permit request or gives the permit back without a submission outcome.
    pub fn cancel_submit(&mut self, job: JobId) {
        self.submits_wanted.retain(|id| *id != job);
        if self.submits_allowed.remove(&job) {
            log::debug!("Resource {}: submit permit of {job} cancelled", self.key);
            self.wake_next_waiter();
        }
    }

    /// Releases the permit after the submission finished. Without a permit this does nothing.
    pub fn submit_complete(&mut self, job: JobId, success: bool) {
        if !self.submits_allowed.remove(&job) {
            return;
        }
        if success {
            self.limiter.on_submission_success();
        } else {
            self.limiter.on_submission_fail();
        }
        self.wake_next_waiter();
    }

    pub fn holds_permit(&self, job: JobId) -> bool {
        self.submits_allowed.contains(&job)
    }

    fn wake_next_waiter(&self) {
        let free = self
            .max_submits_allowed
            .saturating_sub(self.submits_allowed.len());
        for job in self.submits_wanted.iter().take(free) {
            if let Some(waker) = self.jobs.get(job) {
                waker.notify_one();
            }
        }
    }

    pub fn unregister_job(&mut self, job: JobId) {
        self.cancel_submit(job);
        self.jobs.remove(&job);
    }

    pub fn request_ping(&mut self, job: JobId) {
        log::debug!("Resource {}: ping requested by {job}", self.key);
        self.ping_pending = true;
        self.ping_waker.notify_one();
    }

    pub fn notify_up(&mut self) {
        self.auth_failure = None;
        self.ping_done(ResourceState::Up);
    }

    pub fn notify_down(&mut self) {
        self.ping_done(ResourceState::Down);
    }

    fn ping_done(&mut self, state: ResourceState) {
        let changed = self.state != state || !self.first_ping_done || self.ping_pending;
        if self.state != state {
            match state {
                ResourceState::Up => {
                    log::info!("Resource {} is up", self.key);
                    self.unavailable_since = None;
                }
                ResourceState::Down => {
                    log::warn!("Resource {} is down", self.key);
                    self.unavailable_since = Some(unix_time());
                }
                ResourceState::Unknown => {}
            }
        }
        self.state = state;
        self.first_ping_done = true;
        self.ping_pending = false;
        if changed {
            self.wake_all();
        }
    }

    fn wake_all(&self) {
        for waker in self.jobs.values() {
            waker.notify_one();
        }
    }

    pub fn reconfig(&mut self, config: &GridManagerConfig) {
        self.max_submits_allowed = config.max_submits_allowed.max(1);
        self.ping_interval = config.ping_interval;
        self.ping_timeout = config.gahp_call_timeout;
        self.probe_interval = config.probe_interval;
        // Permits above a lowered limit are kept until their jobs release them
        self.wake_next_waiter();
    }
}

impl ResourceRef {
    pub fn new(key: ResourceKey, server: GahpServerRef, config: &GridManagerConfig) -> Self {
        Self(crate::WrappedRcRefCell::wrap(Resource::new(key, server, config)))
    }

    /// Registers a job for health notifications. The job is woken right away when the
    /// resource state is already known.
    pub fn register_job(&self, job: JobId, waker: Rc<Notify>) {
        let mut resource = self.get_mut();
        if resource.state_known() {
            waker.notify_one();
        }
        resource.jobs.insert(job, waker);
        let running = resource
            .ping_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !running {
            resource.ping_task = Some(tokio::task::spawn_local(ping_process(self.clone())));
        }
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

/// Pings the endpoint while the resource has registered jobs.
async fn ping_process(resource: ResourceRef) {
    let (server, request, timeout, waker) = {
        let resource = resource.get();
        (
            resource.server.clone(),
            resource.ping_request(),
            resource.ping_timeout,
            resource.ping_waker.clone(),
        )
    };
    if let Err(error) = server.startup().await {
        log::warn!("Cannot ping {}: {error}", resource.get().key);
    }
    let mut client = GahpClient::new(server, Rc::new(Notify::new()), timeout);
    client.set_mode(GahpMode::Blocking);

    loop {
        if let CallResult::Done(reply) = client.call(request.clone()).await {
            let mut resource = resource.get_mut();
            if reply.success {
                resource.notify_up();
            } else {
                log::debug!(
                    "Ping of {} failed: {}",
                    resource.key,
                    reply.error_string()
                );
                if reply.error_code() == AUTH_FAILED_ERROR_CODE {
                    resource.auth_failure = Some(reply.error_string().to_string());
                }
                resource.notify_down();
            }
        }

        let interval = {
            let mut resource = resource.get_mut();
            if resource.jobs.is_empty() {
                log::debug!("Resource {} has no jobs, stopping pings", resource.key);
                resource.ping_task = None;
                return;
            }
            client.set_timeout(resource.ping_timeout);
            resource.ping_interval
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = waker.notified() => {}
        }
    }
}
