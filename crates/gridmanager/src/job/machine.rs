use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::common::config::GridManagerConfig;
use crate::common::utils::unix_time;
use crate::gahp::{CallResult, GahpClient, GahpMode, GahpReply, GahpServerRef};
use crate::job::driver::{
    BackendDriver, NEEDS_CHECK_ERROR_CODE, NOT_FOUND_ERROR_CODE, OVER_CAPACITY_ERROR_CODE,
    SubmitParams,
};
use crate::job::grid_id::{GridJobId, GridResource};
use crate::job::record::JobRecord;
use crate::job::state::GmState;
use crate::job::validate::JobInstance;
use crate::job::{JobContext, JobId, JobStatus};
use crate::proxy::Proxy;
use crate::queue::attrs::*;
use crate::queue::{JobAttributes, UpdateStatus};
use crate::resource::{ResourceKey, ResourceRef, ResourceRegistry};
use crate::staging::StagingServerRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// The job waits for a wake-up or its deadline.
    Continue,
    /// The job reached its end and was flushed; it can be dropped.
    Finished,
}

/// Remote side of a job that passed validation.
struct Backend {
    driver: Box<dyn BackendDriver>,
    grid_resource: GridResource,
    key: ResourceKey,
    resource: ResourceRef,
    gahp: GahpClient,
    proxy: Option<Proxy>,
    staging: Option<StagingServerRef>,
}

/// State machine of one managed job.
pub struct RemoteJob {
    id: JobId,
    ctx: JobContext,
    record: JobRecord,
    backend: Option<Backend>,

    gm_state: GmState,
    enter_time: Instant,
    waker: Rc<Notify>,
    deadline: Option<Instant>,
    finished: bool,
    released: bool,

    error_string: String,
    submit_key: Option<String>,
    handle: Option<String>,
    keypair: Option<String>,
    num_submit_attempts: u32,
    retry_times: u32,
    last_submit_attempt: Option<Instant>,
    last_probe: Option<Instant>,
    probe_now: bool,
    /// State interrupted by an expiring credential.
    resume_state: Option<GmState>,
}

fn reply_error(reply: &GahpReply) -> String {
    match (reply.error_code(), reply.error_string()) {
        ("", "") => "Unknown remote error".to_string(),
        (code, "") => code.to_string(),
        (_, text) => text.to_string(),
    }
}

fn is_not_found(reply: &GahpReply) -> bool {
    reply.error_code() == NOT_FOUND_ERROR_CODE || reply.error_string().contains("was not found")
}

impl RemoteJob {
    pub fn new(
        id: JobId,
        instance: JobInstance,
        ctx: JobContext,
        server: &GahpServerRef,
        resources: &mut ResourceRegistry,
    ) -> Self {
        let waker = Rc::new(Notify::new());
        let record = JobRecord::new(
            id,
            ctx.queue.clone(),
            ctx.events.clone(),
            ctx.remote_ids.clone(),
        );
        let num_submit_attempts = record
            .get_int(NUM_SUBMIT_ATTEMPTS)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);

        let mut job = Self {
            id,
            ctx,
            record,
            backend: None,
            gm_state: GmState::Init,
            enter_time: Instant::now(),
            waker,
            deadline: None,
            finished: false,
            released: false,
            error_string: String::new(),
            submit_key: None,
            handle: None,
            keypair: None,
            num_submit_attempts,
            retry_times: 0,
            last_submit_attempt: None,
            last_probe: None,
            probe_now: false,
            resume_state: None,
        };

        match instance {
            JobInstance::Valid(setup) => {
                let resource = resources.find_or_create(&setup.key, server, &job.ctx.config);
                resource.register_job(id, job.waker.clone());
                let proxy = setup.proxy.map(|proxy| {
                    job.ctx
                        .proxies
                        .get_mut()
                        .acquire(id, proxy, job.waker.clone())
                });
                if let Some(grid_id) = setup.grid_job_id {
                    job.keypair = setup.driver.keypair_name(&grid_id.submit_key);
                    job.submit_key = Some(grid_id.submit_key);
                    job.handle = grid_id.handle;
                }
                let gahp = GahpClient::new(
                    server.clone(),
                    job.waker.clone(),
                    job.ctx.config.gahp_call_timeout,
                );
                job.backend = Some(Backend {
                    driver: setup.driver,
                    grid_resource: setup.grid_resource,
                    key: setup.key,
                    resource,
                    gahp,
                    proxy,
                    staging: None,
                });
            }
            JobInstance::Rejected { reason } => {
                log::warn!("({id}) Job cannot be managed: {reason}");
                job.error_string = reason;
                job.gm_state = GmState::Hold;
            }
        }
        job
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn gm_state(&self) -> GmState {
        self.gm_state
    }

    pub fn waker(&self) -> Rc<Notify> {
        self.waker.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn resource(&self) -> Option<&ResourceRef> {
        self.backend.as_ref().map(|b| &b.resource)
    }

    pub fn has_pending_call(&self) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|b| b.gahp.pending_request_issued())
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self) -> Duration {
        self.enter_time.elapsed()
    }

    pub fn apply_update(&mut self, attrs: JobAttributes) {
        self.record.apply_update(attrs);
        self.waker.notify_one();
    }

    pub fn check_remote_status(&mut self) {
        let stale_limit = self.ctx.config.remote_status_stale_limit;
        if self.record.check_remote_status(stale_limit) {
            self.waker.notify_one();
        }
    }

    pub fn reconfig(&mut self, config: Rc<GridManagerConfig>) {
        if let Some(backend) = &mut self.backend {
            backend.gahp.set_timeout(config.gahp_call_timeout);
        }
        self.ctx.config = config;
        self.waker.notify_one();
    }

    fn set_deadline(&mut self, at: Instant) {
        self.deadline = Some(match self.deadline {
            Some(deadline) => deadline.min(at),
            None => at,
        });
    }

    fn retry_in(&mut self, delay: Duration) {
        self.set_deadline(Instant::now() + delay);
    }

    /// Runs the state machine until it has to wait.
    pub async fn evaluate(&mut self) -> Evaluation {
        if self.finished {
            return Evaluation::Finished;
        }
        self.deadline = None;
        self.update_mode();

        loop {
            let state = self.gm_state;
            let next = if self.credential_expiring(state) {
                if state == GmState::Submit {
                    if let Some(backend) = &self.backend {
                        backend.resource.get_mut().cancel_submit(self.id);
                    }
                }
                self.resume_state = Some(state);
                GmState::ProxyExpired
            } else {
                self.evaluate_state(state).await
            };
            if next == state {
                break;
            }
            self.change_state(next);
        }

        if self.finished {
            Evaluation::Finished
        } else {
            Evaluation::Continue
        }
    }

    /// Stops issuing calls while the resource is unreachable or its state is not known yet.
    fn update_mode(&mut self) {
        let Some(backend) = &mut self.backend else {
            return;
        };
        let (known, down, unavailable_since, mode) = {
            let resource = backend.resource.get();
            let mode = if !resource.state_known() || resource.ping_pending() || resource.is_down()
            {
                GahpMode::ResultsOnly
            } else {
                GahpMode::Normal
            };
            (
                resource.state_known(),
                resource.is_down(),
                resource.unavailable_since(),
                mode,
            )
        };
        backend.gahp.set_mode(mode);
        if down {
            self.record.notify_resource_down(unavailable_since);
        } else if known {
            self.record.notify_resource_up();
        }
    }

    fn credential_expiring(&self, state: GmState) -> bool {
        if !state.is_interruptible() {
            return false;
        }
        let Some(proxy) = self.current_proxy() else {
            return false;
        };
        proxy.remaining_lifetime(unix_time()) < self.ctx.config.min_proxy_lifetime.as_secs() as i64
    }

    fn current_proxy(&self) -> Option<Proxy> {
        let path = &self.backend.as_ref()?.proxy.as_ref()?.path;
        self.ctx.proxies.get().get(path).cloned()
    }

    fn change_state(&mut self, next: GmState) {
        debug_assert!(
            self.gm_state.can_transition_to(next),
            "({}) invalid gm state change: {} -> {}",
            self.id,
            self.gm_state,
            next
        );
        log::debug!(
            "({}) gm state change: {} -> {}",
            self.id,
            self.gm_state,
            next
        );
        if let Some(backend) = &mut self.backend {
            backend.gahp.purge_pending_requests();
        }
        self.gm_state = next;
        self.enter_time = Instant::now();
        self.record.assign(ENTERED_CURRENT_GM_STATE, unix_time());
    }

    async fn evaluate_state(&mut self, state: GmState) -> GmState {
        match state {
            GmState::Hold => self.do_hold(),
            GmState::Delete => self.do_delete(),
            GmState::ProxyExpired => self.do_proxy_expired(),
            _ => {
                let Some(mut backend) = self.backend.take() else {
                    self.error_string = format!("Job without a grid resource in state {state}");
                    return GmState::Hold;
                };
                let next = self.evaluate_remote_state(state, &mut backend).await;
                self.backend = Some(backend);
                next
            }
        }
    }

    async fn evaluate_remote_state(&mut self, state: GmState, b: &mut Backend) -> GmState {
        match state {
            GmState::Init => self.do_init(b).await,
            GmState::Start => self.do_start(),
            GmState::ClearRequest => self.do_clear_request(b),
            GmState::SaveSubmitKey => self.do_save_submit_key(b),
            GmState::CreateKeypair => self.do_create_keypair(b).await,
            GmState::Submit => self.do_submit(b).await,
            GmState::SaveRemoteId => self.do_save_remote_id(),
            GmState::SeekRemoteId => self.do_seek_remote_id(b).await,
            GmState::Submitted => self.do_submitted(b),
            GmState::Probe => self.do_probe(b).await,
            GmState::Cancel => self.do_cancel(b).await,
            GmState::DoneSave => self.do_done_save(),
            GmState::DestroyKeypair => self.do_destroy_keypair(b).await,
            GmState::Hold | GmState::Delete | GmState::ProxyExpired => state,
        }
    }

    /// Waits for a blocking update of the job record.
    fn flushed(&self) -> bool {
        self.record.request_update(true, &self.waker) == UpdateStatus::Done
    }

    /// A call ended without a definite outcome; check the resource and retry later.
    fn retry_transient(&mut self, b: &Backend, state: GmState) -> GmState {
        log::debug!(
            "({}) {state}: transient failure: {}",
            self.id,
            b.gahp.error_string()
        );
        b.resource.get_mut().request_ping(self.id);
        self.retry_in(self.ctx.config.func_retry_interval);
        state
    }

    fn grid_job_id(&self, b: &Backend) -> Option<GridJobId> {
        let key = self.submit_key.as_deref()?;
        let id = GridJobId::new(b.driver.kind(), &b.grid_resource.endpoint, key);
        Some(match &self.handle {
            Some(handle) => id.with_handle(handle),
            None => id,
        })
    }

    fn set_handle(&mut self, b: &Backend, handle: Option<&str>) {
        self.handle = handle.map(|h| h.to_string());
        let id = self.grid_job_id(b);
        self.record.set_grid_job_id(id.as_ref());
    }

    async fn do_init(&mut self, b: &mut Backend) -> GmState {
        if let Err(error) = b.gahp.startup().await {
            self.error_string = format!("Failed to start GAHP: {error}");
            return GmState::Hold;
        }
        let resource = b.resource.get();
        if !resource.first_ping_done() {
            return GmState::Init;
        }
        if let Some(failure) = resource.auth_failure() {
            if self.record.status() == JobStatus::Removed && self.handle.is_none() {
                return GmState::Delete;
            }
            self.error_string = format!("Failed to authenticate: {failure}");
            return GmState::Hold;
        }
        GmState::Start
    }

    fn do_start(&mut self) -> GmState {
        match (&self.submit_key, &self.handle) {
            (None, _) => GmState::ClearRequest,
            (Some(_), None) => GmState::SeekRemoteId,
            (Some(_), Some(_)) => {
                self.record.restore_logged_events();
                self.probe_now = true;
                GmState::Submitted
            }
        }
    }

    fn do_clear_request(&mut self, b: &mut Backend) -> GmState {
        let status = self.record.status();
        let resubmit = self.record.get_bool(WANT_RESUBMIT);
        if self.handle.is_some() && status != JobStatus::Removed && !resubmit {
            self.error_string = "Attempt to resubmit a job that still exists remotely".to_string();
            return GmState::Hold;
        }
        if resubmit {
            self.record.assign(WANT_RESUBMIT, false);
            if self.record.get_bool(REMATCH_CHECK) {
                self.record.assign(WANT_REMATCH, true);
            }
        }

        self.error_string.clear();
        b.resource.get_mut().cancel_submit(self.id);
        self.submit_key = None;
        self.keypair = None;
        self.retry_times = 0;
        self.set_handle(b, None);
        self.record.job_idle();
        self.record.remove_attr(GRID_JOB_STATUS);
        if !self.flushed() {
            return GmState::ClearRequest;
        }
        self.record.reset_logged_events();

        if self.record.get_bool(WANT_REMATCH) {
            log::info!("({}) Job is going to be rematched", self.id);
            return GmState::Delete;
        }
        if self.record.status().is_removed_or_held() {
            return GmState::Delete;
        }
        GmState::SaveSubmitKey
    }

    fn do_save_submit_key(&mut self, b: &mut Backend) -> GmState {
        if self.record.status().is_removed_or_held() {
            return GmState::ClearRequest;
        }
        if self.submit_key.is_none() {
            let key = b.driver.new_submit_key();
            self.keypair = b.driver.keypair_name(&key);
            self.submit_key = Some(key);
            self.set_handle(b, None);
        }
        if !self.flushed() {
            return GmState::SaveSubmitKey;
        }
        if self.keypair.is_some() {
            GmState::CreateKeypair
        } else {
            GmState::Submit
        }
    }

    async fn do_create_keypair(&mut self, b: &mut Backend) -> GmState {
        let Some(request) = self
            .keypair
            .as_deref()
            .and_then(|keypair| b.driver.create_keypair_request(&b.key, keypair))
        else {
            return GmState::Submit;
        };
        if self.record.status().is_removed_or_held() && !b.gahp.pending_request_issued() {
            return GmState::ClearRequest;
        }
        match b.gahp.call(request).await {
            CallResult::NotSubmitted | CallResult::Pending => GmState::CreateKeypair,
            CallResult::Done(reply) if reply.success => GmState::Submit,
            CallResult::Done(reply) if reply.is_transient() => {
                self.retry_transient(b, GmState::CreateKeypair)
            }
            CallResult::Done(reply) => {
                self.error_string = format!("Failed to create keypair: {}", reply_error(&reply));
                GmState::Hold
            }
        }
    }

    /// Base URL of the staging server, or `None` while it is not available yet.
    fn staging_url(&mut self, b: &mut Backend) -> Result<Option<String>, String> {
        if let Some(base) = &self.ctx.config.staging_url_base {
            return Ok(Some(base.clone()));
        }
        let (Some(manager), Some(proxy)) = (&self.ctx.staging, &b.proxy) else {
            return Err("No staging server is available for the job".to_string());
        };
        let server = match &b.staging {
            Some(server) => server.clone(),
            None => {
                let server = manager.find_or_create(proxy);
                let previous_url = self.record.get_str(STAGING_URL);
                server.register_client(self.id, self.waker.clone(), previous_url.as_deref());
                b.staging = Some(server.clone());
                server
            }
        };
        let server = server.get();
        if let Some(error) = server.error_message() {
            return Err(format!("Staging server failed: {error}"));
        }
        Ok(server.url_base())
    }

    fn submit_attributes(&self, b: &Backend) -> Vec<(String, String)> {
        let mut attributes: Vec<(String, String)> = b
            .driver
            .submit_attributes()
            .iter()
            .filter_map(|name| {
                let value = self.record.lookup(name)?;
                let value = match value.as_str() {
                    Some(text) => text.to_string(),
                    None => value.to_string(),
                };
                Some((name.to_string(), value))
            })
            .collect();
        attributes.sort();
        attributes
    }

    async fn do_submit(&mut self, b: &mut Backend) -> GmState {
        let config = self.ctx.config.clone();
        if self.record.status().is_removed_or_held() {
            // Nothing exists remotely without a handle, an outstanding call is abandoned
            b.resource.get_mut().cancel_submit(self.id);
            return GmState::ClearRequest;
        }
        let Some(submit_key) = self.submit_key.clone() else {
            return GmState::ClearRequest;
        };
        if !b.gahp.pending_request_issued() && self.num_submit_attempts >= config.max_submit_attempts
        {
            b.resource.get_mut().cancel_submit(self.id);
            self.error_string = "Maximum submit attempts exceeded".to_string();
            return GmState::Hold;
        }

        let staging_url = if b.driver.needs_staging() {
            match self.staging_url(b) {
                Ok(Some(url)) => {
                    self.record.assign(STAGING_URL, url.as_str());
                    Some(url)
                }
                Ok(None) => return GmState::Submit,
                Err(error) => {
                    self.error_string = error;
                    return GmState::Hold;
                }
            }
        } else {
            None
        };

        if let Some(last) = self.last_submit_attempt {
            let next_attempt = last + config.submit_interval;
            if Instant::now() < next_attempt && !b.gahp.pending_request_issued() {
                self.set_deadline(next_attempt);
                return GmState::Submit;
            }
        }
        if !b.resource.get_mut().request_submit(self.id) {
            // Woken up when a permit frees up; the rate limiter is polled
            self.retry_in(config.func_retry_interval);
            return GmState::Submit;
        }

        let params = SubmitParams {
            target: &b.key,
            submit_key: &submit_key,
            keypair: self.keypair.as_deref(),
            staging_url: staging_url.as_deref(),
            attributes: self.submit_attributes(b),
        };
        let request = b.driver.submit_request(&params);
        let reply = match b.gahp.call(request).await {
            CallResult::NotSubmitted | CallResult::Pending => return GmState::Submit,
            CallResult::Done(reply) => reply,
        };
        self.last_submit_attempt = Some(Instant::now());

        if reply.success {
            self.count_submit_attempt();
            let Some(handle) = reply.value(0).filter(|h| !h.is_empty()).map(|h| h.to_string())
            else {
                b.resource.get_mut().submit_complete(self.id, false);
                self.error_string = "Submission did not return a remote id".to_string();
                return GmState::Hold;
            };
            self.set_handle(b, Some(&handle));
            self.record.job_submitted(&b.grid_resource.endpoint);
            b.resource.get_mut().submit_complete(self.id, true);
            self.retry_times = 0;
            return GmState::SaveRemoteId;
        }

        match reply.error_code() {
            NEEDS_CHECK_ERROR_CODE => {
                b.resource.get_mut().cancel_submit(self.id);
                self.retry_times += 1;
                if self.retry_times <= config.max_retry_times {
                    log::debug!(
                        "({}) Submission may have succeeded, checking (attempt {})",
                        self.id,
                        self.retry_times
                    );
                    GmState::SeekRemoteId
                } else {
                    self.error_string = format!(
                        "Submission status could not be verified: {}",
                        reply_error(&reply)
                    );
                    GmState::Hold
                }
            }
            OVER_CAPACITY_ERROR_CODE => {
                log::debug!("({}) Resource is over capacity", self.id);
                b.resource.get_mut().cancel_submit(self.id);
                self.set_deadline(Instant::now() + config.submit_interval);
                GmState::Submit
            }
            _ if reply.is_transient() => {
                b.resource.get_mut().cancel_submit(self.id);
                b.resource.get_mut().request_ping(self.id);
                self.set_deadline(Instant::now() + config.submit_interval);
                GmState::Submit
            }
            _ => {
                self.count_submit_attempt();
                b.resource.get_mut().submit_complete(self.id, false);
                self.error_string = reply_error(&reply);
                GmState::Hold
            }
        }
    }

    fn count_submit_attempt(&mut self) {
        self.num_submit_attempts += 1;
        self.record
            .assign(NUM_SUBMIT_ATTEMPTS, self.num_submit_attempts);
    }

    fn do_save_remote_id(&mut self) -> GmState {
        if !self.flushed() {
            return GmState::SaveRemoteId;
        }
        self.probe_now = true;
        GmState::Submitted
    }

    async fn do_seek_remote_id(&mut self, b: &mut Backend) -> GmState {
        let Some(submit_key) = self.submit_key.clone() else {
            return GmState::Submit;
        };
        let request = b.driver.lookup_request(&b.key, &submit_key);
        match b.gahp.call(request).await {
            CallResult::NotSubmitted | CallResult::Pending => GmState::SeekRemoteId,
            CallResult::Done(reply) if reply.success => {
                match reply.value(0).filter(|h| !h.is_empty()).map(|h| h.to_string()) {
                    Some(handle) => {
                        log::debug!("({}) Found remote job {handle}", self.id);
                        self.set_handle(b, Some(&handle));
                        self.record.job_submitted(&b.grid_resource.endpoint);
                        GmState::SaveRemoteId
                    }
                    None if self.record.status() == JobStatus::Removed => GmState::Delete,
                    None => GmState::Submit,
                }
            }
            CallResult::Done(reply) if reply.is_transient() => {
                self.retry_transient(b, GmState::SeekRemoteId)
            }
            CallResult::Done(reply) => {
                self.error_string = reply_error(&reply);
                GmState::Hold
            }
        }
    }

    fn do_submitted(&mut self, b: &mut Backend) -> GmState {
        let config = self.ctx.config.clone();
        let remote_status = self.record.remote_status();
        if self.record.get_bool(WANT_RESUBMIT) || self.record.status().is_removed_or_held() {
            return GmState::Cancel;
        }
        if remote_status
            .as_deref()
            .is_some_and(|status| b.driver.is_terminated_status(status))
        {
            return GmState::DoneSave;
        }
        if self.probe_now {
            self.probe_now = false;
            return GmState::Probe;
        }
        let running = remote_status
            .as_deref()
            .is_some_and(|status| b.driver.is_running_status(status));
        let interval = if running {
            config.probe_interval
        } else {
            config.func_retry_interval
        };
        let now = Instant::now();
        match self.last_probe {
            Some(last) if now < last + interval => {
                self.set_deadline(last + interval);
                GmState::Submitted
            }
            _ => GmState::Probe,
        }
    }

    async fn do_probe(&mut self, b: &mut Backend) -> GmState {
        let Some(handle) = self.handle.clone() else {
            return GmState::Submitted;
        };
        let request = b.driver.status_request(&b.key, &handle);
        let reply = match b.gahp.call(request).await {
            CallResult::NotSubmitted | CallResult::Pending => return GmState::Probe,
            CallResult::Done(reply) => reply,
        };
        self.last_probe = Some(Instant::now());
        if reply.is_transient() {
            b.resource.get_mut().request_ping(self.id);
            return GmState::Submitted;
        }
        if !reply.success {
            self.error_string = reply_error(&reply);
            return GmState::Hold;
        }

        let status = reply.value(0).unwrap_or_default().to_string();
        if self.record.set_remote_status(Some(&status)) {
            log::debug!("({}) Remote status changed to {status}", self.id);
            if b.driver.is_running_status(&status) {
                self.record.job_running();
            }
            if b.driver.is_terminated_status(&status) && self.record.get_bool(RESUBMIT_CHECK) {
                log::info!("({}) Remote job ended, resubmitting", self.id);
                self.record.assign(WANT_RESUBMIT, true);
            }
        }
        GmState::Submitted
    }

    async fn do_cancel(&mut self, b: &mut Backend) -> GmState {
        if let Some(handle) = self.handle.clone() {
            let request = b.driver.cancel_request(&b.key, &handle);
            match b.gahp.call(request).await {
                CallResult::NotSubmitted | CallResult::Pending => return GmState::Cancel,
                CallResult::Done(reply) if reply.success || is_not_found(&reply) => {}
                CallResult::Done(reply) if reply.is_transient() => {
                    return self.retry_transient(b, GmState::Cancel);
                }
                CallResult::Done(reply) => {
                    self.error_string = reply_error(&reply);
                    return GmState::Hold;
                }
            }
        }

        b.resource.get_mut().cancel_submit(self.id);
        let status = self.record.status();
        if !self.record.get_bool(WANT_RESUBMIT)
            && matches!(status, JobStatus::Completed | JobStatus::Removed)
        {
            self.set_handle(b, None);
            if self.keypair.is_some() {
                GmState::DestroyKeypair
            } else {
                GmState::Delete
            }
        } else {
            self.set_handle(b, None);
            GmState::ClearRequest
        }
    }

    fn do_done_save(&mut self) -> GmState {
        self.record.job_terminated();
        if !self.flushed() {
            return GmState::DoneSave;
        }
        GmState::Cancel
    }

    async fn do_destroy_keypair(&mut self, b: &mut Backend) -> GmState {
        let Some(request) = self
            .keypair
            .as_deref()
            .and_then(|keypair| b.driver.destroy_keypair_request(&b.key, keypair))
        else {
            return GmState::Delete;
        };
        match b.gahp.call(request).await {
            CallResult::NotSubmitted | CallResult::Pending => GmState::DestroyKeypair,
            CallResult::Done(reply) if reply.success || is_not_found(&reply) => {
                self.keypair = None;
                GmState::Delete
            }
            CallResult::Done(reply) if reply.is_transient() => {
                self.retry_transient(b, GmState::DestroyKeypair)
            }
            CallResult::Done(reply) => {
                self.error_string = format!("Failed to destroy keypair: {}", reply_error(&reply));
                GmState::Hold
            }
        }
    }

    fn do_hold(&mut self) -> GmState {
        if self.record.status() != JobStatus::Held {
            let reason = self
                .record
                .get_str(HOLD_REASON)
                .filter(|r| !r.is_empty())
                .or_else(|| (!self.error_string.is_empty()).then(|| self.error_string.clone()))
                .unwrap_or_else(|| "Unspecified gridmanager error".to_string());
            log::info!("({}) Job put on hold: {reason}", self.id);
            self.record.job_held(&reason, HOLD_CODE_GRID_ERROR, 0);
        }
        GmState::Delete
    }

    fn do_proxy_expired(&mut self) -> GmState {
        let resume = self.resume_state.unwrap_or(GmState::Start);
        let Some(proxy) = self.current_proxy() else {
            self.resume_state = None;
            return resume;
        };
        let now = unix_time();
        let config = &self.ctx.config;
        if proxy.remaining_lifetime(now) >= config.min_proxy_lifetime.as_secs() as i64 {
            log::info!("({}) Credential refreshed, resuming {resume}", self.id);
            self.resume_state = None;
            return resume;
        }
        let hold_at = proxy.expiration + config.proxy_expire_hold_grace.as_secs() as i64;
        if now >= hold_at {
            self.error_string = "Proxy expired".to_string();
            return GmState::Hold;
        }
        let wait = Duration::from_secs((hold_at - now) as u64);
        self.retry_in(wait);
        GmState::ProxyExpired
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(backend) = &self.backend {
            backend.resource.get_mut().unregister_job(self.id);
            if let Some(proxy) = &backend.proxy {
                self.ctx.proxies.get_mut().release(self.id, &proxy.path);
            }
            if let Some(server) = &backend.staging {
                server.unregister_client(self.id);
            }
        }
    }

    fn do_delete(&mut self) -> GmState {
        if !self.released {
            self.record.done_with_job();
            self.release();
        }
        if self.flushed() {
            log::debug!("({}) Job record flushed, job is done", self.id);
            self.finished = true;
        }
        GmState::Delete
    }
}

impl Drop for RemoteJob {
    fn drop(&mut self) {
        self.release();
    }
}
