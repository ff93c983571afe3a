use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use bstr::ByteSlice;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::common::utils::unix_time;
use crate::proxy::{Proxy, ProxyManagerRef};
use crate::staging::scheduler::{
    HelperJobId, HelperJobState, HelperJobStatus, LEASE_EXPIRATION_ATTR, LocalScheduler,
};
use crate::{JobId, Map};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const LEASE_DURATION: Duration = Duration::from_secs(900);
pub const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(300);
pub const LEASE_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const SUBMIT_ATTEMPT_INTERVAL: Duration = Duration::from_secs(60);
pub const PROXY_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PORT: u16 = 2811;

const LISTENING_MARKER: &str = "Server listening at ";
const PORT_IN_USE_MARKER: &str = "Address already in use";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingState {
    Unsubmitted,
    Idle,
    Active,
    Done,
}

/// Staging server helper of one credential.
pub struct StagingServer {
    subject: String,
    proxy_path: PathBuf,
    proxies: ProxyManagerRef,
    scheduler: Rc<dyn LocalScheduler>,
    helper_path: Option<PathBuf>,

    state: StagingState,
    job: Option<HelperJobId>,
    /// URL the clients used before; the helper is asked to listen on its port.
    requested_url: Option<String>,
    url: Option<String>,
    error: Option<String>,
    clients: Map<JobId, Rc<Notify>>,

    initial_scan_done: bool,
    last_submit_attempt: Option<Instant>,
    next_lease_renewal: Option<Instant>,
    /// Expiration of the credential copy handed to the helper.
    spooled_expiration: Option<i64>,
    last_proxy_update: Option<Instant>,

    poll_now: Rc<Notify>,
    check_task: Option<JoinHandle<()>>,
}

sandbox::define_wrapped_type!(StagingServerRef, StagingServer, pub);

impl StagingServer {
    pub fn new(
        proxy: &Proxy,
        proxies: ProxyManagerRef,
        scheduler: Rc<dyn LocalScheduler>,
        helper_path: Option<PathBuf>,
    ) -> Self {
        Self {
            subject: proxy.subject.clone(),
            proxy_path: proxy.path.clone(),
            proxies,
            scheduler,
            helper_path,
            state: StagingState::Unsubmitted,
            job: None,
            requested_url: None,
            url: None,
            error: None,
            clients: Default::default(),
            initial_scan_done: false,
            last_submit_attempt: None,
            next_lease_renewal: None,
            spooled_expiration: None,
            last_proxy_update: None,
            poll_now: Rc::new(Notify::new()),
            check_task: None,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> StagingState {
        self.state
    }

    pub fn helper_job(&self) -> Option<HelperJobId> {
        self.job
    }

    /// URL of the running helper, `None` while it is not listening yet.
    pub fn url_base(&self) -> Option<String> {
        match self.state {
            StagingState::Active => self.url.clone(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_running(&self) -> bool {
        self.check_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn set_helper_path(&mut self, path: Option<PathBuf>) {
        self.helper_path = path;
    }

    fn availability(&self) -> (Option<String>, Option<String>) {
        (self.url_base(), self.error.clone())
    }

    fn notify_clients(&self) {
        for waker in self.clients.values() {
            waker.notify_one();
        }
    }

    fn requested_port(&self) -> Option<u16> {
        let url = self.requested_url.as_deref()?;
        let authority = url.split_once("://").map_or(url, |(_, rest)| rest);
        let authority = authority.split('/').next().unwrap_or(authority);
        Some(
            authority
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse().ok())
                .unwrap_or(DEFAULT_PORT),
        )
    }

    /// Forgets the helper, clients have to wait for a new one.
    fn reset_helper(&mut self) {
        self.job = None;
        self.url = None;
        self.state = StagingState::Unsubmitted;
        self.next_lease_renewal = None;
        self.spooled_expiration = None;
        self.last_proxy_update = None;
    }
}

impl StagingServerRef {
    pub fn new(server: StagingServer) -> Self {
        Self(crate::WrappedRcRefCell::wrap(server))
    }

    /// Registers a job interested in the server URL. `requested_url` is the URL the job
    /// used before, the first one asked for is kept.
    pub fn register_client(&self, job: JobId, waker: Rc<Notify>, requested_url: Option<&str>) {
        let mut server = self.get_mut();
        if server.requested_url.is_none() && server.job.is_none() {
            server.requested_url = requested_url.map(|url| url.to_string());
        }
        if server.url_base().is_some() || server.error.is_some() {
            waker.notify_one();
        }
        server.clients.insert(job, waker);
        if !server.is_running() {
            server.check_task = Some(tokio::task::spawn_local(check_process(self.clone())));
        } else {
            server.poll_now.notify_one();
        }
    }

    pub fn unregister_client(&self, job: JobId) {
        let mut server = self.get_mut();
        if server.clients.remove(&job).is_some() && server.clients.is_empty() {
            server.poll_now.notify_one();
        }
    }
}

impl Drop for StagingServer {
    fn drop(&mut self) {
        if let Some(task) = self.check_task.take() {
            task.abort();
        }
    }
}

fn listening_url(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let address = line.trim().strip_prefix(LISTENING_MARKER)?.trim();
        (!address.is_empty()).then(|| format!("gsiftp://{address}"))
    })
}

fn map_status(status: HelperJobStatus) -> StagingState {
    match status {
        HelperJobStatus::Idle => StagingState::Idle,
        HelperJobStatus::Running => StagingState::Active,
        HelperJobStatus::Removed | HelperJobStatus::Completed | HelperJobStatus::Held => {
            StagingState::Done
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Keeps the helper of a server alive while the server has clients.
async fn check_process(server: StagingServerRef) {
    let poll_now = server.get().poll_now.clone();
    loop {
        let before = server.get().availability();
        let wait = check_server(&server).await;

        let server_ref = server.get();
        if server_ref.availability() != before {
            server_ref.notify_clients();
        }
        if server_ref.clients.is_empty() && server_ref.job.is_none() {
            log::debug!("Staging server of {} is not used anymore", server_ref.subject);
            return;
        }
        drop(server_ref);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = poll_now.notified() => {}
        }
    }
}

/// One round of the check loop. Returns how long to wait before the next one.
async fn check_server(server: &StagingServerRef) -> Duration {
    let (scheduler, subject, job, unused) = {
        let s = server.get();
        (
            s.scheduler.clone(),
            s.subject.clone(),
            s.job,
            s.clients.is_empty(),
        )
    };

    if unused {
        if let Some(job) = job {
            log::info!("Removing unused staging server of {subject}");
            if let Err(error) = scheduler.remove_job(job, "Staging server is not used").await {
                log::warn!("Cannot remove staging server of {subject}: {error:?}");
            }
            server.get_mut().reset_helper();
        }
        return Duration::ZERO;
    }

    if !server.get().initial_scan_done {
        match scheduler.find_jobs(&subject).await {
            Ok(jobs) => {
                let mut s = server.get_mut();
                s.initial_scan_done = true;
                if let Some(existing) = jobs.first() {
                    log::info!("Adopting staging server job {existing} of {subject}");
                    s.job = Some(*existing);
                    s.state = StagingState::Idle;
                }
            }
            Err(error) => {
                log::warn!("Cannot look up staging servers of {subject}: {error:?}");
                return CHECK_INTERVAL;
            }
        }
    }

    let job = server.get().job;
    let Some(job) = job else {
        return submit_helper(server).await;
    };

    let state = match scheduler.job_status(job).await {
        Ok(Some(state)) => state,
        Ok(None) => {
            log::warn!("Staging server job {job} of {subject} disappeared");
            server.get_mut().reset_helper();
            return Duration::ZERO;
        }
        Err(error) => {
            log::warn!("Cannot query staging server job {job}: {error:?}");
            return POLL_INTERVAL;
        }
    };
    if let Some(wait) = update_state(server, job, &state).await {
        return wait;
    }

    let lease_wait = renew_lease(server, job).await;
    update_proxy(server, job).await;
    POLL_INTERVAL.min(CHECK_INTERVAL).min(lease_wait)
}

/// Applies a helper status. Returns a wait time when the helper is gone.
async fn update_state(
    server: &StagingServerRef,
    job: HelperJobId,
    state: &HelperJobState,
) -> Option<Duration> {
    let new_state = map_status(state.status);
    let (scheduler, subject, port_in_use) = {
        let mut s = server.get_mut();
        if s.state != new_state {
            log::debug!(
                "Staging server {job} of {}: {:?} -> {new_state:?}",
                s.subject,
                s.state
            );
            s.state = new_state;
        }
        if new_state == StagingState::Active && s.url.is_none() {
            s.url = listening_url(&state.stdout);
            if let Some(url) = &s.url {
                log::info!("Staging server of {} listens at {url}", s.subject);
            }
        }
        if new_state != StagingState::Done {
            return None;
        }
        let port_in_use = s.requested_url.is_some()
            && state.stderr.as_bytes().contains_str(PORT_IN_USE_MARKER);
        (s.scheduler.clone(), s.subject.clone(), port_in_use)
    };

    if let Err(error) = scheduler.remove_job(job, "Staging server exited").await {
        log::warn!("Cannot remove staging server job {job}: {error:?}");
    }
    let mut s = server.get_mut();
    s.reset_helper();
    if port_in_use {
        log::info!("Requested staging port of {subject} is in use, picking a new one");
        s.requested_url = None;
        s.last_submit_attempt = None;
        return Some(Duration::ZERO);
    }
    if state.status == HelperJobStatus::Held {
        s.error = Some(format!(
            "Staging server job was held: {}",
            last_line(&state.stderr)
        ));
        return Some(CHECK_INTERVAL);
    }
    log::warn!(
        "Staging server of {subject} exited: {}",
        last_line(&state.stderr)
    );
    Some(Duration::ZERO)
}

async fn submit_helper(server: &StagingServerRef) -> Duration {
    let (scheduler, description, proxy_path) = {
        let mut s = server.get_mut();
        if s.error.is_some() {
            return CHECK_INTERVAL;
        }
        if let Some(last) = s.last_submit_attempt {
            let next = last + SUBMIT_ATTEMPT_INTERVAL;
            if Instant::now() < next {
                return next - Instant::now();
            }
        }
        let Some(helper) = s.helper_path.clone() else {
            s.error = Some("No staging server program is configured".to_string());
            return CHECK_INTERVAL;
        };
        s.last_submit_attempt = Some(Instant::now());

        let mut args = vec![];
        if let Some(port) = s.requested_port() {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        let mut description = s.scheduler.create_job(&s.subject, &helper, args);
        description.attributes.insert(
            LEASE_EXPIRATION_ATTR.to_string(),
            (unix_time() + LEASE_DURATION.as_secs() as i64).to_string(),
        );
        (s.scheduler.clone(), description, s.proxy_path.clone())
    };

    let subject = description.owner.clone();
    let job = match scheduler.submit(description).await {
        Ok(job) => job,
        Err(error) => {
            log::error!("Cannot submit staging server of {subject}: {error:?}");
            server.get_mut().error = Some(format!("Failed to submit staging server: {error}"));
            return CHECK_INTERVAL;
        }
    };
    log::info!("Submitted staging server job {job} for {subject}");
    {
        let mut s = server.get_mut();
        s.job = Some(job);
        s.state = StagingState::Idle;
        s.next_lease_renewal = Some(Instant::now() + LEASE_RENEW_INTERVAL);
    }
    if let Err(error) = scheduler.spool_input_files(job, vec![proxy_path]).await {
        log::warn!("Cannot spool credential of {subject}: {error:?}");
    }
    let expiration = {
        let s = server.get();
        s.proxies.get().get(&s.proxy_path).map(|p| p.expiration)
    };
    server.get_mut().spooled_expiration = expiration;
    // Startup is usually quick
    Duration::ZERO
}

async fn renew_lease(server: &StagingServerRef, job: HelperJobId) -> Duration {
    let (scheduler, due) = {
        let s = server.get();
        (s.scheduler.clone(), s.next_lease_renewal)
    };
    let now = Instant::now();
    if let Some(due) = due {
        if now < due {
            return due - now;
        }
    }
    let expiration = unix_time() + LEASE_DURATION.as_secs() as i64;
    let result = scheduler
        .set_attribute(job, LEASE_EXPIRATION_ATTR, expiration.to_string())
        .await;
    let wait = match result {
        Ok(()) => LEASE_RENEW_INTERVAL,
        Err(error) => {
            log::warn!("Cannot renew lease of staging server job {job}: {error:?}");
            LEASE_RETRY_INTERVAL
        }
    };
    server.get_mut().next_lease_renewal = Some(now + wait);
    wait
}

/// Hands a refreshed credential to the helper.
async fn update_proxy(server: &StagingServerRef, job: HelperJobId) {
    let (scheduler, path, expiration) = {
        let s = server.get();
        let Some(expiration) = s.proxies.get().get(&s.proxy_path).map(|p| p.expiration) else {
            return;
        };
        if s.spooled_expiration.is_some_and(|spooled| spooled >= expiration) {
            return;
        }
        if s
            .last_proxy_update
            .is_some_and(|last| Instant::now() < last + PROXY_UPDATE_INTERVAL)
        {
            return;
        }
        (s.scheduler.clone(), s.proxy_path.clone(), expiration)
    };
    server.get_mut().last_proxy_update = Some(Instant::now());
    match scheduler.spool_input_files(job, vec![path]).await {
        Ok(()) => {
            log::debug!("Updated credential of staging server job {job}");
            server.get_mut().spooled_expiration = Some(expiration);
        }
        Err(error) => log::warn!("Cannot update credential of staging server job {job}: {error:?}"),
    }
}
