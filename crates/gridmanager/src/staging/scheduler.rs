use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::common::utils::unix_time;
use crate::{Map, WrappedRcRefCell};

sandbox::define_id_type!(HelperJobId, u64);

pub type SchedulerFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>>>>;

/// Attribute carrying the unix time after which an abandoned helper job may be removed.
pub const LEASE_EXPIRATION_ATTR: &str = "JobLeaseExpiration";

const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Local disposition of a helper job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperJobStatus {
    Idle,
    Running,
    Removed,
    Completed,
    Held,
}

#[derive(Debug, Clone)]
pub struct HelperJobDescription {
    pub owner: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub attributes: Map<String, String>,
}

/// Snapshot of a helper job, including the output it produced so far.
#[derive(Debug, Clone)]
pub struct HelperJobState {
    pub status: HelperJobStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Local scheduler that runs staging server helpers.
pub trait LocalScheduler {
    /// Prepares the description of a helper job, nothing is started yet.
    fn create_job(&self, owner: &str, command: &Path, args: Vec<String>) -> HelperJobDescription {
        HelperJobDescription {
            owner: owner.to_string(),
            command: command.to_path_buf(),
            args,
            attributes: Default::default(),
        }
    }

    fn submit(&self, job: HelperJobDescription) -> SchedulerFuture<HelperJobId>;

    /// Copies files into the working directory of the job, replacing older copies.
    fn spool_input_files(&self, job: HelperJobId, files: Vec<PathBuf>) -> SchedulerFuture<()>;

    fn remove_job(&self, job: HelperJobId, reason: &str) -> SchedulerFuture<()>;

    /// Returns `None` when the scheduler does not know the job (anymore).
    fn job_status(&self, job: HelperJobId) -> SchedulerFuture<Option<HelperJobState>>;

    fn set_attribute(&self, job: HelperJobId, name: &str, value: String) -> SchedulerFuture<()>;

    /// Helper jobs started for `owner` that were not removed yet.
    fn find_jobs(&self, owner: &str) -> SchedulerFuture<Vec<HelperJobId>>;
}

struct ProcessEntry {
    description: HelperJobDescription,
    directory: PathBuf,
    child: Option<Child>,
    status: HelperJobStatus,
}

#[derive(Default)]
struct ProcessSchedulerState {
    jobs: Map<HelperJobId, ProcessEntry>,
    job_counter: u64,
}

/// Runs helper jobs as child processes of the grid manager.
///
/// Every job gets a directory under `<work_dir>/staging/<id>` that holds its output and
/// spooled files. A job whose lease expired is killed on the next status query.
#[derive(Clone)]
pub struct ProcessScheduler {
    work_dir: PathBuf,
    state: WrappedRcRefCell<ProcessSchedulerState>,
}

impl ProcessScheduler {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            state: WrappedRcRefCell::wrap(Default::default()),
        }
    }

    fn job_directory(&self, id: HelperJobId) -> PathBuf {
        self.work_dir.join("staging").join(format!("{id:03}"))
    }

    fn poll_job(&self, job: HelperJobId) -> anyhow::Result<Option<HelperJobState>> {
        let mut state = self.state.get_mut();
        let Some(entry) = state.jobs.get_mut(&job) else {
            return Ok(None);
        };
        if entry.status == HelperJobStatus::Running && lease_expired(&entry.description) {
            log::warn!("Lease of helper job {job} expired, stopping it");
            if let Some(child) = &mut entry.child {
                child.start_kill()?;
            }
            entry.status = HelperJobStatus::Removed;
        }
        if let Some(child) = &mut entry.child {
            if let Some(exit) = child.try_wait()? {
                log::debug!("Helper job {job} finished with {exit}");
                entry.child = None;
                if entry.status == HelperJobStatus::Running {
                    entry.status = HelperJobStatus::Completed;
                }
            }
        }
        Ok(Some(HelperJobState {
            status: entry.status,
            stdout: read_output(&entry.directory.join(STDOUT_FILE)),
            stderr: read_output(&entry.directory.join(STDERR_FILE)),
        }))
    }
}

fn read_output(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(data) => data.to_str_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

/// Replaces the copy of `source` in `dest_dir` in one step.
fn copy_atomically(source: &Path, dest_dir: &Path) -> anyhow::Result<()> {
    let name = source
        .file_name()
        .with_context(|| format!("Invalid spooled file {}", source.display()))?;
    let data = std::fs::read(source)
        .with_context(|| format!("Cannot read spooled file {}", source.display()))?;
    let mut file = tempfile::NamedTempFile::new_in(dest_dir)?;
    std::io::Write::write_all(&mut file, &data)?;
    file.persist(dest_dir.join(name))?;
    Ok(())
}

/// Asks the helper to terminate, it is killed when it does not exit in time.
async fn stop_child(job: HelperJobId, mut child: Child) -> anyhow::Result<()> {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        if let Err(error) = signal::kill(pid, Signal::SIGTERM) {
            log::debug!("Cannot send SIGTERM to helper job {job}: {error:?}");
        }
        if tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_ok() {
            return Ok(());
        }
        log::debug!("Helper job {job} did not stop after SIGTERM, killing it");
    }
    child.kill().await?;
    Ok(())
}

fn lease_expired(description: &HelperJobDescription) -> bool {
    description
        .attributes
        .get(LEASE_EXPIRATION_ATTR)
        .and_then(|value| value.parse::<i64>().ok())
        .is_some_and(|expiration| expiration < unix_time())
}

impl LocalScheduler for ProcessScheduler {
    fn submit(&self, job: HelperJobDescription) -> SchedulerFuture<HelperJobId> {
        let scheduler = self.clone();
        Box::pin(async move {
            let id = {
                let mut state = scheduler.state.get_mut();
                state.job_counter += 1;
                HelperJobId::new(state.job_counter)
            };
            let directory = scheduler.job_directory(id);
            std::fs::create_dir_all(&directory)
                .with_context(|| format!("Cannot create {}", directory.display()))?;
            let stdout = std::fs::File::create(directory.join(STDOUT_FILE))?;
            let stderr = std::fs::File::create(directory.join(STDERR_FILE))?;

            log::debug!(
                "Starting helper job {id}: {} {}",
                job.command.display(),
                job.args.join(" ")
            );
            let child = Command::new(&job.command)
                .args(&job.args)
                .current_dir(&directory)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("Cannot start {}", job.command.display()))?;

            scheduler.state.get_mut().jobs.insert(
                id,
                ProcessEntry {
                    description: job,
                    directory,
                    child: Some(child),
                    status: HelperJobStatus::Running,
                },
            );
            Ok(id)
        })
    }

    fn spool_input_files(&self, job: HelperJobId, files: Vec<PathBuf>) -> SchedulerFuture<()> {
        let directory = self
            .state
            .get()
            .jobs
            .get(&job)
            .map(|entry| entry.directory.clone());
        Box::pin(async move {
            let directory = directory.with_context(|| format!("Unknown helper job {job}"))?;
            for file in files {
                copy_atomically(&file, &directory)?;
            }
            Ok(())
        })
    }

    fn remove_job(&self, job: HelperJobId, reason: &str) -> SchedulerFuture<()> {
        let child = self.state.get_mut().jobs.remove(&job).and_then(|mut entry| {
            log::debug!("Removing helper job {job}: {reason}");
            entry.child.take()
        });
        Box::pin(async move {
            if let Some(child) = child {
                stop_child(job, child).await?;
            }
            Ok(())
        })
    }

    fn job_status(&self, job: HelperJobId) -> SchedulerFuture<Option<HelperJobState>> {
        let result = self.poll_job(job);
        Box::pin(async move { result })
    }

    fn set_attribute(&self, job: HelperJobId, name: &str, value: String) -> SchedulerFuture<()> {
        let result = match self.state.get_mut().jobs.get_mut(&job) {
            Some(entry) => {
                entry.description.attributes.insert(name.to_string(), value);
                Ok(())
            }
            None => Err(anyhow::anyhow!("Unknown helper job {job}")),
        };
        Box::pin(async move { result })
    }

    fn find_jobs(&self, owner: &str) -> SchedulerFuture<Vec<HelperJobId>> {
        let mut jobs: Vec<HelperJobId> = self
            .state
            .get()
            .jobs
            .iter()
            .filter(|(_, entry)| {
                entry.description.owner == owner && entry.status != HelperJobStatus::Removed
            })
            .map(|(id, _)| *id)
            .collect();
        jobs.sort();
        Box::pin(async move { Ok(jobs) })
    }
}
