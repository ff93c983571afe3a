use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::JobId;
use crate::queue::{JobAttributes, JobQueue, QueueStore};

#[derive(Serialize, Deserialize)]
struct StoredJob {
    id: JobId,
    attrs: JobAttributes,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredQueue {
    jobs: Vec<StoredJob>,
}

/// Queue persisted as a JSON file. Every flush rewrites the whole file atomically.
pub struct FileJobQueue {
    path: PathBuf,
    store: QueueStore,
}

impl FileJobQueue {
    /// Opens the queue file, a missing file is an empty queue.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let mut queue = Self {
            path: path.to_path_buf(),
            store: QueueStore::default(),
        };
        if path.exists() {
            let data = std::fs::read(path)
                .with_context(|| format!("Cannot read job queue {}", path.display()))?;
            let stored: StoredQueue = serde_json::from_slice(&data).map_err(|e| {
                crate::Error::QueueError(format!("Corrupted job queue {}: {e}", path.display()))
            })?;
            log::debug!(
                "Loaded {} job(s) from {}",
                stored.jobs.len(),
                path.display()
            );
            for job in stored.jobs {
                queue.add_job(job.id, job.attrs);
            }
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobQueue for FileJobQueue {
    fn store(&self) -> &QueueStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut QueueStore {
        &mut self.store
    }

    fn persist(&mut self, jobs: &[JobId]) -> crate::Result<()> {
        let stored = StoredQueue {
            jobs: self
                .store
                .jobs
                .iter()
                .map(|(id, entry)| StoredJob {
                    id: *id,
                    attrs: entry.attrs.clone(),
                })
                .collect(),
        };
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&directory)?;
        serde_json::to_writer_pretty(&mut file, &stored)?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        log::trace!(
            "Job queue {} written ({} dirty job(s))",
            self.path.display(),
            jobs.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FileJobQueue;
    use crate::JobId;
    use crate::queue::{AttrValue, JobQueue};
    use tempfile::TempDir;

    #[test]
    fn test_reopen_keeps_flushed_attributes() {
        let dir = TempDir::with_prefix("gm").unwrap();
        let path = dir.path().join("queue.json");
        let job = JobId::new(12, 3);

        let mut queue = FileJobQueue::open(&path).unwrap();
        assert!(queue.jobs().is_empty());
        queue.assign(job, "GridJobId", "gce https://x name".into());
        queue.assign(job, "JobStatus", 2i64.into());
        queue.flush().unwrap();
        queue.assign(job, "HoldReason", "not flushed".into());

        let queue = FileJobQueue::open(&path).unwrap();
        assert_eq!(queue.jobs(), vec![job]);
        assert_eq!(
            queue.lookup(job, "GridJobId"),
            Some(AttrValue::String("gce https://x name".to_string()))
        );
        assert_eq!(queue.lookup(job, "JobStatus"), Some(AttrValue::Int(2)));
        assert_eq!(queue.lookup(job, "HoldReason"), None);
    }

    #[test]
    fn test_corrupted_file() {
        let dir = TempDir::with_prefix("gm").unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{ jobs").unwrap();
        assert!(FileJobQueue::open(&path).is_err());
    }
}
