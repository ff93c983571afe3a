use crate::JobId;
use crate::queue::{JobQueue, QueueStore};

/// Queue kept only in memory; used when no queue file is configured.
#[derive(Default)]
pub struct MemoryJobQueue {
    store: QueueStore,
    flushes: usize,
    fail_flushes: bool,
}

impl MemoryJobQueue {
    /// Makes every following flush fail, simulating an unreachable store.
    pub fn set_fail_flushes(&mut self, fail: bool) {
        self.fail_flushes = fail;
    }

    /// Number of successful flushes.
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

impl JobQueue for MemoryJobQueue {
    fn store(&self) -> &QueueStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut QueueStore {
        &mut self.store
    }

    fn persist(&mut self, jobs: &[JobId]) -> crate::Result<()> {
        if self.fail_flushes {
            return Err(crate::Error::QueueError(
                "Job queue is not available".to_string(),
            ));
        }
        log::trace!("Flushed {} job(s)", jobs.len());
        self.flushes += 1;
        Ok(())
    }
}
