use std::path::{Path, PathBuf};
use std::rc::Rc;

use tokio::sync::Notify;

use crate::{JobId, Map};

/// Delegated credential of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub path: PathBuf,
    pub subject: String,
    /// Unix time
    pub expiration: i64,
}

impl Proxy {
    pub fn remaining_lifetime(&self, now: i64) -> i64 {
        self.expiration - now
    }
}

struct ProxyEntry {
    proxy: Proxy,
    users: Map<JobId, Rc<Notify>>,
}

/// Credentials shared by jobs, keyed by the credential file.
#[derive(Default)]
pub struct ProxyManager {
    proxies: Map<PathBuf, ProxyEntry>,
}

sandbox::define_wrapped_type!(ProxyManagerRef, ProxyManager, pub);

impl Default for ProxyManagerRef {
    fn default() -> Self {
        Self(crate::WrappedRcRefCell::wrap(ProxyManager::default()))
    }
}

impl ProxyManager {
    /// Registers `job` as a user of the credential. When the credential is already known,
    /// the later expiration wins.
    pub fn acquire(&mut self, job: JobId, proxy: Proxy, waker: Rc<Notify>) -> Proxy {
        let entry = self
            .proxies
            .entry(proxy.path.clone())
            .or_insert_with(|| ProxyEntry {
                proxy: proxy.clone(),
                users: Default::default(),
            });
        if proxy.expiration > entry.proxy.expiration {
            entry.proxy = proxy;
        }
        entry.users.insert(job, waker);
        entry.proxy.clone()
    }

    pub fn release(&mut self, job: JobId, path: &Path) {
        if let Some(entry) = self.proxies.get_mut(path) {
            entry.users.remove(&job);
            if entry.users.is_empty() {
                log::debug!("Forgetting credential {}", path.display());
                self.proxies.remove(path);
            }
        }
    }

    pub fn get(&self, path: &Path) -> Option<&Proxy> {
        self.proxies.get(path).map(|entry| &entry.proxy)
    }

    /// Records a refreshed credential and wakes its users. Returns false when the
    /// expiration is not newer than the known one.
    pub fn update_expiration(&mut self, path: &Path, expiration: i64) -> bool {
        let Some(entry) = self.proxies.get_mut(path) else {
            return false;
        };
        if expiration <= entry.proxy.expiration {
            return false;
        }
        log::info!(
            "Credential {} refreshed, expires at {expiration}",
            path.display()
        );
        entry.proxy.expiration = expiration;
        for waker in entry.users.values() {
            waker.notify_one();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Proxy, ProxyManager};
    use crate::JobId;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;
    use tokio::sync::Notify;

    fn proxy(expiration: i64) -> Proxy {
        Proxy {
            path: PathBuf::from("/tmp/x509up_u1000"),
            subject: "/CN=alice".to_string(),
            expiration,
        }
    }

    #[tokio::test]
    async fn test_refresh_wakes_users() {
        let mut manager = ProxyManager::default();
        let waker = Rc::new(Notify::new());
        let path = Path::new("/tmp/x509up_u1000");

        assert_eq!(manager.acquire(JobId::new(1, 0), proxy(100), waker.clone()).expiration, 100);
        assert_eq!(
            manager
                .acquire(JobId::new(2, 0), proxy(50), Rc::new(Notify::new()))
                .expiration,
            100
        );
        assert!(!manager.update_expiration(path, 90));
        assert!(manager.update_expiration(path, 500));
        waker.notified().await;
        assert_eq!(manager.get(path).unwrap().expiration, 500);

        manager.release(JobId::new(1, 0), path);
        assert_eq!(manager.len(), 1);
        manager.release(JobId::new(2, 0), path);
        assert!(manager.is_empty());
    }
}
