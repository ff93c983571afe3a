use crate::Map;
use crate::common::config::GridManagerConfig;
use crate::gahp::GahpServerRef;
use crate::resource::{ResourceKey, ResourceRef};

/// Every resource known to the grid manager, one per key.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Map<ResourceKey, ResourceRef>,
}

impl ResourceRegistry {
    pub fn find_or_create(
        &mut self,
        key: &ResourceKey,
        server: &GahpServerRef,
        config: &GridManagerConfig,
    ) -> ResourceRef {
        if let Some(resource) = self.resources.get(key) {
            return resource.clone();
        }
        log::debug!("Creating resource {key}");
        let resource = ResourceRef::new(key.clone(), server.clone(), config);
        self.resources.insert(key.clone(), resource.clone());
        resource
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceRef> {
        self.resources.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn reconfig(&self, config: &GridManagerConfig) {
        for resource in self.resources.values() {
            resource.get_mut().reconfig(config);
        }
    }

    /// Drops resources without registered jobs. Returns how many were removed.
    pub fn remove_unused(&mut self) -> usize {
        let before = self.resources.len();
        self.resources.retain(|key, resource| {
            let used = resource.get().job_count() > 0;
            if !used {
                log::debug!("Removing unused resource {key}");
            }
            used
        });
        before - self.resources.len()
    }
}
