//! Named cache registry collected during generation.

use std::collections::BTreeMap;

use crate::plan::{Cache, CacheType};

/// Cache directory used by the apt steps.
pub const APT_CACHE_DIR: &str = "/var/cache/apt";

/// Apt package list directory, cached separately.
pub const APT_LISTS_DIR: &str = "/var/lib/apt/lists";

/// Collects cache definitions; steps reference them by key.
#[derive(Debug, Clone, Default)]
pub struct CacheContext {
    caches: BTreeMap<String, Cache>,
}

impl CacheContext {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared cache and return its key.
    pub fn add_cache(&mut self, name: impl Into<String>, directory: impl Into<String>) -> String {
        self.add_cache_with_type(name, directory, CacheType::Shared)
    }

    /// Register a cache with an explicit sharing mode and return its key.
    pub fn add_cache_with_type(
        &mut self,
        name: impl Into<String>,
        directory: impl Into<String>,
        cache_type: CacheType,
    ) -> String {
        let name = name.into();
        self.caches.entry(name.clone()).or_insert_with(|| Cache {
            directory: directory.into(),
            cache_type,
        });
        name
    }

    /// Keys of the shared apt caches, registering them on first use. Apt
    /// cannot tolerate concurrent writers, so both mounts are locked.
    pub fn apt_caches(&mut self) -> Vec<String> {
        vec![
            self.add_cache_with_type("apt", APT_CACHE_DIR, CacheType::Locked),
            self.add_cache_with_type("apt-lists", APT_LISTS_DIR, CacheType::Locked),
        ]
    }

    /// Look up a cache by key.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Consume the registry into the plan's cache map.
    #[must_use]
    pub fn into_caches(self) -> BTreeMap<String, Cache> {
        self.caches
    }

    /// Merge a user-configured cache over the registry.
    pub fn set_cache(&mut self, name: impl Into<String>, cache: Cache) {
        self.caches.insert(name.into(), cache);
    }
}
