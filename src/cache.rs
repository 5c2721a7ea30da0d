//! Process-local engine cache.
//!
//! Holds everything the engine memoises within one test process: computed
//! fingerprints, databases already resolved for a scenario, and which
//! connections have been swept for stale databases and snapshots. The cache
//! is an explicit object owned by the caller; [`EngineCache::reset`] returns
//! it to a pristine state.

use std::collections::{HashMap, HashSet};

use crate::build::ResolvedDatabase;

#[derive(Debug, Default)]
pub struct EngineCache {
    source_hashes: HashMap<String, String>,
    scenario_hashes: HashMap<String, String>,
    resolved: HashMap<String, ResolvedDatabase>,
    purged: HashSet<String>,
}

impl EngineCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.source_hashes.clear();
        self.scenario_hashes.clear();
        self.resolved.clear();
        self.purged.clear();
        log::debug!("Engine cache reset");
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source_hashes.is_empty()
            && self.scenario_hashes.is_empty()
            && self.resolved.is_empty()
            && self.purged.is_empty()
    }

    #[must_use]
    pub fn source_hash(&self, key: &str) -> Option<&str> {
        self.source_hashes.get(key).map(String::as_str)
    }

    pub fn remember_source_hash(&mut self, key: String, hash: String) {
        self.source_hashes.insert(key, hash);
    }

    #[must_use]
    pub fn scenario_hash(&self, key: &str) -> Option<&str> {
        self.scenario_hashes.get(key).map(String::as_str)
    }

    pub fn remember_scenario_hash(&mut self, key: String, hash: String) {
        self.scenario_hashes.insert(key, hash);
    }

    /// A database already built or reused for `key` in this process.
    #[must_use]
    pub fn resolved(&self, key: &str) -> Option<&ResolvedDatabase> {
        self.resolved.get(key)
    }

    pub fn remember_resolved(&mut self, key: String, database: ResolvedDatabase) {
        self.resolved.insert(key, database);
    }

    /// Record that `connection` has been swept. Returns `false` when it
    /// already was.
    pub fn mark_purged(&mut self, connection: &str) -> bool {
        self.purged.insert(connection.to_string())
    }

    #[must_use]
    pub fn is_purged(&self, connection: &str) -> bool {
        self.purged.contains(connection)
    }
}
