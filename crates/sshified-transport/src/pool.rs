//! SSH client pool
//!
//! Concurrency-safe map of destination host to tracked session. Hosts
//! are keyed without a port: the SSH port is global configuration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sshified_metrics::Metrics;

use crate::session::TrackedSession;

pub struct SshClientPool {
    entries: RwLock<HashMap<String, Arc<TrackedSession>>>,
    metrics: Arc<Metrics>,
}

impl SshClientPool {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Read-locked lookup; no mutation.
    pub fn get(&self, host: &str) -> Option<Arc<TrackedSession>> {
        tracing::trace!("acquiring cache lock");
        let entries = self.entries.read().expect("pool lock poisoned");
        entries.get(host).cloned()
    }

    /// Write-locked removal. The gauge is decremented exactly when an
    /// entry was present.
    pub fn remove(&self, host: &str) -> Option<Arc<TrackedSession>> {
        let mut entries = self.entries.write().expect("pool lock poisoned");
        let removed = entries.remove(host);
        if removed.is_some() {
            self.metrics.dec_pool_entries();
        }
        removed
    }

    /// Insert `candidate` unless an entry already exists.
    ///
    /// Returns the cached winner when one exists; the candidate is then
    /// NOT inserted and the caller must close it. Returns `None` when the
    /// candidate was inserted. This is the only mechanism preventing two
    /// racing first-use connects from leaking a duplicate session.
    pub fn set_or_get_cached(
        &self,
        host: &str,
        candidate: Arc<TrackedSession>,
    ) -> Option<Arc<TrackedSession>> {
        let mut entries = self.entries.write().expect("pool lock poisoned");
        if let Some(cached) = entries.get(host) {
            return Some(Arc::clone(cached));
        }
        entries.insert(host.to_string(), candidate);
        self.metrics.inc_pool_entries();
        None
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
