//! Best-effort in-memory record of node pools created per cluster.
//!
//! Lost on restart. Deletion re-derives ground truth from describe calls and only uses
//! this as one source of candidate names.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct InFlightStore {
    pools: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl InFlightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: &str, pool: &str) {
        if let Ok(mut pools) = self.pools.lock() {
            pools
                .entry(cluster.to_string())
                .or_default()
                .insert(pool.to_string());
        }
    }

    pub fn remove(&self, cluster: &str, pool: &str) {
        if let Ok(mut pools) = self.pools.lock()
            && let Some(set) = pools.get_mut(cluster)
        {
            set.remove(pool);
            if set.is_empty() {
                pools.remove(cluster);
            }
        }
    }

    /// Pool names registered for `cluster`. Empty after a restart.
    pub fn get(&self, cluster: &str) -> BTreeSet<String> {
        self.pools
            .lock()
            .ok()
            .and_then(|pools| pools.get(cluster).cloned())
            .unwrap_or_default()
    }

    /// Forget everything recorded for `cluster`.
    pub fn forget(&self, cluster: &str) {
        if let Ok(mut pools) = self.pools.lock() {
            pools.remove(cluster);
        }
    }
}
