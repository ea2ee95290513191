//! In-flight reconcile registry
//!
//! Serializes passes for the same record and remembers the newest generation
//! seen for each record so an older pass can tell it has been superseded.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Registry key of a record
pub fn record_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Keyed mutual exclusion plus latest observed generation per record.
#[derive(Debug, Default)]
pub struct ReconcileRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
    generations: DashMap<String, i64>,
}

/// Held for the duration of one pass; releasing it lets the next pass for the
/// same record start.
pub struct ReconcileGuard<'a> {
    registry: &'a ReconcileRegistry,
    key: String,
    lock: Option<OwnedMutexGuard<()>>,
}

impl ReconcileGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ReconcileGuard<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        // Only the map still references the lock when nobody holds or waits for it
        self.registry
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ReconcileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other pass holds `key`, then hold it.
    pub async fn acquire(&self, key: &str) -> ReconcileGuard<'_> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        trace!(key, "Acquired reconcile lock");
        ReconcileGuard {
            registry: self,
            key: key.to_string(),
            lock: Some(guard),
        }
    }

    /// Record that `generation` of `key` has been seen; older values are ignored.
    pub fn observe(&self, key: &str, generation: i64) {
        self.generations
            .entry(key.to_string())
            .and_modify(|latest| *latest = (*latest).max(generation))
            .or_insert(generation);
    }

    pub fn latest_generation(&self, key: &str) -> Option<i64> {
        self.generations.get(key).map(|latest| *latest)
    }

    /// Whether a newer generation than `generation` has been observed
    pub fn is_superseded(&self, key: &str, generation: i64) -> bool {
        self.latest_generation(key)
            .is_some_and(|latest| latest > generation)
    }

    /// Drop everything known about a deleted record
    pub fn forget(&self, key: &str) {
        self.generations.remove(key);
    }

    /// Number of records with a pass running or waiting
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_record_key() {
        assert_eq!(record_key("kafka", "alice"), "kafka/alice");
    }

    #[test]
    fn test_generation_tracking() {
        let registry = ReconcileRegistry::new();
        assert!(!registry.is_superseded("ns/a", 1));

        registry.observe("ns/a", 2);
        registry.observe("ns/a", 1);
        assert_eq!(registry.latest_generation("ns/a"), Some(2));
        assert!(registry.is_superseded("ns/a", 1));
        assert!(!registry.is_superseded("ns/a", 2));

        registry.forget("ns/a");
        assert_eq!(registry.latest_generation("ns/a"), None);
    }

    #[tokio::test]
    async fn test_lock_entry_removed_after_release() {
        let registry = ReconcileRegistry::new();
        {
            let guard = registry.acquire("ns/a").await;
            assert_eq!(guard.key(), "ns/a");
            assert_eq!(registry.in_flight(), 1);
        }
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_passes_are_serialized() {
        let registry = Arc::new(ReconcileRegistry::new());
        let inside = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let inside = inside.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("ns/alice").await;
                assert!(!inside.swap(true, Ordering::SeqCst), "overlapping passes");
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.store(false, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let registry = ReconcileRegistry::new();
        let _alice = registry.acquire("ns/alice").await;
        let bob = tokio::time::timeout(Duration::from_secs(1), registry.acquire("ns/bob")).await;
        assert!(bob.is_ok());
        assert_eq!(registry.in_flight(), 2);
    }
}
