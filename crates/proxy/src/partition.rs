use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::engine::EngineError;
use crate::locks::KeyedLocks;
use pmos_contracts::partition::partition_tag;

/// Engine tag operations the partition manager needs. Implemented by
/// `EngineClient`; tests substitute an in-memory backend.
pub trait TagBackend {
    async fn lookup_tag(&self, name: &str) -> Result<bool, EngineError>;
    async fn register_tag(&self, name: &str) -> Result<(), EngineError>;
}

/// Ensures each workspace's partition tag exists on the engine exactly
/// once. Concurrent callers for the same workspace serialize on a
/// per-workspace lock; distinct workspaces never contend.
#[derive(Clone)]
pub struct PartitionTags<B> {
    backend: B,
    ensured: Arc<RwLock<HashSet<String>>>,
    locks: KeyedLocks,
}

impl<B: TagBackend> PartitionTags<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            ensured: Arc::new(RwLock::new(HashSet::new())),
            locks: KeyedLocks::new(),
        }
    }

    /// Returns the workspace's partition tag name, creating the engine
    /// tag on first use. A concurrent-create conflict from the engine
    /// means another writer won, which is success for our purposes.
    pub async fn ensure_tag(&self, workspace_id: &str) -> Result<String, EngineError> {
        let tag = partition_tag(workspace_id);

        if self.ensured.read().await.contains(&tag) {
            return Ok(tag);
        }

        let lock = self.locks.lock_for(workspace_id);
        let _guard = lock.lock().await;

        // Another task may have finished while we waited on the lock.
        if self.ensured.read().await.contains(&tag) {
            return Ok(tag);
        }

        if !self.backend.lookup_tag(&tag).await? {
            match self.backend.register_tag(&tag).await {
                Ok(()) => crate::metrics::inc_partition_tag_created(),
                Err(EngineError::Conflict) => {}
                Err(err) => return Err(err),
            }
        }

        self.ensured.write().await.insert(tag.clone());
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct FakeBackend {
        tags: Arc<Mutex<HashSet<String>>>,
        lookups: Arc<AtomicUsize>,
        registers: Arc<AtomicUsize>,
        conflict_on_register: bool,
    }

    impl TagBackend for FakeBackend {
        async fn lookup_tag(&self, name: &str) -> Result<bool, EngineError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.tags.lock().unwrap().contains(name))
        }

        async fn register_tag(&self, name: &str) -> Result<(), EngineError> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            if self.conflict_on_register {
                return Err(EngineError::Conflict);
            }
            self.tags.lock().unwrap().insert(name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_use_creates_the_tag() {
        let backend = FakeBackend::default();
        let tags = PartitionTags::new(backend.clone());

        let tag = tags.ensure_tag("A1").await.unwrap();
        assert_eq!(tag, partition_tag("A1"));
        assert!(backend.tags.lock().unwrap().contains(&tag));
        assert_eq!(backend.registers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeat_calls_hit_the_cache() {
        let backend = FakeBackend::default();
        let tags = PartitionTags::new(backend.clone());

        tags.ensure_tag("A1").await.unwrap();
        tags.ensure_tag("A1").await.unwrap();
        tags.ensure_tag("A1").await.unwrap();

        assert_eq!(backend.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(backend.registers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_tag_is_not_recreated() {
        let backend = FakeBackend::default();
        backend
            .tags
            .lock()
            .unwrap()
            .insert(partition_tag("A1"));
        let tags = PartitionTags::new(backend.clone());

        tags.ensure_tag("A1").await.unwrap();
        assert_eq!(backend.registers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn register_conflict_counts_as_success() {
        let backend = FakeBackend {
            conflict_on_register: true,
            ..FakeBackend::default()
        };
        let tags = PartitionTags::new(backend.clone());

        let tag = tags.ensure_tag("A1").await.unwrap();
        assert_eq!(tag, partition_tag("A1"));
    }

    #[tokio::test]
    async fn concurrent_callers_converge_on_one_create() {
        let backend = FakeBackend::default();
        let tags = PartitionTags::new(backend.clone());

        let (a, b, c) = tokio::join!(
            tags.ensure_tag("A1"),
            tags.ensure_tag("A1"),
            tags.ensure_tag("A1"),
        );
        assert_eq!(a.unwrap(), partition_tag("A1"));
        assert_eq!(b.unwrap(), partition_tag("A1"));
        assert_eq!(c.unwrap(), partition_tag("A1"));

        assert_eq!(backend.registers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_workspaces_get_distinct_tags() {
        let backend = FakeBackend::default();
        let tags = PartitionTags::new(backend.clone());

        let a = tags.ensure_tag("A1").await.unwrap();
        let b = tags.ensure_tag("B1").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.registers.load(Ordering::SeqCst), 2);
    }
}
