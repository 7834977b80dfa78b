use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Workspace-keyed async mutexes. Serializes first-use work (tag
/// creation, identity provisioning) per workspace without ever letting
/// one workspace's lock block another's requests.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn same_key_returns_the_same_mutex() {
        let locks = KeyedLocks::new();
        let a = locks.lock_for("A1");
        let b = locks.lock_for("A1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let a = locks.lock_for("A1");
        let _held = a.lock().await;

        let b = locks.lock_for("B1");
        tokio::time::timeout(Duration::from_millis(50), b.lock())
            .await
            .expect("workspace B must not wait on workspace A's lock");
    }
}
