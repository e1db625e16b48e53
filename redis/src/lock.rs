use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key async mutex. Used to serialize read-merge-write cycles on a
/// single store record inside this process.
#[derive(Default, Clone)]
pub struct KeyedMutex {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > 1024 {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn same_key_is_serialized() {
        let locks = KeyedMutex::new();
        let guard = locks.lock("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("a").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // a different key is independent
        let _b = locks.lock("b").await;

        drop(guard);
        waiter.await.unwrap();
    }
}
