mod lock;
mod memory;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use lock::KeyedMutex;
pub use memory::MemoryStore;
pub use pool::RedisPool;
pub use redis;

/// The shared key-value/queue store. Every write is last-writer-wins on its
/// key; the only cross-write guarantees are the atomic single-command ones
/// documented per method.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, expire: u64) -> Result<()>;

    /// Set only if the key doesn't exist. Returns true if the value was set.
    async fn set_nx_ex(&self, key: &str, value: &str, expire: u64) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// Delete the key only while it still holds `value`.
    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool>;

    async fn expire(&self, key: &str, expire: u64) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize>;

    /// Atomic single item dequeue from the head of the list.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<usize>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Atomically set a hash field and return its previous value.
    async fn hswap(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<String>>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
}

/// A store-held lease: the key holds the owner's token for `expire` seconds.
/// Only the owner can refresh or release it.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    owner: String,
}

impl Lease {
    pub fn new(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn acquire(
        &self,
        store: &Arc<dyn SharedStore>,
        expire: u64,
    ) -> Result<bool> {
        store.set_nx_ex(&self.key, &self.owner, expire).await
    }

    /// The current owner of the lease key, if any.
    pub async fn holder(&self, store: &Arc<dyn SharedStore>) -> Result<Option<String>> {
        store.get(&self.key).await
    }

    pub async fn refresh(&self, store: &Arc<dyn SharedStore>, expire: u64) -> Result<bool> {
        if store.get(&self.key).await?.as_deref() != Some(self.owner.as_str()) {
            return Ok(false);
        }
        store.expire(&self.key, expire).await
    }

    pub async fn release(&self, store: &Arc<dyn SharedStore>) -> Result<bool> {
        store.del_if_value(&self.key, &self.owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_is_exclusive() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = Lease::new("active", "a");
        let b = Lease::new("active", "b");
        assert!(a.acquire(&store, 60).await.unwrap());
        assert!(!b.acquire(&store, 60).await.unwrap());
        assert_eq!(b.holder(&store).await.unwrap().as_deref(), Some("a"));
        assert!(!b.release(&store).await.unwrap());
        assert!(!b.refresh(&store, 60).await.unwrap());
        assert!(a.refresh(&store, 60).await.unwrap());
        assert!(a.release(&store).await.unwrap());
        assert!(b.acquire(&store, 60).await.unwrap());
    }
}
