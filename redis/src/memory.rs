use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::SharedStore;

enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-process implementation of [`SharedStore`] with the same single-key
/// semantics as the redis one. Expiry follows the tokio clock.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

fn wrong_type(key: &str) -> anyhow::Error {
    anyhow!("WRONGTYPE operation against key {key} holding the wrong kind of value")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> R,
    ) -> R {
        let mut entries = self.entries.lock();
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
        f(&mut entries)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at.map(|at| at > now).unwrap_or(true))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_live(key, |entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_ex(&self, key: &str, value: &str, expire: u64) -> Result<()> {
        self.with_live(key, |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + Duration::from_secs(expire)),
                },
            );
        });
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, expire: u64) -> Result<bool> {
        Ok(self.with_live(key, |entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + Duration::from_secs(expire)),
                },
            );
            true
        }))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.with_live(key, |entries| entries.remove(key).is_some()))
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.with_live(key, |entries| {
            let matches = matches!(
                entries.get(key),
                Some(Entry { value: Value::Str(s), .. }) if s == value
            );
            if matches {
                entries.remove(key);
            }
            matches
        }))
    }

    async fn expire(&self, key: &str, expire: u64) -> Result<bool> {
        Ok(self.with_live(key, |entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(expire));
                true
            }
            None => false,
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.with_live(key, |entries| entries.contains_key(key)))
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        self.with_live(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => {
                    list.extend(values.iter().cloned());
                    Ok(list.len())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.with_live(key, |entries| {
            let (item, now_empty) = match entries.get_mut(key) {
                None => return Ok(None),
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => {
                    let item = list.pop_front();
                    (item, list.is_empty())
                }
                Some(_) => return Err(wrong_type(key)),
            };
            if now_empty {
                entries.remove(key);
            }
            Ok(item)
        })
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.with_live(key, |entries| match entries.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hswap(key, field, value).await.map(|_| ())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.with_live(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    if hash.contains_key(field) {
                        Ok(false)
                    } else {
                        hash.insert(field.to_string(), value.to_string());
                        Ok(true)
                    }
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hswap(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<String>> {
        self.with_live(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    Ok(hash.insert(field.to_string(), value.to_string()))
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_live(key, |entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_live(key, |entries| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }
}
