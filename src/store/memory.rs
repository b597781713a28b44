//! In-process counter store.
//!
//! Suitable for tests and single-instance deployments. Keys are sharded by
//! `DashMap`, whose per-shard locking gives every operation per-key
//! atomicity. Expiry is evaluated lazily against the injected clock and can
//! also be swept in bulk with [`MemoryStore::sweep_expired`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::debug;

use super::{CounterStore, StoreError, StoreResult};
use crate::clock::{add_span, duration_ms, Clock};

enum Slot {
    Value(String),
    Window(BTreeSet<(i64, String)>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

fn wrong_type(key: &str, expected: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("expected {}", expected),
    }
}

fn bump(key: &str, slot: &mut Slot) -> StoreResult<i64> {
    match slot {
        Slot::Value(raw) => {
            let next = raw
                .parse::<i64>()
                .ok()
                .and_then(|current| current.checked_add(1))
                .ok_or_else(|| wrong_type(key, "integer value"))?;
            *raw = next.to_string();
            Ok(next)
        }
        Slot::Window(_) => Err(wrong_type(key, "integer value")),
    }
}

/// Counter store kept in process memory.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store whose TTLs follow `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of keys currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        debug!(removed = removed, "Swept expired store keys");
        removed
    }

    fn evict_if_expired(&self, key: &str) {
        let now = self.clock.now_ms();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn counter_entry(&self, key: &str) -> RefMut<'_, String, Entry> {
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Value("0".to_string()),
            expires_at: None,
        })
    }

    fn ttl_deadline(&self, ttl: Duration) -> i64 {
        add_span(self.clock.now_ms(), duration_ms(ttl))
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn insert(&self, key: &str, timestamp_ms: i64, token: &str) -> StoreResult<()> {
        self.evict_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Window(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.slot {
            Slot::Window(set) => {
                set.insert((timestamp_ms, token.to_string()));
                Ok(())
            }
            Slot::Value(_) => Err(wrong_type(key, "ordered set")),
        }
    }

    async fn purge_before(&self, key: &str, cutoff_ms: i64) -> StoreResult<u64> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.slot {
                Slot::Window(set) => {
                    let before = set.len();
                    set.retain(|(ts, _)| *ts > cutoff_ms);
                    (before - set.len()) as u64
                }
                Slot::Value(_) => return Err(wrong_type(key, "ordered set")),
            },
            None => 0,
        };
        // An emptied set disappears, the way Redis drops empty sorted sets.
        self.entries
            .remove_if(key, |_, entry| matches!(&entry.slot, Slot::Window(set) if set.is_empty()));
        Ok(removed)
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.slot {
                Slot::Window(set) => Ok(set.len() as u64),
                Slot::Value(_) => Err(wrong_type(key, "ordered set")),
            },
            None => Ok(0),
        }
    }

    async fn oldest(&self, key: &str) -> StoreResult<Option<i64>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.slot {
                Slot::Window(set) => Ok(set.first().map(|(ts, _)| *ts)),
                Slot::Value(_) => Err(wrong_type(key, "ordered set")),
            },
            None => Ok(None),
        }
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.evict_if_expired(key);
        let deadline = self.ttl_deadline(ttl);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.evict_if_expired(key);
        let mut entry = self.counter_entry(key);
        bump(key, &mut entry.slot)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.slot {
                Slot::Value(raw) => Ok(Some(raw.clone())),
                Slot::Window(_) => Err(wrong_type(key, "plain value")),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let entry = Entry {
            slot: Slot::Value(value.to_string()),
            expires_at: Some(self.ttl_deadline(ttl)),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|item| item.key().starts_with(prefix))
            .map(|item| item.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.evict_if_expired(key);
        let deadline = self.ttl_deadline(ttl);
        let mut guard = self.counter_entry(key);
        let entry = &mut *guard;
        let next = bump(key, &mut entry.slot)?;
        entry.expires_at.get_or_insert(deadline);
        Ok(next)
    }
}
