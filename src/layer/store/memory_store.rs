//! In-process store backend.
//!
//! Several distributed layers can share one `MemoryStore` to behave like
//! processes sharing a Redis instance. Keys expire lazily on access.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{LayerStore, StoreError, StoreHealth};

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T: Default> Expiring<T> {
    fn new() -> Self {
        Self {
            value: T::default(),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of [`LayerStore`]
#[derive(Default)]
pub struct MemoryStore {
    sets: DashMap<String, Expiring<HashSet<String>>>,
    lists: DashMap<String, Expiring<VecDeque<Vec<u8>>>>,
    pushed: Notify,
    list_pushes: AtomicU64,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of list pushes (relayed envelopes) so far
    pub fn list_pushes(&self) -> u64 {
        self.list_pushes.load(Ordering::Acquire)
    }

    /// Number of store operations so far
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Acquire)
    }

    /// Elements currently queued in a list
    pub fn list_len(&self, key: &str) -> usize {
        let now = Instant::now();
        self.lists
            .get(key)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.value.len())
            .unwrap_or(0)
    }

    fn count(&self) {
        self.operations.fetch_add(1, Ordering::AcqRel);
    }

    fn members(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let expired = match self.sets.get(key) {
            Some(set) if !set.is_expired(now) => return set.value.iter().cloned().collect(),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sets.remove_if(key, |_, set| set.is_expired(now));
        }
        Vec::new()
    }

    fn try_pop(&self, key: &str) -> Option<Vec<u8>> {
        let Entry::Occupied(mut list) = self.lists.entry(key.to_string()) else {
            return None;
        };
        if list.get().is_expired(Instant::now()) {
            list.remove();
            return None;
        }
        let value = list.get_mut().value.pop_back();
        if list.get().value.is_empty() {
            list.remove();
        }
        value
    }
}

#[async_trait]
impl LayerStore for MemoryStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.count();
        let now = Instant::now();
        let mut set = self.sets.entry(key.to_string()).or_insert_with(Expiring::new);
        if set.is_expired(now) {
            *set = Expiring::new();
        }
        set.value.insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.count();
        if let Entry::Occupied(mut set) = self.sets.entry(key.to_string()) {
            set.get_mut().value.remove(member);
            if set.get().value.is_empty() || set.get().is_expired(Instant::now()) {
                set.remove();
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.count();
        Ok(self.members(key))
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>, StoreError> {
        self.count();
        let union: HashSet<String> = keys.iter().flat_map(|key| self.members(key)).collect();
        Ok(union.into_iter().collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.count();
        let expires_at = Some(Instant::now() + ttl);
        if let Some(mut set) = self.sets.get_mut(key) {
            set.expires_at = expires_at;
        }
        if let Some(mut list) = self.lists.get_mut(key) {
            list.expires_at = expires_at;
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.count();
        self.list_pushes.fetch_add(1, Ordering::AcqRel);
        {
            let now = Instant::now();
            let mut list = self.lists.entry(key.to_string()).or_insert_with(Expiring::new);
            if list.is_expired(now) {
                *list = Expiring::new();
            }
            list.value.push_front(value);
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.count();
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a push in between is not missed
            let pushed = self.pushed.notified();
            if let Some(value) = self.try_pop(key) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn health(&self) -> StoreHealth {
        StoreHealth {
            store: "memory",
            healthy: true,
            redis: None,
            idle_connections: None,
        }
    }
}
