//! In-process slot store
//!
//! Leases are kept in a sharded map and measured against `tokio::time::Instant`,
//! so tests can expire them with a paused clock.

use crate::{SlotStore, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct Lease {
    value: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Slot store living in this process only
///
/// Cloning yields a handle to the same underlying map, which is how tests model
/// several gatekeepers sharing one coordination store.
#[derive(Debug, Clone, Default)]
pub struct MemorySlotStore {
    leases: Arc<DashMap<String, Lease>>,
    /// Number of upcoming calls that fail with `Unavailable`
    injected_failures: Arc<AtomicUsize>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail as if the store were unreachable
    pub fn fail_next(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of live leases
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases.iter().filter(|e| e.value().is_live(now)).count()
    }

    /// Drop every expired lease
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.leases.retain(|_, lease| lease.is_live(now));
    }

    fn check_available(&self) -> StoreResult<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Unavailable(
                "injected failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let lease = Lease {
            value: value.to_string(),
            expires_at: now + ttl,
        };

        // The entry guard holds the shard lock, so check and write are atomic
        let swapped = match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = Some(entry.get())
                    .filter(|l| l.is_live(now))
                    .map(|l| l.value.as_str());
                if current == expected {
                    entry.insert(lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(lease);
                    true
                } else {
                    false
                }
            }
        };

        trace!("CAS {} ({:?} -> {}): {}", key, expected, value, swapped);
        Ok(swapped)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let removed = self
            .leases
            .remove_if(key, |_, lease| lease.is_live(now) && lease.value == expected)
            .is_some();
        Ok(removed)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .leases
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.value.clone()))
    }

    async fn renew(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.is_live(now) && lease.value == expected => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
