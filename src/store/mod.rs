//! Sliding-window counter storage.
//!
//! Every limiter counts events through a [`CounterStore`]. Two backends are
//! provided: [`MemoryCounterStore`] for a single process and
//! [`RedisCounterStore`] for counters shared between instances. Callers go
//! through the fail-open [`Counters`] facade, which turns backend failures
//! into warnings instead of denials.

mod memory;
mod redis_store;

pub use self::memory::MemoryCounterStore;
pub use self::redis_store::{RedisCounterStore, RedisStoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;

/// Identifies one sliding-window event sequence.
///
/// The `retention` is the widest window any caller counts over for this key.
/// Entries older than `now - retention` are pruned, so narrower windows can
/// still be counted from the same sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The rate limit axis, e.g. `quota:endpoint`
    pub dimension: String,
    /// Client key or shared region key
    pub identity: String,
    /// How long entries are kept
    pub retention: Duration,
}

impl CounterKey {
    pub fn new(dimension: impl Into<String>, identity: impl Into<String>, retention: Duration) -> Self {
        Self {
            dimension: dimension.into(),
            identity: identity.into(),
            retention,
        }
    }

    /// Storage key string.
    /// Format: "{dimension}|{identity}", `|` never appears in dimension names
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.dimension, self.identity)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// One limit checked by [`CounterStore::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    pub key: CounterKey,
    pub window: Duration,
    pub max_requests: u64,
}

impl Allowance {
    pub fn new(key: CounterKey, window: Duration, max_requests: u64) -> Self {
        Self {
            key,
            window,
            max_requests,
        }
    }
}

/// Outcome of an [`acquire`](CounterStore::acquire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Every allowance had room and one event was recorded on each key
    Granted,
    /// The allowance at `index` was full; nothing was recorded
    Exhausted { index: usize, count: u64 },
}

/// Backend contract for sliding-window counters.
///
/// Implementations must make `record` and `count` atomic per key, and
/// `acquire` atomic across its keys with respect to other `acquire` calls.
/// Plain `record` and `count` calls carry no cross-key guarantee.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Check the allowances in order and, only if all of them have room,
    /// record one event at `now` on each key.
    async fn acquire(&self, allowances: &[Allowance], now: DateTime<Utc>) -> Result<Acquisition>;

    /// Append an event at `at`.
    async fn record(&self, key: &CounterKey, at: DateTime<Utc>) -> Result<()>;

    /// Number of events in `(now - window, now]`, pruning expired entries.
    async fn count(&self, key: &CounterKey, window: Duration, now: DateTime<Utc>) -> Result<u64>;

    /// Oldest event still inside the window.
    async fn oldest(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Drop every key belonging to an identity. Returns the number of keys removed.
    async fn remove_identity(&self, identity: &str) -> Result<u64>;

    /// Prune all keys. Returns the number of keys dropped entirely.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Number of live keys, if the backend can tell cheaply.
    fn key_count(&self) -> Option<usize>;

    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Fail-open facade over a [`CounterStore`].
///
/// A backend error is logged and degrades to "nothing counted", so an
/// unreachable store can never block admission.
#[derive(Clone)]
pub struct Counters {
    store: Arc<dyn CounterStore>,
}

impl Counters {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Atomic check-and-record. An unreachable backend grants without
    /// recording anything.
    pub async fn acquire(&self, allowances: &[Allowance], now: DateTime<Utc>) -> Acquisition {
        match self.store.acquire(allowances, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, keys = allowances.len(), backend = self.store.name(), "Counter acquire failed, failing open");
                Acquisition::Granted
            }
        }
    }

    pub async fn count(&self, key: &CounterKey, window: Duration, now: DateTime<Utc>) -> u64 {
        match self.store.count(key, window, now).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, key = %key, backend = self.store.name(), "Counter read failed, failing open");
                0
            }
        }
    }

    pub async fn oldest(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.store.oldest(key, window, now).await {
            Ok(oldest) => oldest,
            Err(e) => {
                warn!(error = %e, key = %key, backend = self.store.name(), "Counter oldest lookup failed");
                None
            }
        }
    }

    pub async fn record(&self, key: &CounterKey, at: DateTime<Utc>) {
        if let Err(e) = self.store.record(key, at).await {
            warn!(error = %e, key = %key, backend = self.store.name(), "Counter record failed");
        }
    }

    /// Record one event on each key concurrently.
    pub async fn record_all(&self, keys: &[CounterKey], at: DateTime<Utc>) {
        join_all(keys.iter().map(|key| self.record(key, at))).await;
    }

    pub async fn remove_identity(&self, identity: &str) -> u64 {
        match self.store.remove_identity(identity).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, identity = %identity, "Failed to clear client counters");
                0
            }
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> u64 {
        match self.store.sweep(now).await {
            Ok(dropped) => dropped,
            Err(e) => {
                warn!(error = %e, backend = self.store.name(), "Counter sweep failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters")
            .field("backend", &self.store.name())
            .finish()
    }
}
