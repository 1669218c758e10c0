//! In-process sliding-window counter store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

use super::{Acquisition, Allowance, CounterKey, CounterStore};
use crate::error::Result;

/// Event queue for one key.
#[derive(Debug)]
struct EventQueue {
    /// Event timestamps, oldest first
    events: VecDeque<DateTime<Utc>>,
    /// Widest window counted over this key
    retention: Duration,
}

impl EventQueue {
    fn new(retention: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            retention,
        }
    }

    fn insert(&mut self, at: DateTime<Utc>) {
        // Late arrivals are slotted in place to keep the queue ordered.
        match self.events.back() {
            Some(last) if at < *last => {
                let idx = self.events.partition_point(|t| *t <= at);
                self.events.insert(idx, at);
            }
            _ => self.events.push_back(at),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while matches!(self.events.front(), Some(t) if *t <= cutoff) {
            self.events.pop_front();
        }
    }

    /// Index of the first event inside `(now - window, ..]`.
    fn window_start(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        self.events.partition_point(|t| *t <= cutoff)
    }
}

/// Sliding-window counters held in process memory.
///
/// Keys are spread over the shards of a `DashMap`; holding the shard guard for
/// the whole prune-and-count keeps every per-key operation atomic. Multi-key
/// acquisitions are serialized by a store-wide lock taken before any shard.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    queues: DashMap<String, EventQueue>,
    acquire_lock: Mutex<()>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_now(&self, key: &CounterKey, at: DateTime<Utc>) {
        let mut queue = self
            .queues
            .entry(key.storage_key())
            .or_insert_with(|| EventQueue::new(key.retention));

        // Keep the widest retention any caller asked for.
        if key.retention > queue.retention {
            queue.retention = key.retention;
        }
        queue.insert(at);
    }

    fn count_now(&self, key: &CounterKey, window: Duration, now: DateTime<Utc>) -> u64 {
        let Some(mut queue) = self.queues.get_mut(&key.storage_key()) else {
            return 0;
        };

        queue.prune(now);
        let start = queue.window_start(window, now);
        (queue.events.len() - start) as u64
    }

    fn acquire_now(&self, allowances: &[Allowance], now: DateTime<Utc>) -> Acquisition {
        let _guard = self.acquire_lock.lock();
        for (index, allowance) in allowances.iter().enumerate() {
            let count = self.count_now(&allowance.key, allowance.window, now);
            if count >= allowance.max_requests {
                return Acquisition::Exhausted { index, count };
            }
        }
        for allowance in allowances {
            self.record_now(&allowance.key, now);
        }
        Acquisition::Granted
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn acquire(&self, allowances: &[Allowance], now: DateTime<Utc>) -> Result<Acquisition> {
        Ok(self.acquire_now(allowances, now))
    }

    async fn record(&self, key: &CounterKey, at: DateTime<Utc>) -> Result<()> {
        self.record_now(key, at);
        Ok(())
    }

    async fn count(&self, key: &CounterKey, window: Duration, now: DateTime<Utc>) -> Result<u64> {
        let count = self.count_now(key, window, now);
        trace!(key = %key, count = count, "Counted window");
        Ok(count)
    }

    async fn oldest(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(mut queue) = self.queues.get_mut(&key.storage_key()) else {
            return Ok(None);
        };

        queue.prune(now);
        let start = queue.window_start(window, now);
        Ok(queue.events.get(start).copied())
    }

    async fn remove_identity(&self, identity: &str) -> Result<u64> {
        let before = self.queues.len();
        self.queues
            .retain(|key, _| key.split_once('|').map(|(_, id)| id) != Some(identity));
        Ok((before - self.queues.len()) as u64)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.queues.len();
        self.queues.retain(|_, queue| {
            queue.prune(now);
            !queue.events.is_empty()
        });
        Ok((before - self.queues.len()) as u64)
    }

    fn key_count(&self) -> Option<usize> {
        Some(self.queues.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
