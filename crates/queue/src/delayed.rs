//! Delayed delivery.
//!
//! [`DelayedQueue`] backs the in-memory broker. [`RedisDelayScheduler`]
//! keeps delayed message ids in a sorted set scored by due time and
//! promotes them to the ready list when due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::Utc;
use fred::clients::Client;
use fred::interfaces::{HashesInterface, LuaInterface, SortedSetsInterface};
use tokio::time::Instant;

use crate::broker::BrokerError;
use crate::job::JobMessage;

struct Scheduled {
    due: Instant,
    seq: u64,
    message: JobMessage,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: the heap pops the earliest due time, then the earliest insert.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of messages keyed by due time.
#[derive(Default)]
pub struct DelayedQueue {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
}

impl DelayedQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `message` for delivery after `delay`.
    pub fn schedule(&mut self, message: JobMessage, delay: Duration) {
        self.seq += 1;
        self.heap.push(Scheduled {
            due: Instant::now() + delay,
            seq: self.seq,
            message,
        });
    }

    /// Remove and return every message due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<JobMessage> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry.message);
            }
        }
        due
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Moves due ids from the delayed set to the ready list.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
end
return #due
";

const PROMOTE_LIMIT: u32 = 500;

/// Sorted-set based delay scheduler.
///
/// Delayed bodies live in the queue's body hash; the sorted set only holds
/// ids so a promoted entry is always resolved through the hash.
#[derive(Clone)]
pub struct RedisDelayScheduler {
    client: Client,
}

impl RedisDelayScheduler {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Store `body` under `id` and schedule it `delay` from now.
    pub async fn schedule(
        &self,
        delayed_key: &str,
        bodies_key: &str,
        id: &str,
        body: String,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        self.client
            .hset::<(), _, _>(bodies_key, (id, body))
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        self.client
            .zadd::<(), _, _>(delayed_key, None, None, false, false, (due as f64, id))
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        Ok(())
    }

    /// Promote due ids to the ready list. Returns how many moved.
    pub async fn promote(&self, delayed_key: &str, ready_key: &str) -> Result<u64, BrokerError> {
        let now = Utc::now().timestamp_millis();
        let moved: i64 = self
            .client
            .eval(
                PROMOTE_SCRIPT,
                vec![delayed_key.to_string(), ready_key.to_string()],
                vec![now.to_string(), PROMOTE_LIMIT.to_string()],
            )
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        Ok(moved.max(0) as u64)
    }
}
