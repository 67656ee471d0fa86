//! In-process queue store.
//!
//! Mirrors the Redis semantics the rest of the crate relies on: FIFO lists
//! with blocking pops woken by pushes, sets, sorted sets and plain strings.
//! Published messages are kept in an append-only log instead of being
//! delivered to subscribers.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::store::QueueStore;
use crate::error::QueueError;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
    strings: HashMap<String, String>,
    published: Vec<(String, String)>,
}

/// Which end of a list a pop takes from.
#[derive(Clone, Copy)]
enum End {
    Head,
    Tail,
}

/// Queue store kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published on `channel`, oldest first.
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Sorted set entries at `key` with their scores, ordered by score.
    pub fn sorted_set_entries(&self, key: &str) -> Vec<(f64, String)> {
        self.lock().sorted_sets.get(key).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_pop(&self, key: &str, end: End) -> Option<String> {
        let mut state = self.lock();
        let list = state.lists.get_mut(key)?;
        let value = match end {
            End::Head => list.pop_front(),
            End::Tail => list.pop_back(),
        };
        if list.is_empty() {
            state.lists.remove(key);
        }
        value
    }

    async fn blocking_pop(&self, key: &str, end: End, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key, end) {
                return Some(value);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(key, end);
            }
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn rpush(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lpush(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        Ok(self.blocking_pop(key, End::Head, timeout).await)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        Ok(self.blocking_pop(key, End::Tail, timeout).await)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), QueueError> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: String) -> Result<(), QueueError> {
        let mut state = self.lock();
        let entries = state.sorted_sets.entry(key.to_string()).or_default();
        entries.retain(|(_, m)| *m != member);
        entries.push((score, member));
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError> {
        self.lock().strings.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.lock().strings.get(key).cloned())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError> {
        self.lock().published.push((channel.to_string(), message));
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, QueueError> {
        let state = self.lock();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let resolve = |i: isize| if i < 0 { len + i } else { i };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, QueueError> {
        Ok(self
            .lock()
            .sorted_sets
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, QueueError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
