//! In-process backend for the ordered store.
//!
//! Mirrors the Redis command semantics the queue relies on, including
//! key expiry and negative list indices, so the queue core can be
//! exercised without a server. A single mutex guards all state, which
//! makes every command atomic. Expiry is measured on the store's
//! [`Clock`], so a `ManualClock` shared with the queue drives TTLs too.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::OrderedStore;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    sorted_sets: HashMap<String, BTreeMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl State {
    fn live_string(&mut self, key: &str, now: DateTime<Utc>) -> Option<&StringEntry> {
        let expired = self
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

/// `None` when the deadline is past the representable range, i.e. never.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

/// Ordered store held entirely in process memory.
pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Creates an empty store that expires keys on wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that expires keys on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

/// Resolves a Redis-style inclusive `[start, stop]` range against `len`.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn ordered_members(set: &BTreeMap<String, f64>) -> Vec<(&String, f64)> {
    let mut members: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
    // BTreeMap iteration is already lexicographic, so a stable sort by score
    // keeps ties in member order like Redis.
    members.sort_by(|a, b| a.1.total_cmp(&b.1));
    members
}

#[async_trait]
impl OrderedStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = expiry(self.clock.now(), ttl);
        let mut state = self.lock()?;
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if state.live_string(key, now).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(state.live_string(key, now).map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let existed = state.live_string(key, now).is_some();
        state.strings.remove(key);
        let removed = state.sorted_sets.remove(key).is_some()
            | state.lists.remove(key).is_some()
            | state.sets.remove(key).is_some();
        Ok(existed || removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let current = match state.live_string(key, now) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::UnexpectedReply {
                    command: "INCR".to_string(),
                    detail: format!("value at '{}' is not an integer", key),
                })?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = state.strings.get(key).and_then(|e| e.expires_at);
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut state = self.lock()?;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(None);
        };
        let lowest = ordered_members(set)
            .first()
            .map(|(member, score)| ((*member).clone(), *score));
        if let Some((member, _)) = &lowest {
            set.remove(member);
        }
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(lowest)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .sorted_sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.lock()?;
        Ok(state.sorted_sets.get(key).map_or(0, BTreeMap::len))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        let Some(set) = state.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(ordered_members(set)
            .into_iter()
            .filter(|(_, score)| *score <= max)
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(());
        };
        match resolve_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => list.clear(),
        }
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.lock()?;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.lock()?;
        Ok(state.sets.get(key).map_or(0, BTreeSet::len))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
