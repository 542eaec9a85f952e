//! Ordered store adapter.
//!
//! The queue core needs a small set of key/value primitives from a shared
//! store reachable by every worker:
//!
//! - **Strings**: set-with-expiry, set-if-absent, get, delete, increment
//! - **Sorted sets**: add, atomic pop-minimum, remove, cardinality, range by score
//! - **Lists**: push, trim, length, range
//! - **Sets**: add, remove, cardinality, members
//!
//! # Backends
//!
//! - [`RedisStore`]: production backend over a Redis connection manager
//! - [`InMemoryStore`]: single-process backend with identical semantics,
//!   used for tests and local simulations
//!
//! # Concurrency
//!
//! `zpopmin` must be atomic across concurrent callers. It is the one strict
//! mutual-exclusion point of the whole queue: two workers racing on the same
//! index never receive the same member.

mod keys;
mod memory;
mod redis;

pub use self::keys::Keys;
pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Key/value store primitives consumed by the queue core.
///
/// List and range indices follow Redis semantics: negative indices count
/// from the tail, `stop` is inclusive.
#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// Round-trips to the backend.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Sets `key` to `value` with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Sets `key` to `value` with a time-to-live only if `key` is absent.
    /// Returns whether the value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Sets `key` to `value` without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Deletes `key`, returning whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increments the integer at `key` and returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Atomically removes and returns the lowest-scored member.
    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;

    /// Removes `member`, returning whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// Members with score `<= max`, lowest first, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Pushes to the head of a list and returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;

    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Adds to a set, returning whether the member was new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn scard(&self, key: &str) -> Result<usize, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
}
