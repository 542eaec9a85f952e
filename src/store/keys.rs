//! Store key layout.

use crate::scheduler::Priority;

/// Builds every key the queue core reads or writes.
///
/// ```text
/// task:{id}              serialized Task, TTL = timeout
/// queue:{priority}       sorted set of task ids
/// queue:processing       sorted set of leased task ids, score = lease deadline (ms)
/// queue:deferred         sorted set of task ids held back by an open breaker, score = release time (ms)
/// queue:seq              monotonic enqueue counter
/// queue:dead_letter      capped list of DeadLetterEntry
/// result:{id}            serialized TaskResult, fixed TTL
/// workers:{priority}     set of registered worker ids
/// breaker:{dependency}   serialized CircuitBreaker
/// breakers               set of known dependency names
/// metrics:ai_pipeline    serialized AiPipelineMetrics
/// ```
///
/// An optional prefix namespaces all keys, e.g. `staging:` for a shared
/// Redis instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task(&self, id: &str) -> String {
        format!("{}task:{}", self.prefix, id)
    }

    pub fn queue(&self, priority: Priority) -> String {
        format!("{}queue:{}", self.prefix, priority)
    }

    pub fn processing(&self) -> String {
        format!("{}queue:processing", self.prefix)
    }

    pub fn deferred(&self) -> String {
        format!("{}queue:deferred", self.prefix)
    }

    pub fn sequence(&self) -> String {
        format!("{}queue:seq", self.prefix)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}queue:dead_letter", self.prefix)
    }

    pub fn result(&self, id: &str) -> String {
        format!("{}result:{}", self.prefix, id)
    }

    pub fn workers(&self, priority: Priority) -> String {
        format!("{}workers:{}", self.prefix, priority)
    }

    pub fn breaker(&self, dependency: &str) -> String {
        format!("{}breaker:{}", self.prefix, dependency)
    }

    pub fn breakers(&self) -> String {
        format!("{}breakers", self.prefix)
    }

    pub fn pipeline_metrics(&self) -> String {
        format!("{}metrics:ai_pipeline", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = Keys::default();
        assert_eq!(keys.task("abc"), "task:abc");
        assert_eq!(keys.queue(Priority::Critical), "queue:critical");
        assert_eq!(keys.result("abc"), "result:abc");
        assert_eq!(keys.dead_letter(), "queue:dead_letter");
        assert_eq!(keys.workers(Priority::Background), "workers:background");
    }

    #[test]
    fn test_prefixed_layout() {
        let keys = Keys::new("staging:");
        assert_eq!(keys.task("abc"), "staging:task:abc");
        assert_eq!(keys.breaker("spotify_api"), "staging:breaker:spotify_api");
        assert_eq!(keys.processing(), "staging:queue:processing");
        assert_eq!(keys.deferred(), "staging:queue:deferred");
    }
}
