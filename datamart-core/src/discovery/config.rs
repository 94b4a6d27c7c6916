use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AdmissionGate, WorkerPool, policy::QueryFailurePolicy};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Admission gate capacity for on-demand queries.
    pub concurrency: usize,
    /// Slots in the worker pool used by blocking handlers.
    pub worker_threads: usize,
    pub reconnect_backoff_min_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub failure_policy: QueryFailurePolicy,
    pub dead_letter_exchange: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: AdmissionGate::DEFAULT_CAPACITY,
            worker_threads: WorkerPool::default_size(),
            reconnect_backoff_min_ms: 200,
            reconnect_backoff_max_ms: 5_000,
            failure_policy: QueryFailurePolicy::default(),
            dead_letter_exchange: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_failure_policy(mut self, policy: QueryFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_backoff_min_ms),
            Duration::from_millis(self.reconnect_backoff_max_ms),
        )
    }
}

/// Doubling delay between reconnect attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}
