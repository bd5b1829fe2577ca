//! Engine configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Backoff and ceiling for retryable step failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed per step before the instance is terminated.
    /// `None` retries without bound.
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, up to `max_retries` times.
    pub fn immediate(max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Delay before retry number `retries_so_far + 1`.
    pub fn backoff(&self, retries_so_far: u32) -> Duration {
        let exponent = i32::try_from(retries_so_far).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    /// Whether the retry budget is spent.
    pub fn exhausted(&self, retries_so_far: u32) -> bool {
        self.max_retries.is_some_and(|max| retries_so_far >= max)
    }
}

/// Configuration for the scheduler and its workers.
///
/// # Example
///
/// ```rust
/// use std::num::NonZeroUsize;
/// use std::time::Duration;
/// use workflow_runtime::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_worker_count(NonZeroUsize::new(8).unwrap())
///     .with_poll_interval(Duration::from_millis(100));
/// assert_eq!(config.worker_count.get(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix for worker ids; lease owners are `{node_id}-{n}`.
    pub node_id: String,
    pub worker_count: NonZeroUsize,
    pub poll_interval: Duration,
    /// Maximum ids fetched per poll.
    pub batch_size: NonZeroUsize,
    /// Capacity of the queue between the poll loop and the workers.
    pub queue_capacity: NonZeroUsize,
    pub lease_ttl: Duration,
    /// How often a running step's lease is extended. Should be below `lease_ttl`.
    pub heartbeat_interval: Option<Duration>,
    /// How long `stop` waits for in-flight work.
    pub stop_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            worker_count: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            poll_interval: Duration::from_millis(500),
            batch_size: NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN),
            queue_capacity: NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN),
            lease_ttl: Duration::from_secs(5 * 60), // Default 5 minutes
            heartbeat_interval: Some(Duration::from_secs(2 * 60)), // Default 2 minutes (before TTL)
            stop_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the number of parallel workers (default: 4).
    #[must_use]
    pub fn with_worker_count(mut self, count: NonZeroUsize) -> Self {
        self.worker_count = count;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: NonZeroUsize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the lease TTL. A crashed worker's instances become available again after this.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the heartbeat interval for lease renewal. `None` disables heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or(chrono::Duration::MAX)
    }
}
