//! Configuration for the sync core.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Configuration for [`crate::SyncCore`] and its components.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Attempts per object before an update gives up on version conflicts.
    pub max_conflict_retries: u32,
    /// Backoff between conflict and lock retries.
    pub retry: RetryConfig,
    /// How long an unsubscribe may hold a channel lock.
    pub lock_ttl: Duration,
    /// Attempts to acquire a channel lock before giving up.
    pub max_lock_attempts: u32,
    /// Transport topic deltas are published on.
    pub delta_topic: String,
    /// Queue carrying system messages such as schema changes.
    pub system_queue: String,
    /// Largest accepted batch of objects, ids or patches.
    pub max_batch_size: usize,
}

impl CoreConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_conflict_retries: 10,
            retry: RetryConfig::new()
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(500)),
            lock_ttl: Duration::from_secs(5),
            max_lock_attempts: 10,
            delta_topic: "deltas".into(),
            system_queue: "system".into(),
            max_batch_size: 1000,
        }
    }

    /// Sets the conflict retry ceiling.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Sets the retry backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the channel lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets the lock acquisition attempts.
    pub fn with_max_lock_attempts(mut self, attempts: u32) -> Self {
        self.max_lock_attempts = attempts;
        self
    }

    /// Sets the delta topic.
    pub fn with_delta_topic(mut self, topic: impl Into<String>) -> Self {
        self.delta_topic = topic.into();
        self
    }

    /// Sets the system queue.
    pub fn with_system_queue(mut self, queue: impl Into<String>) -> Self {
        self.system_queue = queue.into();
        self
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Checks the configuration for values no deployment can run with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ServerConfigurationFailure`] naming the first
    /// offending setting.
    pub fn validate(&self) -> CoreResult<()> {
        let fail = |msg: &str| Err(CoreError::ServerConfigurationFailure(msg.into()));
        if self.max_conflict_retries == 0 {
            return fail("max_conflict_retries must be at least 1");
        }
        if self.max_lock_attempts == 0 {
            return fail("max_lock_attempts must be at least 1");
        }
        if self.lock_ttl.is_zero() {
            return fail("lock_ttl must be positive");
        }
        if self.delta_topic.is_empty() || self.system_queue.is_empty() {
            return fail("delta_topic and system_queue must be named");
        }
        if self.max_batch_size == 0 {
            return fail("max_batch_size must be positive");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return fail("backoff_multiplier must be at least 1.0");
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff shape between retries.
///
/// How many attempts are made is decided by the caller, through
/// [`CoreConfig::max_conflict_retries`] and [`CoreConfig::max_lock_attempts`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately, without waiting.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Sleeps for the delay of `attempt`.
    pub async fn backoff(&self, attempt: u32) {
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
