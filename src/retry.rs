//! Per-object exponential backoff with jitter.
//!
//! kube-runtime asks the error policy how long to wait after a failed
//! reconcile. [`ErrorBackoff`] answers with a delay that doubles for every
//! consecutive failure of the same object and resets once a pass succeeds.
//! Objects deleted while failing never get that successful pass, so the
//! number of tracked keys is capped.
//!
//! # Example
//!
//! ```ignore
//! let backoff = ErrorBackoff::new(BackoffConfig::default());
//! let delay = backoff.next_delay("games/friday");
//! // ... after a successful pass
//! backoff.reset("games/friday");
//! ```

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

/// Shape of the backoff curve.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
    /// Apply 0.5x to 1.5x jitter to each delay
    pub jitter: bool,
    /// Most objects tracked at once; a new key past this evicts an old one
    pub max_tracked: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
            max_tracked: 4096,
        }
    }
}

/// Consecutive-failure counters keyed by object
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    config: BackoffConfig,
    attempts: DashMap<String, u32>,
}

impl ErrorBackoff {
    /// Create a tracker with the given curve
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait
    pub fn next_delay(&self, key: &str) -> Duration {
        if !self.attempts.contains_key(key) && self.attempts.len() >= self.config.max_tracked {
            self.evict_one();
        }
        let attempt = {
            let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = (self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent))
        .min(self.config.max_delay.as_secs_f64());

        let delay = if self.config.jitter {
            base * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            base
        };

        Duration::from_secs_f64(delay.min(self.config.max_delay.as_secs_f64()))
    }

    /// Forget the failure history of `key`
    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    /// Consecutive failures currently recorded for `key`
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    /// Number of objects with a failure history
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    fn evict_one(&self) {
        // the iterator guard must be released before removing
        let victim = self.attempts.iter().next().map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            self.attempts.remove(&victim);
        }
    }
}
