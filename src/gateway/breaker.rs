//! Consecutive-failure circuit breaker for the chat gateway.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    /// How long the breaker stays open before letting a trial call through.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Opens after `threshold` consecutive failures and short-circuits calls
/// until `cooldown` has elapsed. After the cooldown one trial call is let
/// through (half-open); its outcome closes or re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            config,
        }
    }

    /// Returns an error while the breaker is open and the cooldown is running.
    pub fn check(&self) -> Result<(), ProviderError> {
        let mut opened_at = self
            .opened_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *opened_at {
            Some(at) if at.elapsed() < self.config.cooldown => Err(ProviderError::CircuitOpen {
                consecutive_failures: self.failure_count(),
            }),
            Some(_) => {
                // Half-open: let this call through, re-arm on the next failure.
                *opened_at = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Record a failure. Returns current consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.config.threshold {
            let mut opened_at = self
                .opened_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if opened_at.is_none() {
                *opened_at = Some(Instant::now());
            }
        }
        count
    }

    /// Reset on success.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut opened_at = self
            .opened_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *opened_at = None;
    }

    /// Current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.check().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            threshold,
            cooldown,
        })
    }

    #[test]
    fn starts_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(cb.check().is_ok());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn opens_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert!(matches!(
            cb.check(),
            Err(ProviderError::CircuitOpen {
                consecutive_failures: 3
            })
        ));
    }

    #[test]
    fn resets_on_success() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_open());
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert!(!cb.is_open());
    }

    #[test]
    fn half_opens_after_cooldown() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        // Zero cooldown: the next check lets a trial call through.
        assert!(cb.check().is_ok());
        // A failing trial re-opens immediately.
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);
    }
}
