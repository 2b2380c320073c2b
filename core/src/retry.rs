//! Bounded exponential backoff for datastore calls.
//!
//! Only [`StoreError::Transient`] is retried. Expired credentials and every
//! other failure return on the first attempt.

use std::time::Duration;

use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Same attempt count, no sleeping. Used by tests and in-memory stores.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn run<T, F>(&self, op_name: &str, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut delay = self.initial_delay;
        let attempts = self.max_attempts.max(1);

        for attempt in 1..=attempts {
            match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{op_name} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::warn!("{op_name} failed on attempt {attempt}/{attempts}: {err}");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.backoff_factor)
                            .min(self.max_delay.as_secs_f64()),
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::Transient(format!(
            "{op_name}: retry attempts exhausted"
        )))
    }
}

/// Collapse a failed read into its empty value, keeping auth expiry visible.
pub fn degrade<T: Default>(result: Result<T, StoreError>, what: &str) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(StoreError::AuthExpired) => Err(StoreError::AuthExpired),
        Err(err) => {
            tracing::warn!("{what} unavailable, continuing without it: {err}");
            Ok(T::default())
        }
    }
}

/// Log and drop the outcome of a best-effort write.
pub fn best_effort<T>(result: Result<T, StoreError>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("{what} failed (ignored): {err}");
            None
        }
    }
}
