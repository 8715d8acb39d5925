//! Exponential backoff for registry calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RegistryError;

/// Retry policy for transient registry failures.
///
/// The first attempt is not counted as a retry: with the defaults a call is
/// tried once and then retried up to three times after 1s, 2s and 4s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Run `call` until it succeeds, fails with a non-transient error, or the
    /// retries are exhausted. `sleep` is invoked with each backoff delay.
    pub fn run<T>(
        &self,
        operation: &str,
        sleep: &dyn Fn(Duration),
        mut call: impl FnMut() -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut retry = 0;
        loop {
            match call() {
                Ok(value) => {
                    if retry > 0 {
                        tracing::info!(operation, retries = retry, "Registry call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    tracing::warn!(
                        operation,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient registry failure, retrying"
                    );
                    sleep(delay);
                    retry += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(operation, retries = retry, error = %e, "Registry retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn unavailable() -> RegistryError {
        RegistryError::Http {
            status: 503,
            body: "Service Unavailable".into(),
        }
    }

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_retries: 100,
            base_delay_ms: 1000,
        };
        assert_eq!(policy.delay_for(70), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn succeeds_after_three_transient_failures() {
        let policy = RetryPolicy::default();
        let slept = RefCell::new(Vec::new());
        let mut calls = 0;

        let result = policy.run(
            "worklist",
            &|d| slept.borrow_mut().push(d),
            || {
                calls += 1;
                if calls <= 3 {
                    Err(unavailable())
                } else {
                    Ok("ok")
                }
            },
        );

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls, 4);
        let slept = slept.into_inner();
        assert_eq!(
            slept,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        let total: Duration = slept.iter().sum();
        assert!(total >= Duration::from_secs(7));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
        };
        let mut calls = 0;

        let result: Result<(), _> = policy.run("referral", &|_| {}, || {
            calls += 1;
            Err(RegistryError::Http {
                status: 429,
                body: String::new(),
            })
        });

        assert!(matches!(result, Err(RegistryError::Http { status: 429, .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_transient_errors_return_immediately() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let slept = RefCell::new(0);

        let result: Result<(), _> = policy.run(
            "referral",
            &|_| *slept.borrow_mut() += 1,
            || {
                calls += 1;
                Err(RegistryError::Http {
                    status: 400,
                    body: "bad request".into(),
                })
            },
        );

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert_eq!(*slept.borrow(), 0);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"maxRetries": 5}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 1000);
    }
}
