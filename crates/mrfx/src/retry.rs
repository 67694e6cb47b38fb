//! 🔁 retry.rs: one retry policy to rule the fetches, the uploads, and the multipart parts.
//!
//! 📐 delay(attempt) = base_delay × backoff^(attempt − 1), capped at max_delay.
//! Attempt 1 is the first try. `max_retries = 3` means up to 4 attempts total.
//!
//! The loop lives HERE and only here. Callers hand in a closure that performs one
//! attempt and classifies its own failure as transient or permanent. Nobody else
//! gets to write `loop { sleep }`. That's the rule. The duck enforces it. 🦆

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{AttemptError, RetryError};

/// 🔧 Retry knobs, straight from the `[retry]` table.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff: default_backoff(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// ⏳ The pure retry policy. Clone it freely, it's four numbers in a trench coat.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    backoff: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            // -- 🔒 a backoff below 1.0 would make the waits shrink. that's not backoff, that's impatience.
            backoff: config.backoff.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }

    /// Total attempts allowed, first try included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// How long to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 🎰 Run `attempt_fn` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// The closure receives the 1-based attempt number. Returns the value plus the
    /// number of attempts it took, because the summary table likes to count.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
    ) -> Result<(T, u32), RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "✅ succeeded after retrying");
                    }
                    return Ok((value, attempt));
                }
                Err(AttemptError::Permanent(last_error)) => {
                    return Err(RetryError::Permanent {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last_error,
                    });
                }
                Err(AttemptError::Transient(last_error)) => {
                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{last_error:#}"),
                        "🔁 attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            base_delay_ms: 1,
            backoff: 1.5,
            max_delay_ms: 5,
        })
    }

    #[test]
    fn the_one_where_the_backoff_grows_by_one_point_five_and_then_hits_the_ceiling() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_retries: 5,
            base_delay_ms: 1_000,
            backoff: 1.5,
            max_delay_ms: 2_000,
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(9), Duration::from_millis(2_000));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[tokio::test]
    async fn the_one_where_third_time_is_the_charm() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (value, attempts) = quick_policy(3)
            .run("flaky", move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(AttemptError::transient(anyhow::anyhow!("nope")))
                    } else {
                        Ok("finally")
                    }
                }
            })
            .await
            .expect("💀 three attempts fit inside a budget of four");
        assert_eq!(value, "finally");
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn the_one_where_the_budget_runs_dry() {
        let err = quick_policy(2)
            .run("doomed", |_| async {
                Err::<(), _>(AttemptError::transient(anyhow::anyhow!("still down")))
            })
            .await
            .expect_err("💀 an always-failing op cannot succeed");
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn the_one_where_a_permanent_failure_does_not_get_a_second_date() {
        let err = quick_policy(5)
            .run("forbidden", |_| async {
                Err::<(), _>(AttemptError::permanent(anyhow::anyhow!("403")))
            })
            .await
            .expect_err("💀 permanent means permanent");
        assert!(matches!(err, RetryError::Permanent { attempts: 1, .. }));
    }
}
