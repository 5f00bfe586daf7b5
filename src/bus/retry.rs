//! Bounded delivery retry with exponential backoff
//!
//! A failing handler is retried a fixed number of times. Backoff sleeps are
//! cut short when the consumer is asked to stop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry behaviour for message delivery
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (not including the initial attempt)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add random jitter to spread retries from many consumers
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Short fixed-size backoff, for tests and local tooling
    pub fn quick(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Calculate backoff duration for a given attempt (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let final_duration = if self.jitter {
            // Add 0-25% jitter
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(final_duration.max(0.0))
    }
}

/// Pseudo-random value in 0.0..1.0 taken from the clock
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// How a retried delivery ended
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The handler accepted the message
    Delivered { attempts: u32 },
    /// Every attempt failed; carries the last error
    Exhausted { attempts: u32, error: anyhow::Error },
    /// Stop was requested while waiting to retry
    Interrupted { attempts: u32 },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Resolves once `true` is published on the shutdown channel or the sender
/// is dropped
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run `operation` until it succeeds, the policy is exhausted, or shutdown
/// is requested
pub async fn deliver_with_retry<F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    shutdown: &mut watch::Receiver<bool>,
    mut operation: F,
) -> DeliveryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(()) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Delivery succeeded after retry"
                    );
                }
                return DeliveryOutcome::Delivered {
                    attempts: attempt + 1,
                };
            }
            Err(error) => {
                if attempt >= policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %error,
                        "Delivery failed, retries exhausted"
                    );
                    return DeliveryOutcome::Exhausted {
                        attempts: attempt + 1,
                        error,
                    };
                }

                let backoff = policy.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Delivery failed, retrying"
                );

                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = shutdown_requested(shutdown) => {
                        debug!(operation = operation_name, "Retry interrupted by shutdown");
                        return DeliveryOutcome::Interrupted {
                            attempts: attempt + 1,
                        };
                    }
                }
                attempt += 1;
            }
        }
    }
}
