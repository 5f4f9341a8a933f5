//! Retry helpers shared by the provider-facing code paths.
//!
//! - [`retry_with_backoff`] retries up to a fixed number of attempts with
//!   fixed or exponential backoff, asking the caller which errors are
//!   transient.
//! - [`retry_until_deadline`] polls until an operation succeeds or a
//!   wall-clock deadline passes.

use std::{future::Future, time::Duration};

use anyhow::Result;
use tracing::{debug, warn};

/// Backoff strategy for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed(Duration),
    /// Delay doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

/// Retry an operation up to `max_retries` times.
///
/// Total attempts = 1 + `max_retries`. Errors for which `is_retryable`
/// returns false are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut delay = backoff.initial_delay();
    let mut attempt = 0;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_retries {
                    return Err(e);
                }
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}

/// Retry an async operation until it succeeds or `timeout` elapses.
pub async fn retry_until_deadline<T, F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_err: Option<anyhow::Error> = None;

    loop {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "timeout {} after {:?}: {}",
                description,
                timeout,
                last_err.as_ref().map(|e| e.to_string()).unwrap_or_default()
            );
        }

        match attempt().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                debug!(error = %e, description = %description, "attempt failed, polling again");
                last_err = Some(e);
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn test_backoff_succeeds_after_retries() {
        let count = Arc::new(AtomicU32::new(0));
        let result: std::result::Result<u32, String> = retry_with_backoff(
            3,
            Backoff::Fixed(Duration::from_millis(1)),
            "test op",
            || {
                let count = count.clone();
                async move {
                    let c = count.fetch_add(1, Ordering::SeqCst) + 1;
                    if c < 3 {
                        Err(format!("fail {c}"))
                    } else {
                        Ok(c)
                    }
                }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backoff_exhausts_retries() {
        let count = Arc::new(AtomicU32::new(0));
        let result: std::result::Result<u32, String> = retry_with_backoff(
            2,
            Backoff::Exponential {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
            "test op",
            || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err("capacity".to_string())
                }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap_err(), "capacity");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_stops_on_permanent_error() {
        let count = Arc::new(AtomicU32::new(0));
        let result: std::result::Result<u32, String> = retry_with_backoff(
            5,
            Backoff::Fixed(Duration::from_millis(1)),
            "test op",
            || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden".to_string())
                }
            },
            |e: &String| e != "forbidden",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        let second = backoff.next_delay(backoff.initial_delay());
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(backoff.next_delay(second), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let result: Result<u32> = retry_until_deadline(
            Duration::from_millis(30),
            Duration::from_millis(5),
            "waiting for instance",
            || async { anyhow::bail!("still pending") },
        )
        .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timeout"));
        assert!(err.contains("waiting for instance"));
    }
}
