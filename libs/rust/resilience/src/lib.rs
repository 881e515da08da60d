//! Retry with exponential backoff for operations the caller chooses to repeat.
use std::time::Duration;
use futures::Future;
use tracing::{warn, debug};
use opentelemetry::{global, metrics::Counter, KeyValue};
use once_cell::sync::Lazy;

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("carsight-resilience")
        .u64_counter("carsight_resilience_retry_attempts_total")
        .with_description("Total retry attempts executed")
        .init()
});

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { attempts: 3, base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(10) } }
}

impl RetryPolicy {
    pub fn new(attempts: usize, base_delay: Duration) -> Self { Self { attempts: attempts.max(1), base_delay, ..Default::default() } }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_delay)
    }
}

/// Runs `op` up to `policy.attempts` times, returning the first success or the
/// last error. `label` tags the attempt counter and log lines.
pub async fn retry_async<F, Fut, T, E>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        RETRY_ATTEMPTS.add(1, &[KeyValue::new("op", label.to_string())]);
        match op(attempt).await {
            Ok(v) => {
                if attempt > 0 { debug!(op = label, attempt, "succeeded after retry"); }
                return Ok(v);
            }
            Err(e) if attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(op = label, attempt, error = %e, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_eventual_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let res: Result<u32, &'static str> = retry_async(&policy, "probe", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("e") } else { Ok(42) } }
        }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_with_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let res: Result<(), String> = retry_async(&policy, "probe", |i| async move { Err(format!("fail {i}")) }).await;
        assert_eq!(res.unwrap_err(), "fail 1");
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy { attempts: 10, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(250) };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(5), Duration::from_millis(250));
    }
}
