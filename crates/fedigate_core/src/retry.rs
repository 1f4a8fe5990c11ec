/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Result};
use rand::{thread_rng, Rng};
use std::future::Future;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
    /// Applied to each attempt separately.
    pub attempt_timeout: Duration,
}

/// Runs `op` until it succeeds or the attempts are used up. A timed-out
/// attempt counts as a failure. Returns the last error.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.attempts.clamp(1, 10);
    let mut backoff = policy.base_backoff;
    let mut last_err = anyhow!("{what}: no attempt made");
    for attempt in 0..max_attempts {
        match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => last_err = e,
            Err(_) => {
                last_err = anyhow!("{what}: timed out after {}ms", policy.attempt_timeout.as_millis())
            }
        }
        tracing::debug!(attempt = attempt + 1, max_attempts, "{what} failed: {last_err:#}");
        if attempt + 1 < max_attempts {
            sleep_with_jitter(backoff).await;
            backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
        }
    }
    Err(last_err)
}

async fn sleep_with_jitter(base: Duration) {
    let cap = base.as_millis().min(200) as u64;
    let jitter_ms: u64 = thread_rng().gen_range(0..=cap);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let v = retry_with_backoff(fast(3), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("boom"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(fast(2), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow!("still down"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("still down"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let mut policy = fast(1);
        policy.attempt_timeout = Duration::from_millis(10);
        let err = retry_with_backoff(policy, "enqueue", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
