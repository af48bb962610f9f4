// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff and Retry Primitives
//!
//! Transport-agnostic helpers used to space out reconnect attempts, bound
//! operations in time and wait for quiescence. All waits are tokio timers,
//! never thread blocks.

use crate::errors::{BunnyError, Result};
use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::debug;

const BACKOFF_BASE_MS: u64 = 25;
const BACKOFF_CEILING_MS: u64 = 10_000;
const BACKOFF_JITTER_MS: u64 = 2_000;

/// Delay before the given reconnect attempt.
///
/// Grows as `(2^attempt - 1) * 25` ms and is capped at ten seconds; the
/// jitter is added after the cap so the ceiling case lands in
/// `[10000, 12000)` ms.
pub fn exponential_backoff(attempt: u32) -> Duration {
    let factor = (1_u64 << attempt.min(32)) - 1;
    let doubled = BACKOFF_BASE_MS.saturating_mul(factor);
    let capped = doubled.min(BACKOFF_CEILING_MS);
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(capped + jitter)
}

/// Interval that ignores the attempt number.
pub fn fixed(interval: Duration) -> impl Fn(u32) -> Duration {
    move |_| interval
}

/// Never stops early.
pub fn never(_: &BunnyError) -> bool {
    false
}

/// Invokes `operation` until it succeeds, at most `max_attempts` times.
///
/// `interval` receives the number of the attempt that just failed. When
/// `should_stop` returns true for an error the loop ends immediately with
/// [`BunnyError::FilterTripped`]; exhausting the attempts yields
/// [`BunnyError::AttemptsExceeded`].
pub async fn retry<T, F, Fut, I, S>(
    mut operation: F,
    interval: I,
    max_attempts: usize,
    should_stop: S,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    I: Fn(u32) -> Duration,
    S: Fn(&BunnyError) -> bool,
{
    let mut attempt: u32 = 0;

    while (attempt as usize) < max_attempts {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if should_stop(&err) => {
                debug!(error = err.to_string(), attempt, "retry stopped by filter");
                return Err(BunnyError::FilterTripped(err.to_string()));
            }
            Err(err) => {
                debug!(error = err.to_string(), attempt, max_attempts, "attempt failed");
                if (attempt as usize) < max_attempts {
                    tokio::time::sleep(interval(attempt)).await;
                }
            }
        }
    }

    Err(BunnyError::AttemptsExceeded(max_attempts))
}

/// Races `operation` against a deadline.
///
/// On expiry the operation future is dropped at its current suspension point;
/// callers must treat a timeout as "result unknown".
pub async fn timeout_bound<T, Fut>(operation: Fut, duration: Duration) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(BunnyError::Timeout(duration)),
    }
}

/// Invokes `predicate` every `interval` until it yields true, propagating its errors.
pub async fn poll_until<F, Fut>(mut predicate: F, interval: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    loop {
        if predicate().await? {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn backoff_first_attempt_is_near_base() {
        for _ in 0..200 {
            let d = exponential_backoff(1).as_millis() as u64;
            assert!((25..25 + 2_000).contains(&d), "{d}");
        }
    }

    #[test]
    fn backoff_caps_before_jitter() {
        for _ in 0..200 {
            let d = exponential_backoff(9).as_millis() as u64;
            assert!((10_000..12_000).contains(&d), "{d}");
        }
        let huge = exponential_backoff(u32::MAX).as_millis() as u64;
        assert!((10_000..12_000).contains(&huge));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let value = retry(
            move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(BunnyError::NoConnection)
                    } else {
                        Ok(attempt)
                    }
                }
            },
            fixed(Duration::from_millis(10)),
            5,
            never,
        )
        .await;

        assert_eq!(value, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let result: Result<()> = retry(
            |_| async { Err(BunnyError::NoChannel) },
            fixed(Duration::from_millis(5)),
            4,
            never,
        )
        .await;

        assert_eq!(result, Err(BunnyError::AttemptsExceeded(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_when_filter_trips() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(BunnyError::NoRouteKey) }
            },
            fixed(Duration::from_millis(5)),
            10,
            |err| matches!(err, BunnyError::NoRouteKey),
        )
        .await;

        assert!(matches!(result, Err(BunnyError::FilterTripped(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bound_reports_expiry() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        };
        let result = timeout_bound(slow, Duration::from_millis(100)).await;
        assert_eq!(result, Err(BunnyError::Timeout(Duration::from_millis(100))));

        let fast = timeout_bound(async { Ok(2) }, Duration::from_millis(100)).await;
        assert_eq!(fast, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_waits_for_predicate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        poll_until(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n >= 3) }
            },
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let failed = poll_until(|| async { Err(BunnyError::NoChannel) }, Duration::from_millis(1)).await;
        assert_eq!(failed, Err(BunnyError::NoChannel));
    }
}
