// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backoff schedules and the timer abstraction driving retry chains.
//!
//! Retry chains never call `tokio::time::sleep` directly. They go through a
//! [`Sleeper`] so tests can record the requested delays instead of waiting
//! on the wall clock.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_EXPONENT: f64 = 2.2;

/// Exponential backoff shape.
///
/// The timeout for attempt `count` is `min_timeout` while `count < min_count`,
/// otherwise `min(max_timeout, base_timeout * exponent^count)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryOptions {
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub min_count: u32,
    pub min_timeout: Duration,
    pub exponent: f64,
}

impl RetryOptions {
    pub fn new(base_timeout: Duration, max_timeout: Duration, min_count: u32) -> Self {
        Self {
            base_timeout,
            max_timeout,
            min_count,
            min_timeout: Duration::ZERO,
            exponent: DEFAULT_EXPONENT,
        }
    }

    /// Initial clock sync: first attempt immediate, then 20s growing to 60s.
    pub fn initial_sync() -> Self {
        Self::new(Duration::from_secs(20), Duration::from_secs(60), 1)
    }

    /// Periodic resync: 60s growing to 10 minutes.
    pub fn resync() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600), 0)
    }

    /// Payload delivery: first attempt immediate, then 5s growing to 60s.
    pub fn send() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60), 1)
    }

    pub fn timeout(&self, count: u32) -> Duration {
        if count < self.min_count {
            return self.min_timeout;
        }
        let base_ms = self.base_timeout.as_millis() as f64;
        let scaled = base_ms * self.exponent.powi(count.min(i32::MAX as u32) as i32);
        let capped = scaled.min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(capped.max(0.0).round() as u64)
    }
}

/// Source of delays for retry chains.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Waits for `duration` unless `cancel` fires first.
/// Returns false when the wait was cancelled.
pub async fn sleep_or_cancel(
    sleeper: &dyn Sleeper,
    duration: Duration,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = sleeper.sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
