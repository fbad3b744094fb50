// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Clock synchronization against the collector's time endpoint.
//!
//! Every timestamp the agent records is local. Before delivery it is shifted
//! by the offset estimated here so that data coming from independently
//! clocked processes lines up on the collector's clock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::NtpError;
use crate::http_utils::{build_client, join_url};
use crate::retry::{sleep_or_cancel, RetryOptions, Sleeper, TokioSleeper};

const SYNC_PATH: &str = "simplentp/sync";
const MAX_SYNC_ATTEMPTS: u32 = 5;
const TIME_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Local wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Something that can report the reference clock.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Reference time in epoch milliseconds.
    async fn server_time(&self) -> Result<i64, NtpError>;
}

/// `GET {endpoint}/simplentp/sync`, answering with a plain-text integer.
#[derive(Debug, Clone)]
pub struct HttpTimeSource {
    client: reqwest::Client,
    url: String,
}

impl HttpTimeSource {
    pub fn new(endpoint: &str, proxy_url: Option<&str>) -> Result<Self, NtpError> {
        let client = build_client(proxy_url, TIME_REQUEST_TIMEOUT)?;
        Ok(Self {
            client,
            url: join_url(endpoint, SYNC_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn server_time(&self) -> Result<i64, NtpError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NtpError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        parse_server_time(&body)
    }
}

/// Parses the leading integer of the body, ignoring surrounding whitespace.
pub fn parse_server_time(body: &str) -> Result<i64, NtpError> {
    let trimmed = body.trim();
    let digits_end = trimmed
        .char_indices()
        .find(|(index, ch)| !(ch.is_ascii_digit() || (*index == 0 && *ch == '-')))
        .map_or(trimmed.len(), |(index, _)| index);
    trimmed[..digits_end]
        .parse::<i64>()
        .map_err(|_| NtpError::Parse(body.to_string()))
}

/// Result of one call to [`ClockSync::sync`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// Offset updated to the contained value.
    Synced(f64),
    /// All attempts failed; the previous offset is kept.
    Exhausted,
    /// Cancelled while waiting for the next attempt.
    Cancelled,
}

/// Shared clock offset plus the retry chain that keeps it fresh.
pub struct ClockSync {
    offset_bits: AtomicU64,
    synced: AtomicBool,
    resync_count: AtomicU32,
    source: Arc<dyn TimeSource>,
    sleeper: Arc<dyn Sleeper>,
    initial_retry: RetryOptions,
    resync_retry: RetryOptions,
    cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ClockSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSync")
            .field("offset", &self.offset())
            .field("synced", &self.is_synced())
            .finish()
    }
}

impl ClockSync {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self::with_schedule(
            source,
            Arc::new(TokioSleeper),
            RetryOptions::initial_sync(),
            RetryOptions::resync(),
        )
    }

    pub fn with_schedule(
        source: Arc<dyn TimeSource>,
        sleeper: Arc<dyn Sleeper>,
        initial_retry: RetryOptions,
        resync_retry: RetryOptions,
    ) -> Self {
        Self {
            offset_bits: AtomicU64::new(0f64.to_bits()),
            synced: AtomicBool::new(false),
            resync_count: AtomicU32::new(0),
            source,
            sleeper,
            initial_retry,
            resync_retry,
            cancel: Mutex::new(None),
        }
    }

    /// Clock that never syncs; the offset stays at zero.
    pub fn unsynced() -> Self {
        Self::new(Arc::new(NeverSynced))
    }

    #[cfg(test)]
    pub(crate) fn with_offset(offset: f64) -> Self {
        let clock = Self::unsynced();
        clock.store_offset(offset);
        clock
    }

    /// Reference minus local, in milliseconds.
    pub fn offset(&self) -> f64 {
        f64::from_bits(self.offset_bits.load(Ordering::Acquire))
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Current time on the reference clock.
    pub fn get_time(&self) -> i64 {
        now_ms() + self.offset().round() as i64
    }

    /// Shifts an already captured local timestamp onto the reference clock.
    pub fn sync_time(&self, local_time: i64) -> i64 {
        local_time + self.offset().ceil() as i64
    }

    fn store_offset(&self, offset: f64) {
        self.offset_bits.store(offset.to_bits(), Ordering::Release);
        self.synced.store(true, Ordering::Release);
    }

    /// One measurement: a warm-up request whose latency is discarded, then a
    /// request bracketed by local timestamps. The server is assumed to have
    /// answered at the midpoint.
    async fn measure_offset(&self) -> Result<f64, NtpError> {
        self.source.server_time().await?;

        let t0 = now_ms();
        let server_time = self.source.server_time().await?;
        let t1 = now_ms();

        let midpoint = t0 as f64 + (t1 - t0) as f64 / 2.0;
        Ok(server_time as f64 - midpoint)
    }

    /// Up to five measurement rounds on the initial backoff schedule.
    pub async fn sync(&self, cancel: &CancellationToken) -> SyncOutcome {
        debug!("init sync");
        for attempt in 0..MAX_SYNC_ATTEMPTS {
            let delay = self.initial_retry.timeout(attempt);
            if !sleep_or_cancel(self.sleeper.as_ref(), delay, cancel).await {
                return SyncOutcome::Cancelled;
            }

            debug!("attempt time sync with server {attempt}");
            match self.measure_offset().await {
                Ok(offset) => {
                    self.store_offset(offset);
                    debug!("successfully updated diff value {offset}");
                    return SyncOutcome::Synced(offset);
                }
                Err(e) => debug!("time sync attempt {attempt} failed: {e}"),
            }
        }
        warn!("maximum time sync retries reached");
        SyncOutcome::Exhausted
    }

    /// Drives `sync` forever: after every round, successful or not, waits on
    /// the resync schedule and starts over.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if self.sync(&cancel).await == SyncOutcome::Cancelled {
                break;
            }
            let count = self.resync_count.fetch_add(1, Ordering::AcqRel);
            let delay = self.resync_retry.timeout(count);
            debug!("next time sync in {delay:?}");
            if !sleep_or_cancel(self.sleeper.as_ref(), delay, &cancel).await {
                break;
            }
        }
        debug!("time sync stopped");
    }

    /// Spawns the sync chain. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        #[allow(clippy::expect_used)]
        let mut guard = self.cancel.lock().expect("lock poisoned");
        if guard.is_some() {
            return None;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        info!("starting time sync");
        let clock = Arc::clone(self);
        Some(tokio::spawn(async move { clock.run(cancel).await }))
    }

    /// Cancels pending retries. An attempt already on the wire completes.
    pub fn stop(&self) {
        #[allow(clippy::expect_used)]
        let cancel = self.cancel.lock().expect("lock poisoned").take();
        if let Some(cancel) = cancel {
            debug!("stopping time sync");
            cancel.cancel();
        }
    }
}

struct NeverSynced;

#[async_trait]
impl TimeSource for NeverSynced {
    async fn server_time(&self) -> Result<i64, NtpError> {
        Err(NtpError::Parse(String::new()))
    }
}
