// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::ntp::ClockSync;
use crate::trace::BuiltTrace;
use crate::tracer_store::{TracerStore, TracerStoreOptions};

#[derive(Debug)]
pub enum TracerStoreCommand {
    AddTrace(Box<BuiltTrace>),
    ProcessTraces,
    CollectTraces(oneshot::Sender<Vec<BuiltTrace>>),
    Shutdown,
}

/// Cloneable front of a [`TracerStoreService`].
#[derive(Clone)]
pub struct TracerStoreHandle {
    tx: mpsc::UnboundedSender<TracerStoreCommand>,
    interval: Duration,
    ticker: Arc<Mutex<Option<CancellationToken>>>,
}

impl TracerStoreHandle {
    pub fn add_trace(
        &self,
        trace: BuiltTrace,
    ) -> Result<(), mpsc::error::SendError<TracerStoreCommand>> {
        self.tx.send(TracerStoreCommand::AddTrace(Box::new(trace)))
    }

    pub fn process_traces(&self) -> Result<(), mpsc::error::SendError<TracerStoreCommand>> {
        self.tx.send(TracerStoreCommand::ProcessTraces)
    }

    pub async fn collect_traces(&self) -> Result<Vec<BuiltTrace>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(TracerStoreCommand::CollectTraces(response_tx))
            .map_err(|e| format!("Failed to send collect_traces command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive collect_traces response: {}", e))
    }

    /// Starts closing an interval every `interval`. Returns `None` when the
    /// ticker is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        #[allow(clippy::expect_used)]
        let mut guard = self.ticker.lock().expect("lock poisoned");
        if guard.is_some() {
            return None;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let tx = self.tx.clone();
        let period = self.interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(TracerStoreCommand::ProcessTraces).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Tracer store ticker stopped");
        }))
    }

    /// Stops the ticker. Accumulated traces stay in the store.
    pub fn stop(&self) {
        #[allow(clippy::expect_used)]
        let cancel = self.ticker.lock().expect("lock poisoned").take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<TracerStoreCommand>> {
        self.stop();
        self.tx.send(TracerStoreCommand::Shutdown)
    }
}

/// Owns a [`TracerStore`] and serializes every access to it.
pub struct TracerStoreService {
    store: TracerStore,
    clock: Arc<ClockSync>,
    rx: mpsc::UnboundedReceiver<TracerStoreCommand>,
}

impl TracerStoreService {
    pub fn new(options: TracerStoreOptions, clock: Arc<ClockSync>) -> (Self, TracerStoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            store: TracerStore::new(options),
            clock,
            rx,
        };
        let handle = TracerStoreHandle {
            tx,
            interval: options.interval,
            ticker: Arc::new(Mutex::new(None)),
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Tracer store service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                TracerStoreCommand::AddTrace(trace) => self.store.add_trace(*trace),

                TracerStoreCommand::ProcessTraces => self.store.process_traces(),

                TracerStoreCommand::CollectTraces(response_tx) => {
                    let traces = self.store.collect_traces(&self.clock);
                    if response_tx.send(traces).is_err() {
                        error!("Failed to send collect_traces response - receiver dropped");
                    }
                }

                TracerStoreCommand::Shutdown => {
                    debug!("Tracer store service shutting down");
                    break;
                }
            }
        }

        debug!("Tracer store service stopped");
    }
}
