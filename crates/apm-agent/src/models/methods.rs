// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use super::date_id;
use crate::ntp::ClockSync;
use crate::trace::BuiltTrace;
use crate::tracer_store_service::TracerStoreHandle;

/// Per-method averages of one minute.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodMetrics {
    pub count: u64,
    pub errors: u64,
    pub wait: f64,
    pub db: f64,
    pub http: f64,
    pub email: f64,
    #[serde(rename = "async")]
    pub async_: f64,
    pub compute: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteMethodMetrics {
    pub start_time: i64,
    pub methods: BTreeMap<String, MethodMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodsPayload {
    pub method_metrics: Vec<MinuteMethodMetrics>,
    pub method_requests: Vec<BuiltTrace>,
}

#[derive(Debug, Default)]
struct MethodSums {
    count: u64,
    errors: u64,
    wait: i64,
    db: i64,
    http: i64,
    email: i64,
    async_: i64,
    compute: i64,
    total: i64,
}

impl MethodSums {
    fn add(&mut self, trace: &BuiltTrace) {
        let metrics = &trace.metrics;
        self.count += 1;
        if trace.errored {
            self.errors += 1;
        }
        self.wait += metrics.category("wait");
        self.db += metrics.category("db");
        self.http += metrics.category("http");
        self.email += metrics.category("email");
        self.async_ += metrics.category("async");
        self.compute += metrics.compute;
        self.total += metrics.total;
    }

    fn average(&self) -> MethodMetrics {
        let count = self.count.max(1) as f64;
        MethodMetrics {
            count: self.count,
            errors: self.errors,
            wait: self.wait as f64 / count,
            db: self.db as f64 / count,
            http: self.http as f64 / count,
            email: self.email as f64 / count,
            async_: self.async_ as f64 / count,
            compute: self.compute as f64 / count,
            total: self.total as f64 / count,
        }
    }
}

#[derive(Debug)]
struct Minute {
    start_time: i64,
    methods: BTreeMap<String, MethodSums>,
}

/// Method call aggregates plus the sampled method traces.
#[derive(Clone)]
pub struct MethodsModel {
    metrics_by_minute: Arc<Mutex<BTreeMap<i64, Minute>>>,
    store: TracerStoreHandle,
}

impl MethodsModel {
    pub fn new(store: TracerStoreHandle) -> Self {
        Self {
            metrics_by_minute: Arc::new(Mutex::new(BTreeMap::new())),
            store,
        }
    }

    /// Folds a built method trace into the minute it started in and offers
    /// it to the trace store.
    pub fn process_method(&self, trace: BuiltTrace) {
        {
            #[allow(clippy::expect_used)]
            let mut minutes = self.metrics_by_minute.lock().expect("lock poisoned");
            let minute = minutes.entry(date_id(trace.at)).or_insert_with(|| Minute {
                start_time: trace.at,
                methods: BTreeMap::new(),
            });
            minute
                .methods
                .entry(trace.name.clone())
                .or_default()
                .add(&trace);
        }

        if let Err(e) = self.store.add_trace(trace) {
            error!("Failed to hand method trace to the trace store: {}", e);
        }
    }

    pub async fn build_payload(&self, clock: &ClockSync) -> MethodsPayload {
        let minutes = {
            #[allow(clippy::expect_used)]
            let mut minutes = self.metrics_by_minute.lock().expect("lock poisoned");
            std::mem::take(&mut *minutes)
        };

        let method_metrics: Vec<MinuteMethodMetrics> = minutes
            .into_values()
            .map(|minute| MinuteMethodMetrics {
                start_time: clock.sync_time(minute.start_time),
                methods: minute
                    .methods
                    .iter()
                    .map(|(name, sums)| (name.clone(), sums.average()))
                    .collect(),
            })
            .collect();

        let method_requests = self.store.collect_traces().await.unwrap_or_else(|e| {
            error!("Unable to collect method traces: {}", e);
            Vec::new()
        });
        debug!(
            "built methods payload with {} minutes and {} traces",
            method_metrics.len(),
            method_requests.len()
        );

        MethodsPayload {
            method_metrics,
            method_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{EventData, Event, EventType, Trace, TraceType};
    use crate::tracer::Tracer;
    use crate::tracer_store::TracerStoreOptions;
    use crate::tracer_store_service::TracerStoreService;
    use serde_json::json;
    use std::time::Duration;

    fn model() -> (MethodsModel, TracerStoreHandle) {
        let (service, handle) = TracerStoreService::new(
            TracerStoreOptions::new(30, Duration::from_secs(60)).with_archive_every(5),
            Arc::new(ClockSync::unsynced()),
        );
        tokio::spawn(service.run());
        (MethodsModel::new(handle.clone()), handle)
    }

    fn completed(id: &str, start: i64, delay: i64) -> BuiltTrace {
        let mut trace = Trace::new("aa", id, TraceType::Method, "hello");
        trace.events = vec![
            Event::new(EventType::Start, start),
            Event::new(EventType::Complete, start + delay),
        ];
        Tracer::new().build_trace(trace).expect("valid trace")
    }

    fn errored(id: &str, message: &str, start: i64, delay: i64) -> BuiltTrace {
        let mut data = EventData::new();
        data.insert("error".to_string(), json!(message));
        let mut trace = Trace::new("aa", id, TraceType::Method, "hello");
        trace.events = vec![
            Event::new(EventType::Start, start),
            Event::new(EventType::Error, start + delay).with_data(data),
        ];
        Tracer::new().build_trace(trace).expect("valid trace")
    }

    #[tokio::test]
    async fn test_build_payload_simple() {
        let (model, handle) = model();
        model.process_method(completed("1", 100, 5));
        model.process_method(completed("2", 800, 10));

        let payload = model.build_payload(&ClockSync::unsynced()).await;
        assert_eq!(
            serde_json::to_value(&payload).expect("serialize"),
            json!({
                "methodMetrics": [{
                    "startTime": 100,
                    "methods": {
                        "hello": {
                            "count": 2,
                            "errors": 0,
                            "wait": 0.0,
                            "db": 0.0,
                            "http": 0.0,
                            "email": 0.0,
                            "async": 0.0,
                            "compute": 7.5,
                            "total": 7.5
                        }
                    }
                }],
                "methodRequests": []
            })
        );
        handle.shutdown().expect("Failed to shutdown");
    }

    #[tokio::test]
    async fn test_build_payload_with_errors() {
        let (model, handle) = model();
        model.process_method(completed("1", 100, 5));
        model.process_method(errored("2", "the-error", 800, 10));

        let payload = model.build_payload(&ClockSync::with_offset(10.0)).await;
        assert_eq!(payload.method_metrics.len(), 1);
        assert_eq!(payload.method_metrics[0].start_time, 110);
        let hello = &payload.method_metrics[0].methods["hello"];
        assert_eq!(hello.count, 2);
        assert_eq!(hello.errors, 1);
        assert_eq!(hello.total, 7.5);
        handle.shutdown().expect("Failed to shutdown");
    }

    #[tokio::test]
    async fn test_minutes_are_separated_and_drained() {
        let (model, handle) = model();
        model.process_method(completed("1", 1_000, 5));
        model.process_method(completed("2", 61_000, 5));

        let payload = model.build_payload(&ClockSync::unsynced()).await;
        let starts: Vec<i64> = payload
            .method_metrics
            .iter()
            .map(|minute| minute.start_time)
            .collect();
        assert_eq!(starts, vec![1_000, 61_000]);

        let empty = model.build_payload(&ClockSync::unsynced()).await;
        assert!(empty.method_metrics.is_empty());
        handle.shutdown().expect("Failed to shutdown");
    }

    #[tokio::test]
    async fn test_sampled_traces_are_attached() {
        let (model, handle) = model();
        model.process_method(completed("1", 100, 5));
        model.process_method(completed("2", 200, 50));
        handle.process_traces().expect("Failed to process");

        let payload = model.build_payload(&ClockSync::unsynced()).await;
        assert_eq!(payload.method_requests.len(), 1);
        assert_eq!(payload.method_requests[0].metrics.total, 50);
        handle.shutdown().expect("Failed to shutdown");
    }
}
