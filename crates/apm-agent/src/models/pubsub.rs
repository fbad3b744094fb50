// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use super::date_id;
use crate::ntp::{now_ms, ClockSync};
use crate::trace::BuiltTrace;
use crate::tracer_store_service::TracerStoreHandle;

/// Name reported for subscriptions started without a publication name.
pub const NULL_PUBLICATION: &str = "null(autopublish)";

fn publication_name(name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => NULL_PUBLICATION.to_string(),
    }
}

fn subscription_key(session_id: &str, sub_id: &str) -> String {
    format!("{session_id}::{sub_id}")
}

/// Per-publication figures of one minute. `res_time` is averaged over new
/// subscriptions and `life_time` over unsubscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PubMetrics {
    pub subs: u64,
    pub unsubs: u64,
    pub res_time: f64,
    pub life_time: f64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinutePubMetrics {
    pub start_time: i64,
    pub pubs: BTreeMap<String, PubMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubPayload {
    pub pub_metrics: Vec<MinutePubMetrics>,
    pub pub_requests: Vec<BuiltTrace>,
}

#[derive(Debug, Default)]
struct PubSums {
    subs: u64,
    unsubs: u64,
    res_time: i64,
    life_time: i64,
    errors: u64,
}

fn average(sum: i64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    sum as f64 / count as f64
}

impl PubSums {
    fn average(&self) -> PubMetrics {
        PubMetrics {
            subs: self.subs,
            unsubs: self.unsubs,
            res_time: average(self.res_time, self.subs),
            life_time: average(self.life_time, self.unsubs),
            errors: self.errors,
        }
    }
}

#[derive(Debug)]
struct MinutePubs {
    start_time: i64,
    pubs: BTreeMap<String, PubSums>,
}

#[derive(Debug)]
struct SubscriptionState {
    start_time: i64,
    ready_tracked: bool,
}

#[derive(Debug, Default)]
struct PubsubState {
    metrics_by_minute: BTreeMap<i64, MinutePubs>,
    subscriptions: HashMap<String, SubscriptionState>,
    session_start: HashMap<String, i64>,
}

impl PubsubState {
    fn metrics(&mut self, timestamp: i64, publication: String) -> &mut PubSums {
        self.metrics_by_minute
            .entry(date_id(timestamp))
            .or_insert_with(|| MinutePubs {
                start_time: timestamp,
                pubs: BTreeMap::new(),
            })
            .pubs
            .entry(publication)
            .or_default()
    }
}

/// Subscription aggregates plus the sampled subscription traces.
#[derive(Clone)]
pub struct PubsubModel {
    state: Arc<Mutex<PubsubState>>,
    store: TracerStoreHandle,
}

impl PubsubModel {
    pub fn new(store: TracerStoreHandle) -> Self {
        Self {
            state: Arc::new(Mutex::new(PubsubState::default())),
            store,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut PubsubState) -> T) -> T {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        f(&mut state)
    }

    pub fn track_sub(&self, session_id: &str, sub_id: &str, name: Option<&str>) {
        self.track_sub_at(session_id, sub_id, name, now_ms());
    }

    pub(crate) fn track_sub_at(&self, session_id: &str, sub_id: &str, name: Option<&str>, at: i64) {
        debug!("SUB: {session_id} {sub_id} {name:?}");
        self.with_state(|state| {
            state.metrics(at, publication_name(name)).subs += 1;
            state.subscriptions.insert(
                subscription_key(session_id, sub_id),
                SubscriptionState {
                    start_time: at,
                    ready_tracked: false,
                },
            );
            state
                .session_start
                .entry(session_id.to_string())
                .or_insert(at);
        });
    }

    /// Unnamed subscriptions are started by the server and have no tracked
    /// state; their life time is measured from the first subscription of the
    /// session and they do not count as unsubscriptions.
    pub fn track_unsub(&self, session_id: &str, sub_id: &str, name: Option<&str>) {
        self.track_unsub_at(session_id, sub_id, name, now_ms());
    }

    pub(crate) fn track_unsub_at(
        &self,
        session_id: &str,
        sub_id: &str,
        name: Option<&str>,
        at: i64,
    ) {
        debug!("UNSUB: {session_id} {sub_id}");
        self.with_state(|state| {
            let key = subscription_key(session_id, sub_id);
            let start_time = match state.subscriptions.remove(&key) {
                Some(subscription) => Some(subscription.start_time),
                None => state.session_start.get(session_id).copied(),
            };
            let Some(start_time) = start_time else {
                return;
            };
            let metrics = state.metrics(at, publication_name(name));
            if name.is_some() {
                metrics.unsubs += 1;
            }
            metrics.life_time += at - start_time;
        });
    }

    /// Response time is only counted for the first ready of a subscription.
    pub fn track_ready(
        &self,
        session_id: &str,
        sub_id: &str,
        name: Option<&str>,
        trace: Option<BuiltTrace>,
    ) {
        self.track_ready_at(session_id, sub_id, name, trace, now_ms());
    }

    pub(crate) fn track_ready_at(
        &self,
        session_id: &str,
        sub_id: &str,
        name: Option<&str>,
        trace: Option<BuiltTrace>,
        at: i64,
    ) {
        debug!("READY: {session_id} {sub_id}");
        self.with_state(|state| {
            let key = subscription_key(session_id, sub_id);
            let response_time = match state.subscriptions.get_mut(&key) {
                Some(subscription) if !subscription.ready_tracked => {
                    subscription.ready_tracked = true;
                    Some(at - subscription.start_time)
                }
                _ => None,
            };
            let metrics = state.metrics(at, publication_name(name));
            if let Some(response_time) = response_time {
                metrics.res_time += response_time;
            }
        });
        self.add_trace(trace);
    }

    pub fn track_error(
        &self,
        session_id: &str,
        sub_id: &str,
        name: Option<&str>,
        trace: Option<BuiltTrace>,
    ) {
        self.track_error_at(session_id, sub_id, name, trace, now_ms());
    }

    pub(crate) fn track_error_at(
        &self,
        session_id: &str,
        sub_id: &str,
        name: Option<&str>,
        trace: Option<BuiltTrace>,
        at: i64,
    ) {
        debug!("ERROR: {session_id} {sub_id}");
        self.with_state(|state| state.metrics(at, publication_name(name)).errors += 1);
        self.add_trace(trace);
    }

    /// Forgets the subscriptions of a closed session.
    pub fn end_session(&self, session_id: &str) {
        let prefix = subscription_key(session_id, "");
        self.with_state(|state| {
            state.session_start.remove(session_id);
            state
                .subscriptions
                .retain(|key, _| !key.starts_with(&prefix));
        });
    }

    fn add_trace(&self, trace: Option<BuiltTrace>) {
        if let Some(trace) = trace {
            if let Err(e) = self.store.add_trace(trace) {
                error!("Failed to hand subscription trace to the trace store: {}", e);
            }
        }
    }

    pub async fn build_payload(&self, clock: &ClockSync) -> PubsubPayload {
        let minutes = self.with_state(|state| std::mem::take(&mut state.metrics_by_minute));

        let pub_metrics = minutes
            .into_values()
            .map(|minute| MinutePubMetrics {
                start_time: clock.sync_time(minute.start_time),
                pubs: minute
                    .pubs
                    .iter()
                    .map(|(name, sums)| (name.clone(), sums.average()))
                    .collect(),
            })
            .collect();

        let pub_requests = self.store.collect_traces().await.unwrap_or_else(|e| {
            error!("Unable to collect subscription traces: {}", e);
            Vec::new()
        });

        PubsubPayload {
            pub_metrics,
            pub_requests,
        }
    }
}
