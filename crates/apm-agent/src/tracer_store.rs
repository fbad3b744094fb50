// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded retention of built traces.
//!
//! Only the slowest trace of every kind per interval is a candidate for
//! delivery. It is archived every `archive_every` intervals, or right away
//! when its total is an outlier compared to the recent interval maxima.
//! Errored traces are archived as they arrive, once per distinct error.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::ntp::ClockSync;
use crate::trace::BuiltTrace;

/// Modified z-score above which an interval maximum is an outlier.
const MAX_MAD_Z: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerStoreOptions {
    /// Length of the rolling history of interval maxima.
    pub max_total_points: usize,
    pub interval: Duration,
    pub archive_every: u64,
}

impl TracerStoreOptions {
    /// `archive_every` defaults to a sixth of the window, never less than one.
    pub fn new(max_total_points: usize, interval: Duration) -> Self {
        Self {
            max_total_points,
            interval,
            archive_every: (max_total_points as u64 / 6).max(1),
        }
    }

    pub fn with_archive_every(mut self, archive_every: u64) -> Self {
        self.archive_every = archive_every.max(1);
        self
    }
}

impl Default for TracerStoreOptions {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(60))
    }
}

#[derive(Debug)]
pub struct TracerStore {
    options: TracerStoreOptions,
    max_totals: BTreeMap<String, VecDeque<i64>>,
    current_max_trace: BTreeMap<String, Option<BuiltTrace>>,
    processed_count: BTreeMap<String, u64>,
    trace_archive: Vec<BuiltTrace>,
    error_map: HashSet<String>,
}

impl Default for TracerStore {
    fn default() -> Self {
        Self::new(TracerStoreOptions::default())
    }
}

impl TracerStore {
    /// A zero `archive_every` falls back to the window based default.
    pub fn new(mut options: TracerStoreOptions) -> Self {
        if options.archive_every == 0 {
            options.archive_every =
                TracerStoreOptions::new(options.max_total_points, options.interval).archive_every;
        }
        Self {
            options,
            max_totals: BTreeMap::new(),
            current_max_trace: BTreeMap::new(),
            processed_count: BTreeMap::new(),
            trace_archive: Vec::new(),
            error_map: HashSet::new(),
        }
    }

    pub fn options(&self) -> &TracerStoreOptions {
        &self.options
    }

    /// Keeps the trace when it is the slowest of its kind so far in this
    /// interval. An errored trace that does not take that place is archived
    /// immediately unless the same error was already archived.
    pub fn add_trace(&mut self, trace: BuiltTrace) {
        let kind = trace.kind();
        let current = self.current_max_trace.entry(kind).or_insert(None);
        let replace = current
            .as_ref()
            .map_or(true, |max| max.metrics.total < trace.metrics.total);
        if replace {
            *current = Some(trace);
        } else if trace.errored {
            self.handle_error(trace);
        }
    }

    fn handle_error(&mut self, trace: BuiltTrace) {
        let Some(message) = trace.error_message() else {
            debug!("last event is not an error: {}", trace.id);
            return;
        };
        let error_key = format!("{}::{}", trace.kind(), message);
        if self.error_map.insert(error_key) {
            self.trace_archive.push(trace);
        }
    }

    /// Closes the current interval for every kind seen so far.
    pub fn process_traces(&mut self) {
        let kinds: Vec<String> = self
            .max_totals
            .keys()
            .chain(self.current_max_trace.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        for kind in kinds {
            let current_max_trace = self
                .current_max_trace
                .get_mut(&kind)
                .and_then(Option::take);
            let current_max_total = current_max_trace
                .as_ref()
                .map_or(0, |trace| trace.metrics.total);

            let history = self.max_totals.entry(kind.clone()).or_default();
            history.push_back(current_max_total);
            while history.len() > self.options.max_total_points {
                history.pop_front();
            }

            let processed = self.processed_count.entry(kind.clone()).or_insert(0);
            let archive_default = *processed % self.options.archive_every == 0;
            *processed += 1;

            let Some(trace) = current_max_trace else {
                continue;
            };
            let history: Vec<i64> = history.iter().copied().collect();
            if archive_default || is_outlier(&history, trace.metrics.total, MAX_MAD_Z) {
                debug!("archiving {} with total {}", kind, trace.metrics.total);
                self.trace_archive.push(trace);
            }
        }

        self.error_map.clear();
    }

    /// Drains the archive, moving every `at` onto the reference clock.
    pub fn collect_traces(&mut self, clock: &ClockSync) -> Vec<BuiltTrace> {
        let mut traces = std::mem::take(&mut self.trace_archive);
        for trace in &mut traces {
            trace.at = clock.sync_time(trace.at);
        }
        traces
    }

    pub fn archived(&self) -> usize {
        self.trace_archive.len()
    }

    /// Recent interval maxima of `kind`, oldest first.
    pub fn history(&self, kind: &str) -> Vec<i64> {
        self.max_totals
            .get(kind)
            .map(|history| history.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Whether `point` deviates from the median of `data_set` by more than
/// `max_mad_z` median absolute deviations.
///
/// With a zero MAD a point equal to the median is not an outlier and any
/// other point is.
pub fn is_outlier(data_set: &[i64], point: i64, max_mad_z: f64) -> bool {
    let values: Vec<f64> = data_set.iter().map(|value| *value as f64).collect();
    let Some(median) = median(&values) else {
        return false;
    };
    let deviations: Vec<f64> = values.iter().map(|value| (median - value).abs()).collect();
    let Some(mad) = self::median(&deviations) else {
        return false;
    };
    let mad_z = (median - point as f64).abs() / mad;
    mad_z > max_mad_z
}

/// Second quartile with linear interpolation between the two middle values.
pub fn median(data_set: &[f64]) -> Option<f64> {
    if data_set.is_empty() {
        return None;
    }
    let mut sorted = data_set.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = (sorted.len() + 1) as f64 * 2.0 / 4.0;
    let index = position.floor() as usize;
    if position.fract() == 0.0 {
        return Some(sorted[index - 1]);
    }
    Some((sorted[index - 1] + sorted[index]) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{EventData, Metrics, ProcessedEvent, TraceType};
    use serde_json::json;

    fn trace(name: &str, total: i64) -> BuiltTrace {
        BuiltTrace {
            id: format!("s::{name}-{total}"),
            trace_type: TraceType::Method,
            name: name.to_string(),
            session: "s".to_string(),
            user_id: None,
            msg_id: format!("{name}-{total}"),
            errored: false,
            at: 1_000,
            metrics: Metrics {
                total,
                ..Metrics::default()
            },
            events: vec![
                ProcessedEvent::new("start", 0, None),
                ProcessedEvent::new("complete", 0, None),
            ],
        }
    }

    fn errored(name: &str, total: i64, message: &str) -> BuiltTrace {
        let mut data = EventData::new();
        data.insert("error".to_string(), json!({ "message": message }));
        let mut trace = trace(name, total);
        trace.errored = true;
        trace.events = vec![
            ProcessedEvent::new("start", 0, None),
            ProcessedEvent::new("error", 0, Some(data)),
        ];
        trace
    }

    fn store(archive_every: u64) -> TracerStore {
        TracerStore::new(
            TracerStoreOptions::new(30, Duration::from_secs(60)).with_archive_every(archive_every),
        )
    }

    #[test]
    fn test_default_options() {
        let options = TracerStoreOptions::default();
        assert_eq!(options.max_total_points, 30);
        assert_eq!(options.interval, Duration::from_secs(60));
        assert_eq!(options.archive_every, 5);
        assert_eq!(TracerStoreOptions::new(3, Duration::from_secs(1)).archive_every, 1);
    }

    #[test]
    fn test_add_trace_keeps_max() {
        let mut store = store(1);
        store.add_trace(trace("m", 100));
        store.add_trace(trace("m", 300));
        store.add_trace(trace("m", 200));
        store.process_traces();
        let traces = store.collect_traces(&ClockSync::unsynced());
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].metrics.total, 300);
    }

    #[test]
    fn test_add_trace_ties_keep_first() {
        let mut store = store(1);
        let mut first = trace("m", 100);
        first.msg_id = "first".to_string();
        let mut second = trace("m", 100);
        second.msg_id = "second".to_string();
        store.add_trace(first);
        store.add_trace(second);
        store.process_traces();
        let traces = store.collect_traces(&ClockSync::unsynced());
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].msg_id, "first");
    }

    #[test]
    fn test_kinds_are_tracked_separately() {
        let mut store = store(1);
        store.add_trace(trace("a", 100));
        store.add_trace(trace("b", 10));
        store.process_traces();
        let mut names: Vec<String> = store
            .collect_traces(&ClockSync::unsynced())
            .into_iter()
            .map(|trace| trace.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.history("method::a"), vec![100]);
        assert_eq!(store.history("method::b"), vec![10]);
    }

    #[test]
    fn test_errored_trace_archived_once_per_interval() {
        let mut store = store(100);
        store.add_trace(trace("m", 500));
        store.add_trace(errored("m", 10, "boom"));
        store.add_trace(errored("m", 20, "boom"));
        store.add_trace(errored("m", 30, "other"));
        assert_eq!(store.archived(), 2);

        store.process_traces();
        // first interval is always archived
        assert_eq!(store.archived(), 3);

        store.add_trace(trace("m", 500));
        store.add_trace(errored("m", 10, "boom"));
        assert_eq!(store.archived(), 4);
    }

    #[test]
    fn test_errored_trace_becoming_max_is_not_archived_early() {
        let mut store = store(100);
        store.add_trace(errored("m", 10, "boom"));
        assert_eq!(store.archived(), 0);
        store.add_trace(errored("m", 50, "boom"));
        assert_eq!(store.archived(), 0);
    }

    #[test]
    fn test_errored_trace_without_error_data_is_skipped() {
        let mut store = store(100);
        store.add_trace(trace("m", 500));
        let mut trace = trace("m", 10);
        trace.errored = true;
        store.add_trace(trace);
        assert_eq!(store.archived(), 0);
    }

    #[test]
    fn test_archive_every_without_outliers() {
        let mut store = store(5);
        let mut archived_at = Vec::new();
        for call in 0..15 {
            store.add_trace(trace("m", 100));
            store.process_traces();
            if !store.collect_traces(&ClockSync::unsynced()).is_empty() {
                archived_at.push(call);
            }
        }
        assert_eq!(archived_at, vec![0, 5, 10]);
    }

    #[test]
    fn test_zero_archive_every_uses_window_default() {
        let mut store = TracerStore::new(TracerStoreOptions {
            max_total_points: 12,
            interval: Duration::from_secs(60),
            archive_every: 0,
        });
        assert_eq!(store.options().archive_every, 2);

        let mut archived_at = Vec::new();
        for call in 0..5 {
            store.add_trace(trace("m", 100));
            store.process_traces();
            if !store.collect_traces(&ClockSync::unsynced()).is_empty() {
                archived_at.push(call);
            }
        }
        assert_eq!(archived_at, vec![0, 2, 4]);

        let store = TracerStore::new(TracerStoreOptions {
            max_total_points: 3,
            interval: Duration::from_secs(60),
            archive_every: 0,
        });
        assert_eq!(store.options().archive_every, 1);
    }

    #[test]
    fn test_outlier_is_archived() {
        let mut store = store(100);
        for _ in 0..6 {
            store.add_trace(trace("m", 10));
            store.process_traces();
        }
        assert_eq!(store.collect_traces(&ClockSync::unsynced()).len(), 1);

        store.add_trace(trace("m", 10));
        store.process_traces();
        assert_eq!(store.archived(), 0);

        store.add_trace(trace("m", 100));
        store.process_traces();
        let traces = store.collect_traces(&ClockSync::unsynced());
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].metrics.total, 100);
    }

    #[test]
    fn test_idle_interval_records_zero() {
        let mut store = store(100);
        store.add_trace(trace("m", 40));
        store.process_traces();
        store.process_traces();
        assert_eq!(store.history("method::m"), vec![40, 0]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut store = TracerStore::new(TracerStoreOptions::new(3, Duration::from_secs(60)));
        for total in 1..=5 {
            store.add_trace(trace("m", total));
            store.process_traces();
        }
        assert_eq!(store.history("method::m"), vec![3, 4, 5]);
    }

    #[test]
    fn test_collect_traces_drains_and_shifts_time() {
        let mut store = store(1);
        store.add_trace(trace("m", 100));
        store.process_traces();

        let clock = ClockSync::with_offset(250.4);
        let traces = store.collect_traces(&clock);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].at, 1_251);
        assert!(store.collect_traces(&clock).is_empty());
    }

    #[test]
    fn test_is_outlier() {
        assert!(!is_outlier(&[10, 10, 10, 10, 10], 10, MAX_MAD_Z));
        assert!(is_outlier(&[10, 10, 10, 10, 10], 100, MAX_MAD_Z));
        assert!(!is_outlier(&[10, 12, 9, 11, 10], 12, MAX_MAD_Z));
        assert!(is_outlier(&[10, 12, 9, 11, 10], 40, MAX_MAD_Z));
        assert!(!is_outlier(&[], 40, MAX_MAD_Z));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[7.0]), Some(7.0));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }
}
