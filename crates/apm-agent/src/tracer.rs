// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request lifecycle tracer.
//!
//! A [`Trace`] is opened when a method call or subscription arrives, collects
//! start/end events while the request is handled and is finally normalized by
//! [`Tracer::build_trace`] into a [`BuiltTrace`] with a timing breakdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

use crate::errors::FilterError;
use crate::ntp::now_ms;
use crate::trace::{
    BuiltTrace, DdpMessage, Event, EventData, EventId, EventType, Metrics, ProcessedEvent,
    SessionInfo, Trace, TraceInfo, TraceType,
};

/// Outcome of a single filter invocation.
pub type FilterResult = Result<Option<EventData>, FilterError>;

/// Transform applied to event data before it is stored on a trace.
///
/// Receives the wire name of the event (`db`, `dbend`, ...), an owned copy of
/// the data accumulated so far and the kind of the trace. Returning `None`
/// drops the data. Returning an error removes the filter from the chain.
pub trait EventFilter: Send + Sync {
    fn filter(&self, event_type: &str, data: EventData, info: &TraceInfo) -> FilterResult;
}

impl<F> EventFilter for F
where
    F: Fn(&str, EventData, &TraceInfo) -> FilterResult + Send + Sync,
{
    fn filter(&self, event_type: &str, data: EventData, info: &TraceInfo) -> FilterResult {
        self(event_type, data, info)
    }
}

/// Handle returned by [`FilterChain::add`], used to remove the filter again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

/// Ordered list of filters. A filter that fails is removed before its error
/// is handed back to the caller.
pub struct FilterChain<F: ?Sized> {
    filters: RwLock<Vec<(FilterId, Arc<F>)>>,
    next_id: AtomicU64,
}

impl<F: ?Sized> Default for FilterChain<F> {
    fn default() -> Self {
        Self {
            filters: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<F: ?Sized> FilterChain<F> {
    pub fn add(&self, filter: Arc<F>) -> FilterId {
        let id = FilterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        #[allow(clippy::expect_used)]
        self.filters
            .write()
            .expect("lock poisoned")
            .push((id, filter));
        id
    }

    /// Returns false when the filter was not registered.
    pub fn remove(&self, id: FilterId) -> bool {
        #[allow(clippy::expect_used)]
        let mut filters = self.filters.write().expect("lock poisoned");
        let before = filters.len();
        filters.retain(|(filter_id, _)| *filter_id != id);
        filters.len() != before
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.filters.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filters are invoked on a snapshot so that a filter may add or remove
    /// filters without deadlocking.
    pub fn snapshot(&self) -> Vec<(FilterId, Arc<F>)> {
        #[allow(clippy::expect_used)]
        self.filters.read().expect("lock poisoned").clone()
    }
}

/// Value returned by a successful [`Tracer::event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandle {
    /// Repetitive event; pass the id to [`Tracer::event_end`].
    Repetitive(EventId),
    /// Non repetitive event; nothing to close.
    Marker,
}

impl EventHandle {
    pub fn id(&self) -> Option<EventId> {
        match self {
            Self::Repetitive(id) => Some(*id),
            Self::Marker => None,
        }
    }
}

/// Shared tracer. Holds no per-request state; traces are owned by callers.
pub struct Tracer {
    filters: FilterChain<dyn EventFilter>,
    next_event_id: AtomicU64,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            filters: FilterChain::default(),
            next_event_id: AtomicU64::new(0),
        }
    }

    pub fn add_filter(&self, filter: impl EventFilter + 'static) -> FilterId {
        self.filters.add(Arc::new(filter))
    }

    pub fn remove_filter(&self, id: FilterId) -> bool {
        self.filters.remove(id)
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Opens a trace for method calls and subscriptions; other messages are
    /// not traced.
    pub fn start(&self, session: &SessionInfo, msg: &DdpMessage) -> Option<Trace> {
        let (trace_type, name) = match msg.msg.as_str() {
            "method" => (TraceType::Method, msg.method.clone().unwrap_or_default()),
            "sub" => (TraceType::Sub, msg.name.clone().unwrap_or_default()),
            _ => return None,
        };
        let mut trace = Trace::new(session.id.clone(), msg.id.clone(), trace_type, name);
        trace.user_id = session.user_id.clone();
        Some(trace)
    }

    /// Records the start of an event.
    ///
    /// Returns `Ok(None)` when the trace already ended or when a repetitive
    /// event is opened while another one is still open.
    pub fn event(
        &self,
        trace: &mut Trace,
        event_type: EventType,
        data: Option<EventData>,
    ) -> Result<Option<EventHandle>, FilterError> {
        self.event_at(trace, event_type, data, now_ms())
    }

    pub(crate) fn event_at(
        &self,
        trace: &mut Trace,
        event_type: EventType,
        data: Option<EventData>,
        at: i64,
    ) -> Result<Option<EventHandle>, FilterError> {
        if trace.is_terminated() {
            return Ok(None);
        }

        let repetitive = event_type.is_repetitive();
        if repetitive && trace.open_event.is_some() {
            return Ok(None);
        }

        let mut event = Event::new(event_type, at);
        if let Some(data) = data {
            event.data = self.apply_filters(&event.name(), data, &trace.info())?;
        }

        let handle = if repetitive {
            let id = EventId(self.next_event_id.fetch_add(1, Ordering::Relaxed));
            trace.open_event = Some(id);
            EventHandle::Repetitive(id)
        } else {
            EventHandle::Marker
        };

        debug!("{} {}", event.name(), trace.id);
        trace.events.push(event);
        Ok(Some(handle))
    }

    /// Closes the open repetitive event when `id` matches it.
    pub fn event_end(
        &self,
        trace: &mut Trace,
        id: EventId,
        data: Option<EventData>,
    ) -> Result<bool, FilterError> {
        self.event_end_at(trace, id, data, now_ms())
    }

    pub(crate) fn event_end_at(
        &self,
        trace: &mut Trace,
        id: EventId,
        data: Option<EventData>,
        at: i64,
    ) -> Result<bool, FilterError> {
        if trace.open_event != Some(id) {
            return Ok(false);
        }
        let Some(open_type) = trace
            .events
            .iter()
            .rev()
            .find(|event| !event.is_end && event.event_type.is_repetitive())
            .map(|event| event.event_type.clone())
        else {
            return Ok(false);
        };

        let mut event = Event::end(open_type, at);
        if let Some(data) = data {
            event.data = self.apply_filters(&event.name(), data, &trace.info())?;
        }

        debug!("{} {}", event.name(), trace.id);
        trace.events.push(event);
        trace.open_event = None;
        Ok(true)
    }

    /// Closes the most recent event if it is still open. Start and terminal
    /// events are never closed.
    pub fn end_last_event(&self, trace: &mut Trace) -> bool {
        let Some(last) = trace.last_event() else {
            return false;
        };
        if last.is_end || last.event_type == EventType::Start || last.event_type.is_terminal() {
            return false;
        }
        let event = Event::end(last.event_type.clone(), now_ms());
        if event.event_type.is_repetitive() {
            trace.open_event = None;
        }
        debug!("{} {}", event.name(), trace.id);
        trace.events.push(event);
        true
    }

    /// Validates the event log and computes the timing breakdown.
    ///
    /// Returns `None`, after logging why, when the log does not start with
    /// `start`, does not end with `complete`/`error`, or an event in between
    /// is not followed by its own end event.
    pub fn build_trace(&self, trace: Trace) -> Option<BuiltTrace> {
        let events = &trace.events;
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            warn!("trace {} has no events", trace.id);
            return None;
        };

        if first.is_end || first.event_type != EventType::Start {
            warn!("trace {} is not started yet", trace.id);
            return None;
        }

        if last.is_end || !last.event_type.is_terminal() || events.len() < 2 {
            warn!("trace {} is not completed or errored yet", trace.id);
            return None;
        }

        let total = last.at - first.at;
        let mut categories: BTreeMap<String, i64> = BTreeMap::new();
        let mut total_non_compute = 0;
        let mut processed = vec![ProcessedEvent::new("start", 0, first.data.clone())];

        let last_index = events.len() - 1;
        let mut index = 1;
        while index < last_index {
            let previous = &events[index - 1];
            let start = &events[index];
            let end = &events[index + 1];

            let compute_time = start.at - previous.at;
            if compute_time > 0 {
                processed.push(ProcessedEvent::new("compute", compute_time, None));
            }

            if !end.closes(start) {
                error!(
                    "end event type mismatch in trace {}: {} followed by {}",
                    trace.id,
                    start.name(),
                    end.name()
                );
                return None;
            }

            let elapsed = end.at - start.at;
            let mut data = start.data.clone().unwrap_or_default();
            if let Some(end_data) = &end.data {
                data.extend(end_data.clone());
            }
            processed.push(ProcessedEvent::new(start.name(), elapsed, Some(data)));

            *categories.entry(start.name()).or_insert(0) += elapsed;
            total_non_compute += elapsed;
            index += 2;
        }

        let compute_time = last.at - events[last_index - 1].at;
        if compute_time > 0 {
            processed.push(ProcessedEvent::new("compute", compute_time, None));
        }
        processed.push(ProcessedEvent::new(last.name(), 0, last.data.clone()));

        Some(BuiltTrace {
            errored: last.event_type == EventType::Error,
            at: first.at,
            metrics: Metrics {
                total,
                compute: total - total_non_compute,
                categories,
            },
            events: processed,
            id: trace.id,
            trace_type: trace.trace_type,
            name: trace.name,
            session: trace.session,
            user_id: trace.user_id,
            msg_id: trace.msg_id,
        })
    }

    /// Runs `data` through the filter chain. Each filter owns the value it is
    /// given, so it cannot reach data already stored on the trace.
    fn apply_filters(
        &self,
        event_type: &str,
        data: EventData,
        info: &TraceInfo,
    ) -> FilterResult {
        let mut current = Some(data);
        for (id, filter) in self.filters.snapshot() {
            let input = current.take().unwrap_or_default();
            match filter.filter(event_type, input, info) {
                Ok(next) => current = next,
                Err(e) => {
                    self.filters.remove(id);
                    warn!("removed failing event filter: {e}");
                    return Err(e);
                }
            }
        }
        Ok(current)
    }
}
