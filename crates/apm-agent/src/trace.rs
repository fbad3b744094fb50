// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace data model: raw lifecycle events recorded while a request is in
//! flight and the normalized form produced once it completes.

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Arbitrary structured data attached to an event.
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// Kind of operation a trace describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceType {
    Method,
    Sub,
}

impl TraceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Sub => "sub",
        }
    }
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event categories known to the tracer. Anything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Start,
    Wait,
    Db,
    Http,
    Email,
    Async,
    Compute,
    Complete,
    Error,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Wait => "wait",
            Self::Db => "db",
            Self::Http => "http",
            Self::Email => "email",
            Self::Async => "async",
            Self::Compute => "compute",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Other(name) => name,
        }
    }

    /// Categories restricted to a single open instance per trace.
    pub fn is_repetitive(&self) -> bool {
        matches!(
            self,
            Self::Db | Self::Http | Self::Email | Self::Wait | Self::Async
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        match name {
            "start" => Self::Start,
            "wait" => Self::Wait,
            "db" => Self::Db,
            "http" => Self::Http,
            "email" => Self::Email,
            "async" => Self::Async,
            "compute" => Self::Compute,
            "complete" => Self::Complete,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the raw event log. `is_end` marks the `<type>end` counterpart
/// of a previously opened event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub is_end: bool,
    /// Local epoch milliseconds.
    pub at: i64,
    pub data: Option<EventData>,
}

impl Event {
    pub fn new(event_type: EventType, at: i64) -> Self {
        Self {
            event_type,
            is_end: false,
            at,
            data: None,
        }
    }

    pub fn end(event_type: EventType, at: i64) -> Self {
        Self {
            event_type,
            is_end: true,
            at,
            data: None,
        }
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }

    /// Name as it appears on the wire, e.g. `db` or `dbend`.
    pub fn name(&self) -> String {
        if self.is_end {
            format!("{}end", self.event_type)
        } else {
            self.event_type.to_string()
        }
    }

    /// Whether `self` is the end event matching the opening event `start`.
    pub fn closes(&self, start: &Event) -> bool {
        self.is_end && !start.is_end && self.event_type == start.event_type
    }
}

/// Connection a message arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: Option<String>,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
        }
    }
}

/// Incoming protocol message, reduced to the fields the agent looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DdpMessage {
    pub msg: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DdpMessage {
    pub fn method(id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            msg: "method".to_string(),
            id: id.into(),
            method: Some(method.into()),
            name: None,
        }
    }

    pub fn sub(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            msg: "sub".to_string(),
            id: id.into(),
            method: None,
            name: Some(name.into()),
        }
    }
}

/// Opaque identifier returned for repetitive events; required to close them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) u64);

/// Subset of a trace handed to filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceInfo {
    pub trace_type: TraceType,
    pub name: String,
}

/// A request or subscription lifecycle being recorded.
///
/// Owned by the task handling the request; finalized by
/// [`crate::tracer::Tracer::build_trace`], which consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// `session::msgId`
    pub id: String,
    pub session: String,
    pub user_id: Option<String>,
    pub msg_id: String,
    pub trace_type: TraceType,
    pub name: String,
    pub events: Vec<Event>,
    pub(crate) open_event: Option<EventId>,
}

impl Trace {
    pub fn new(
        session: impl Into<String>,
        msg_id: impl Into<String>,
        trace_type: TraceType,
        name: impl Into<String>,
    ) -> Self {
        let session = session.into();
        let msg_id = msg_id.into();
        Self {
            id: format!("{session}::{msg_id}"),
            session,
            user_id: None,
            msg_id,
            trace_type,
            name: name.into(),
            events: Vec::new(),
            open_event: None,
        }
    }

    pub fn info(&self) -> TraceInfo {
        TraceInfo {
            trace_type: self.trace_type,
            name: self.name.clone(),
        }
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn is_terminated(&self) -> bool {
        self.last_event()
            .is_some_and(|event| !event.is_end && event.event_type.is_terminal())
    }
}

/// Timing breakdown of a built trace, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub total: i64,
    pub compute: i64,
    #[serde(flatten)]
    pub categories: BTreeMap<String, i64>,
}

impl Metrics {
    pub fn category(&self, name: &str) -> i64 {
        self.categories.get(name).copied().unwrap_or(0)
    }
}

/// `[type, elapsedMs, data?]` entry of a built trace.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub name: String,
    pub elapsed: i64,
    pub data: Option<EventData>,
}

impl ProcessedEvent {
    pub fn new(name: impl Into<String>, elapsed: i64, data: Option<EventData>) -> Self {
        Self {
            name: name.into(),
            elapsed,
            data,
        }
    }
}

impl Serialize for ProcessedEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.data.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.name)?;
        seq.serialize_element(&self.elapsed)?;
        if let Some(data) = &self.data {
            seq.serialize_element(data)?;
        }
        seq.end()
    }
}

/// Normalized trace, ready for sampling and delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltTrace {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub trace_type: TraceType,
    pub name: String,
    pub session: String,
    pub user_id: Option<String>,
    #[serde(skip)]
    pub msg_id: String,
    pub errored: bool,
    /// Start of the trace; local time until collected, server time after.
    pub at: i64,
    pub metrics: Metrics,
    pub events: Vec<ProcessedEvent>,
}

impl BuiltTrace {
    /// `type::name`, the grouping key used by the sample store.
    pub fn kind(&self) -> String {
        format!("{}::{}", self.trace_type, self.name)
    }

    /// Error message carried by the terminal event, if any.
    pub fn error_message(&self) -> Option<String> {
        let error = self.events.last()?.data.as_ref()?.get("error")?;
        match error {
            serde_json::Value::String(message) => Some(message.clone()),
            serde_json::Value::Object(fields) => fields
                .get("message")
                .map(|message| match message {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                }),
            other => Some(other.to_string()),
        }
    }
}
