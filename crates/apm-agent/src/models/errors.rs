// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::errors::FilterError;
use crate::ntp::{now_ms, ClockSync};
use crate::trace::BuiltTrace;
use crate::tracer::{FilterChain, FilterId};

const DEFAULT_MAX_ERRORS: usize = 10;

/// Error raised while handling a traced request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedError {
    pub message: String,
    pub stack: Option<String>,
    /// Extra context attached by the application, prepended to the stack.
    pub details: Option<String>,
    /// Raised on purpose to answer the client, such as a validation failure.
    pub client_error: bool,
}

impl TrackedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn client_error(mut self) -> Self {
        self.client_error = true;
        self
    }

    fn formatted_stack(&self) -> Option<String> {
        match (&self.details, &self.stack) {
            (Some(details), Some(stack)) => Some(format!("Details: {details} \r\n{stack}")),
            (Some(details), None) => Some(format!("Details: {details}")),
            (None, stack) => stack.clone(),
        }
    }
}

/// Decides whether an error is reported. Receives the trace type, the error
/// message, the error and the trace name.
pub trait ErrorFilter: Send + Sync {
    fn filter(
        &self,
        error_type: &str,
        message: &str,
        error: &TrackedError,
        sub_type: &str,
    ) -> Result<bool, FilterError>;
}

impl<F> ErrorFilter for F
where
    F: Fn(&str, &str, &TrackedError, &str) -> Result<bool, FilterError> + Send + Sync,
{
    fn filter(
        &self,
        error_type: &str,
        message: &str,
        error: &TrackedError,
        sub_type: &str,
    ) -> Result<bool, FilterError> {
        self(error_type, message, error, sub_type)
    }
}

/// Drops errors deliberately raised for the client.
pub fn filter_validation_errors(
    _error_type: &str,
    _message: &str,
    error: &TrackedError,
    _sub_type: &str,
) -> Result<bool, FilterError> {
    Ok(!error.client_error)
}

/// Drops transport noise: missed heartbeats and sockets used in an invalid
/// state.
pub fn filter_common_errors(
    _error_type: &str,
    message: &str,
    _error: &TrackedError,
    _sub_type: &str,
) -> Result<bool, FilterError> {
    let message = message.to_lowercase();
    let missed_heartbeat = message
        .find("connection timeout. no ")
        .is_some_and(|start| message[start..].contains(" heartbeat received"));
    Ok(!(missed_heartbeat || message.contains("invalid_state_err")))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stack {
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub start_time: i64,
    pub sub_type: String,
    pub trace: BuiltTrace,
    pub stacks: Vec<Stack>,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorsPayload {
    pub errors: Vec<ErrorDef>,
}

#[derive(Debug, Default)]
struct ErrorState {
    errors: Vec<ErrorDef>,
    index: HashMap<String, usize>,
}

/// Distinct errors of the current payload, keyed by `type:message`.
pub struct ErrorModel {
    app_id: Option<String>,
    max_errors: usize,
    state: Mutex<ErrorState>,
    filters: FilterChain<dyn ErrorFilter>,
}

impl std::fmt::Debug for ErrorModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorModel")
            .field("app_id", &self.app_id)
            .field("max_errors", &self.max_errors)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl ErrorModel {
    pub fn new(app_id: Option<String>) -> Self {
        Self {
            app_id,
            max_errors: DEFAULT_MAX_ERRORS,
            state: Mutex::new(ErrorState::default()),
            filters: FilterChain::default(),
        }
    }

    pub fn add_filter(&self, filter: impl ErrorFilter + 'static) -> FilterId {
        self.filters.add(Arc::new(filter))
    }

    pub fn remove_filter(&self, id: FilterId) -> bool {
        self.filters.remove(id)
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn error_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").errors.len()
    }

    /// Records `error` raised while handling `trace`. Repeated errors only
    /// bump the count; new ones are dropped once the payload is full or a
    /// filter rejects them.
    pub fn track_error(&self, error: &TrackedError, trace: &BuiltTrace) -> Result<(), FilterError> {
        self.track_error_at(error, trace, now_ms())
    }

    pub(crate) fn track_error_at(
        &self,
        error: &TrackedError,
        trace: &BuiltTrace,
        at: i64,
    ) -> Result<(), FilterError> {
        let key = format!("{}:{}", trace.trace_type, error.message);
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            if let Some(&position) = state.index.get(&key) {
                state.errors[position].count += 1;
                return Ok(());
            }
            if state.errors.len() >= self.max_errors {
                debug!("dropping error {key}, payload is full");
                return Ok(());
            }
        }

        let error_def = self.format_error(error, trace, at);
        if !self.apply_filters(&error_def.error_type, &error_def.name, error, &error_def.sub_type)? {
            return Ok(());
        }

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        // Another caller may have tracked the same error while filters ran.
        if let Some(&position) = state.index.get(&key) {
            state.errors[position].count += 1;
        } else if state.errors.len() < self.max_errors {
            let position = state.errors.len();
            state.errors.push(error_def);
            state.index.insert(key, position);
        }
        Ok(())
    }

    /// Drains the tracked errors, moving `startTime` onto the reference clock.
    pub fn build_payload(&self, clock: &ClockSync) -> ErrorsPayload {
        let mut errors = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.index.clear();
            std::mem::take(&mut state.errors)
        };
        for error in &mut errors {
            error.start_time = clock.sync_time(error.start_time);
        }
        ErrorsPayload { errors }
    }

    fn format_error(&self, error: &TrackedError, trace: &BuiltTrace, at: i64) -> ErrorDef {
        let stack = error.formatted_stack();

        let mut trace = trace.clone();
        let error_object = trace
            .events
            .last_mut()
            .and_then(|event| event.data.as_mut())
            .and_then(|data| data.get_mut("error"))
            .and_then(serde_json::Value::as_object_mut);
        if let Some(error_object) = error_object {
            error_object.insert(
                "stack".to_string(),
                stack.clone().map_or(serde_json::Value::Null, Into::into),
            );
        }

        ErrorDef {
            app_id: self.app_id.clone(),
            name: error.message.clone(),
            error_type: trace.trace_type.to_string(),
            start_time: at,
            sub_type: trace.name.clone(),
            trace,
            stacks: vec![Stack { stack }],
            count: 1,
        }
    }

    fn apply_filters(
        &self,
        error_type: &str,
        message: &str,
        error: &TrackedError,
        sub_type: &str,
    ) -> Result<bool, FilterError> {
        for (id, filter) in self.filters.snapshot() {
            match filter.filter(error_type, message, error, sub_type) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) => {
                    self.filters.remove(id);
                    warn!("removed failing error filter: {e}");
                    return Err(e);
                }
            }
        }
        Ok(true)
    }
}
