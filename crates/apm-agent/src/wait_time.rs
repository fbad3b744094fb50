// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribution of queue wait.
//!
//! Messages of one connection are processed one at a time. When a message is
//! registered, the backlog ahead of it (the message in flight first, then the
//! queue in order) is captured so the trace can later show what it waited on
//! and for how long each of those messages blocked the connection.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::trace::DdpMessage;

/// Projection of a queued message kept for the wait list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitOnMessage {
    pub msg: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Milliseconds the message kept the connection blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<i64>,
}

impl From<&DdpMessage> for WaitOnMessage {
    fn from(msg: &DdpMessage) -> Self {
        Self {
            msg: msg.msg.clone(),
            id: msg.id.clone(),
            method: msg.method.clone(),
            name: msg.name.clone(),
            wait_time: None,
        }
    }
}

/// Cache entry shared by every wait list containing the message.
#[derive(Debug)]
struct CachedMessage {
    message: WaitOnMessage,
    registered: usize,
}

#[derive(Debug, Default)]
struct State {
    wait_lists: HashMap<String, Vec<String>>,
    in_flight: HashMap<String, DdpMessage>,
    cache: HashMap<String, CachedMessage>,
}

impl State {
    fn retain(&mut self, key: String, msg: &DdpMessage) -> String {
        self.cache
            .entry(key.clone())
            .and_modify(|cached| cached.registered += 1)
            .or_insert_with(|| CachedMessage {
                message: WaitOnMessage::from(msg),
                registered: 1,
            });
        key
    }

    fn release(&mut self, key: &str) -> Option<WaitOnMessage> {
        let cached = self.cache.get_mut(key)?;
        cached.registered -= 1;
        let message = cached.message.clone();
        if cached.registered == 0 {
            self.cache.remove(key);
        }
        Some(message)
    }
}

fn message_key(session_id: &str, msg_id: &str) -> String {
    format!("{session_id}::{msg_id}")
}

#[derive(Debug, Default)]
pub struct WaitTimeBuilder {
    state: Mutex<State>,
}

impl WaitTimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the backlog ahead of `msg_id` on `session_id`.
    pub fn register(&self, session_id: &str, msg_id: &str, in_queue: &[DdpMessage]) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");

        let mut wait_list = Vec::with_capacity(in_queue.len() + 1);
        if let Some(current) = state.in_flight.get(session_id).cloned() {
            let key = message_key(session_id, &current.id);
            wait_list.push(state.retain(key, &current));
        }
        for msg in in_queue {
            let key = message_key(session_id, &msg.id);
            wait_list.push(state.retain(key, msg));
        }

        state
            .wait_lists
            .insert(message_key(session_id, msg_id), wait_list);
    }

    /// Removes and returns the wait list of `msg_id`; empty when it was never
    /// registered.
    pub fn build(&self, session_id: &str, msg_id: &str) -> Vec<WaitOnMessage> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(keys) = state.wait_lists.remove(&message_key(session_id, msg_id)) else {
            return Vec::new();
        };
        keys.iter().filter_map(|key| state.release(key)).collect()
    }

    /// Marks `msg` as in flight on `session_id`. The returned wrapper must be
    /// called when the message stops blocking the connection.
    pub fn track_wait_time<F>(
        self: &Arc<Self>,
        session_id: &str,
        msg: &DdpMessage,
        unblock: F,
    ) -> WrappedUnblock<F>
    where
        F: FnOnce(),
    {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.in_flight.insert(session_id.to_string(), msg.clone());
        }
        WrappedUnblock {
            builder: Arc::clone(self),
            session_id: session_id.to_string(),
            msg_id: msg.id.clone(),
            started: Instant::now(),
            unblock: Mutex::new(Some(unblock)),
        }
    }

    /// Number of cached projections still referenced by a wait list.
    pub fn cached(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").cache.len()
    }

    /// Number of wait lists not yet built.
    pub fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned").wait_lists.len()
    }
}

/// Unblock callback returned by [`WaitTimeBuilder::track_wait_time`]. Only
/// the first call has any effect.
pub struct WrappedUnblock<F: FnOnce()> {
    builder: Arc<WaitTimeBuilder>,
    session_id: String,
    msg_id: String,
    started: Instant,
    unblock: Mutex<Option<F>>,
}

impl<F: FnOnce()> WrappedUnblock<F> {
    pub fn call(&self) {
        #[allow(clippy::expect_used)]
        let Some(unblock) = self.unblock.lock().expect("lock poisoned").take() else {
            return;
        };

        let wait_time = self.started.elapsed().as_millis() as i64;
        {
            #[allow(clippy::expect_used)]
            let mut state = self.builder.state.lock().expect("lock poisoned");
            let key = message_key(&self.session_id, &self.msg_id);
            if let Some(cached) = state.cache.get_mut(&key) {
                cached.message.wait_time = Some(wait_time);
            }
            state.in_flight.remove(&self.session_id);
        }

        unblock();
    }

    pub fn is_called(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.unblock.lock().expect("lock poisoned").is_none()
    }
}
