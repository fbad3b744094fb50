// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_agent::retry::Sleeper;
use apm_agent::trace::{DdpMessage, EventType, SessionInfo, Trace};
use apm_agent::tracer::Tracer;
use async_trait::async_trait;
use std::time::Duration;

/// Skips every retry delay.
#[derive(Debug, Default)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

/// Method trace with one db call, completed or errored.
pub fn traced_method(tracer: &Tracer, id: &str, name: &str, error: Option<&str>) -> Trace {
    let mut trace = tracer
        .start(&SessionInfo::new("session"), &DdpMessage::method(id, name))
        .expect("methods are traced");
    tracer
        .event(&mut trace, EventType::Start, None)
        .expect("start recorded");
    let db = tracer
        .event(&mut trace, EventType::Db, None)
        .expect("db recorded")
        .and_then(|handle| handle.id())
        .expect("db is repetitive");
    tracer
        .event_end(&mut trace, db, None)
        .expect("db end recorded");
    let terminal = match error {
        Some(message) => {
            let mut data = apm_agent::trace::EventData::new();
            data.insert(
                "error".to_string(),
                serde_json::json!({ "message": message }),
            );
            tracer.event(&mut trace, EventType::Error, Some(data))
        }
        None => tracer.event(&mut trace, EventType::Complete, None),
    };
    terminal.expect("terminal event recorded");
    trace
}
