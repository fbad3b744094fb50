// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service object owning every part of the pipeline.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::errors::{AgentError, FilterError, SendError};
use crate::models::{ErrorModel, MethodsModel, PubsubModel, TrackedError};
use crate::ntp::{now_ms, ClockSync, HttpTimeSource};
use crate::payload::Payload;
use crate::sender::{Credentials, HttpSender, PayloadSender};
use crate::trace::{BuiltTrace, DdpMessage, EventData, EventId, EventType, Trace, TraceType};
use crate::tracer::Tracer;
use crate::tracer_store_service::{TracerStoreHandle, TracerStoreService};
use crate::wait_time::WaitTimeBuilder;

const PAYLOAD_PATH: &str = "/";

pub struct Agent {
    tracer: Arc<Tracer>,
    wait_time: Arc<WaitTimeBuilder>,
    clock: Arc<ClockSync>,
    errors: Arc<ErrorModel>,
    methods: MethodsModel,
    pubsub: PubsubModel,
    stores: [TracerStoreHandle; 2],
    sender: Arc<dyn PayloadSender>,
}

impl Agent {
    /// Spawns the trace store services, so it must be called from within a
    /// tokio runtime.
    pub fn new(
        config: &AgentConfig,
        clock: Arc<ClockSync>,
        sender: Arc<dyn PayloadSender>,
    ) -> Self {
        let options = config.tracer_store_options();

        let (method_service, method_store) = TracerStoreService::new(options, Arc::clone(&clock));
        tokio::spawn(method_service.run());
        let (pub_service, pub_store) = TracerStoreService::new(options, Arc::clone(&clock));
        tokio::spawn(pub_service.run());

        Self {
            tracer: Arc::new(Tracer::new()),
            wait_time: Arc::new(WaitTimeBuilder::new()),
            clock,
            errors: Arc::new(ErrorModel::new(config.app_id.clone())),
            methods: MethodsModel::new(method_store.clone()),
            pubsub: PubsubModel::new(pub_store.clone()),
            stores: [method_store, pub_store],
            sender,
        }
    }

    /// Wires the http time source and sender described by `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let proxy = config.https_proxy.as_deref();
        let source = HttpTimeSource::new(&config.endpoint, proxy)?;
        let credentials = Credentials {
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
        };
        let sender = HttpSender::new(&config.endpoint, &credentials, proxy)?;
        Ok(Self::new(
            config,
            Arc::new(ClockSync::new(Arc::new(source))),
            Arc::new(sender),
        ))
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn wait_time(&self) -> &Arc<WaitTimeBuilder> {
        &self.wait_time
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    pub fn errors(&self) -> &Arc<ErrorModel> {
        &self.errors
    }

    pub fn methods(&self) -> &MethodsModel {
        &self.methods
    }

    pub fn pubsub(&self) -> &PubsubModel {
        &self.pubsub
    }

    /// Starts clock sync and the periodic trace processing. Returns the
    /// clock sync task when it was not already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        info!("starting apm agent");
        for store in &self.stores {
            store.start();
        }
        self.clock.start()
    }

    pub fn stop(&self) {
        debug!("stopping apm agent");
        self.clock.stop();
        for store in &self.stores {
            store.stop();
        }
    }

    /// Stops every periodic task and the trace store services.
    pub fn shutdown(&self) {
        self.stop();
        for store in &self.stores {
            if let Err(e) = store.shutdown() {
                warn!("trace store already stopped: {}", e);
            }
        }
    }

    /// Opens the `wait` event of a message that just arrived and captures the
    /// backlog ahead of it. `in_queue` is the connection's queue, oldest
    /// first, not including the message itself.
    pub fn begin_wait(
        &self,
        trace: &mut Trace,
        in_queue: &[DdpMessage],
    ) -> Result<Option<EventId>, FilterError> {
        self.begin_wait_at(trace, in_queue, now_ms())
    }

    pub(crate) fn begin_wait_at(
        &self,
        trace: &mut Trace,
        in_queue: &[DdpMessage],
        at: i64,
    ) -> Result<Option<EventId>, FilterError> {
        self.wait_time.register(&trace.session, &trace.msg_id, in_queue);
        let handle = self
            .tracer
            .event_at(trace, EventType::Wait, Some(EventData::new()), at)?;
        Ok(handle.and_then(|handle| handle.id()))
    }

    /// Closes the `wait` event once the message starts being processed,
    /// attaching the messages it waited on as `waitOn`.
    pub fn end_wait(&self, trace: &mut Trace, id: EventId) -> Result<bool, FilterError> {
        self.end_wait_at(trace, id, now_ms())
    }

    pub(crate) fn end_wait_at(
        &self,
        trace: &mut Trace,
        id: EventId,
        at: i64,
    ) -> Result<bool, FilterError> {
        let wait_on = self.wait_time.build(&trace.session, &trace.msg_id);
        let wait_on = match serde_json::to_value(&wait_on) {
            Ok(value) => value,
            Err(e) => {
                warn!("unable to encode wait list of {}: {}", trace.id, e);
                serde_json::Value::Array(Vec::new())
            }
        };
        let mut data = EventData::new();
        data.insert("waitOn".to_string(), wait_on);
        self.tracer.event_end_at(trace, id, Some(data), at)
    }

    /// Builds a finished trace and records it. Method traces feed the method
    /// aggregates and, when errored, the error model. Subscription traces are
    /// returned for [`PubsubModel::track_ready`] or
    /// [`PubsubModel::track_error`].
    pub fn complete_trace(&self, trace: Trace) -> Option<BuiltTrace> {
        let built = self.tracer.build_trace(trace)?;
        if built.trace_type != TraceType::Method {
            return Some(built);
        }

        if built.errored {
            let message = built.error_message().unwrap_or_default();
            if let Err(e) = self.errors.track_error(&TrackedError::new(message), &built) {
                warn!("unable to track error of {}: {}", built.id, e);
            }
        }
        self.methods.process_method(built.clone());
        Some(built)
    }

    /// Builds a payload from every model and delivers it. Returns false
    /// when there was nothing to send.
    pub async fn flush(&self) -> Result<bool, SendError> {
        let payload = Payload::default()
            .with_errors(self.errors.build_payload(&self.clock))
            .with_methods(self.methods.build_payload(&self.clock).await)
            .with_pubsub(self.pubsub.build_payload(&self.clock).await);

        if payload.is_empty() {
            debug!("nothing to flush");
            return Ok(false);
        }
        self.sender.send(PAYLOAD_PATH, &payload).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::SessionInfo;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSender {
        sent: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl PayloadSender for CapturingSender {
        async fn send(&self, path: &str, payload: &Payload) -> Result<(), SendError> {
            assert_eq!(path, PAYLOAD_PATH);
            self.sent
                .lock()
                .expect("lock poisoned")
                .push(serde_json::to_value(payload)?);
            Ok(())
        }
    }

    fn agent() -> (Agent, Arc<CapturingSender>) {
        let sender = Arc::new(CapturingSender::default());
        let agent = Agent::new(
            &AgentConfig::default(),
            Arc::new(ClockSync::unsynced()),
            sender.clone(),
        );
        (agent, sender)
    }

    fn traced_method(agent: &Agent, id: &str, error: Option<&str>) -> Trace {
        let tracer = agent.tracer();
        let mut trace = tracer
            .start(&SessionInfo::new("s"), &DdpMessage::method(id, "hello"))
            .expect("methods are traced");
        tracer
            .event_at(&mut trace, EventType::Start, None, 1_000)
            .expect("no filters");
        let db = tracer
            .event_at(&mut trace, EventType::Db, None, 1_002)
            .expect("no filters")
            .and_then(|handle| handle.id())
            .expect("db is repetitive");
        tracer
            .event_end_at(&mut trace, db, None, 1_010)
            .expect("no filters");
        match error {
            Some(message) => {
                let mut data = EventData::new();
                data.insert("error".to_string(), json!({ "message": message }));
                tracer
                    .event_at(&mut trace, EventType::Error, Some(data), 1_012)
                    .expect("no filters");
            }
            None => {
                tracer
                    .event_at(&mut trace, EventType::Complete, None, 1_012)
                    .expect("no filters");
            }
        }
        trace
    }

    #[tokio::test]
    async fn test_flush_without_data_sends_nothing() {
        let (agent, sender) = agent();
        assert!(!agent.flush().await.expect("flush"));
        assert!(sender.sent.lock().expect("lock poisoned").is_empty());
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_completed_method_is_flushed() {
        let (agent, sender) = agent();
        let built = agent
            .complete_trace(traced_method(&agent, "1", None))
            .expect("valid trace");
        assert_eq!(built.metrics.total, 12);
        assert_eq!(built.metrics.category("db"), 8);
        assert_eq!(built.metrics.compute, 4);

        assert!(agent.flush().await.expect("flush"));
        let sent = sender.sent.lock().expect("lock poisoned").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["methodMetrics"][0]["methods"]["hello"]["count"], json!(1));
        assert!(sent[0].get("errors").is_none());
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_errored_method_reaches_error_model() {
        let (agent, sender) = agent();
        agent.complete_trace(traced_method(&agent, "1", Some("boom")));
        assert_eq!(agent.errors().error_count(), 1);

        assert!(agent.flush().await.expect("flush"));
        let sent = sender.sent.lock().expect("lock poisoned").clone();
        assert_eq!(sent[0]["errors"][0]["name"], json!("boom"));
        assert_eq!(sent[0]["errors"][0]["type"], json!("method"));
        assert_eq!(sent[0]["methodMetrics"][0]["methods"]["hello"]["errors"], json!(1));
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_incomplete_trace_is_dropped() {
        let (agent, _sender) = agent();
        let tracer = agent.tracer();
        let mut trace = tracer
            .start(&SessionInfo::new("s"), &DdpMessage::method("1", "hello"))
            .expect("methods are traced");
        tracer
            .event(&mut trace, EventType::Start, None)
            .expect("no filters");
        assert!(agent.complete_trace(trace).is_none());
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_subscription_trace_is_returned() {
        let (agent, _sender) = agent();
        let tracer = agent.tracer();
        let mut trace = tracer
            .start(&SessionInfo::new("s"), &DdpMessage::sub("1", "posts"))
            .expect("subscriptions are traced");
        tracer
            .event_at(&mut trace, EventType::Start, None, 0)
            .expect("no filters");
        tracer
            .event_at(&mut trace, EventType::Complete, None, 5)
            .expect("no filters");
        let built = agent.complete_trace(trace).expect("valid trace");
        assert_eq!(built.trace_type, TraceType::Sub);
        assert_eq!(agent.errors().error_count(), 0);
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_wait_event_carries_backlog() {
        let (agent, _sender) = agent();
        let tracer = agent.tracer();
        let in_flight = DdpMessage::method("1", "slow");
        let unblock = agent.wait_time().track_wait_time("s", &in_flight, || {});

        let mut trace = tracer
            .start(&SessionInfo::new("s"), &DdpMessage::method("3", "hello"))
            .expect("methods are traced");
        tracer
            .event_at(&mut trace, EventType::Start, None, 1_000)
            .expect("no filters");
        let wait = agent
            .begin_wait_at(&mut trace, &[DdpMessage::sub("2", "posts")], 1_000)
            .expect("no filters")
            .expect("wait is repetitive");
        unblock.call();
        assert!(agent.end_wait_at(&mut trace, wait, 1_030).expect("no filters"));
        assert_eq!(agent.wait_time().pending(), 0);
        assert_eq!(agent.wait_time().cached(), 0);
        tracer
            .event_at(&mut trace, EventType::Complete, None, 1_040)
            .expect("no filters");

        let built = agent.complete_trace(trace).expect("valid trace");
        assert_eq!(built.metrics.category("wait"), 30);
        assert_eq!(built.metrics.compute, 10);

        let wait_event = &built.events[1];
        assert_eq!(wait_event.name, "wait");
        assert_eq!(wait_event.elapsed, 30);
        let wait_on = &wait_event.data.as_ref().expect("wait data")["waitOn"];
        assert_eq!(wait_on[0]["id"], json!("1"));
        assert_eq!(wait_on[0]["method"], json!("slow"));
        assert!(wait_on[0]["waitTime"].is_i64());
        assert_eq!(wait_on[1], json!({"msg": "sub", "id": "2", "name": "posts"}));
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_wait_without_backlog_is_empty() {
        let (agent, _sender) = agent();
        let mut trace = agent
            .tracer()
            .start(&SessionInfo::new("s"), &DdpMessage::method("1", "hello"))
            .expect("methods are traced");
        agent
            .tracer()
            .event_at(&mut trace, EventType::Start, None, 0)
            .expect("no filters");
        let wait = agent
            .begin_wait_at(&mut trace, &[], 0)
            .expect("no filters")
            .expect("wait is repetitive");
        assert!(agent.end_wait_at(&mut trace, wait, 0).expect("no filters"));
        let data = trace.events[2].data.clone().expect("wait end data");
        assert_eq!(data["waitOn"], json!([]));
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (agent, _sender) = agent();
        let clock_task = agent.start();
        assert!(clock_task.is_some());
        assert!(agent.start().is_none());
        agent.stop();
        if let Some(task) = clock_task {
            task.await.expect("clock task failed");
        }
        agent.shutdown();
    }
}
