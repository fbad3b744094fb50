// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

use crate::models::errors::ErrorDef;
use crate::models::{
    ErrorsPayload, MethodsPayload, MinuteMethodMetrics, MinutePubMetrics, PubsubPayload,
};
use crate::trace::BuiltTrace;

/// Body delivered to the collector. Empty sections are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub method_metrics: Vec<MinuteMethodMetrics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub method_requests: Vec<BuiltTrace>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pub_metrics: Vec<MinutePubMetrics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pub_requests: Vec<BuiltTrace>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
            && self.method_metrics.is_empty()
            && self.method_requests.is_empty()
            && self.pub_metrics.is_empty()
            && self.pub_requests.is_empty()
    }

    pub fn with_errors(mut self, payload: ErrorsPayload) -> Self {
        self.errors.extend(payload.errors);
        self
    }

    pub fn with_methods(mut self, payload: MethodsPayload) -> Self {
        self.method_metrics.extend(payload.method_metrics);
        self.method_requests.extend(payload.method_requests);
        self
    }

    pub fn with_pubsub(mut self, payload: PubsubPayload) -> Self {
        self.pub_metrics.extend(payload.pub_metrics);
        self.pub_requests.extend(payload.pub_requests);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PubMetrics;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_empty_payload_serializes_to_empty_object() {
        let payload = Payload::default();
        assert!(payload.is_empty());
        assert_eq!(
            serde_json::to_value(&payload).expect("serialize"),
            json!({})
        );
    }

    #[test]
    fn test_only_present_sections_are_serialized() {
        let payload = Payload::default().with_pubsub(PubsubPayload {
            pub_metrics: vec![MinutePubMetrics {
                start_time: 60_000,
                pubs: BTreeMap::from([("posts".to_string(), PubMetrics::default())]),
            }],
            pub_requests: Vec::new(),
        });
        assert!(!payload.is_empty());

        let value = serde_json::to_value(&payload).expect("serialize");
        let keys: Vec<&String> = value.as_object().expect("object").keys().collect();
        assert_eq!(keys, vec!["pubMetrics"]);
        assert_eq!(value["pubMetrics"][0]["startTime"], json!(60_000));
    }
}
