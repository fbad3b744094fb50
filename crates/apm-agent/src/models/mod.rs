// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-minute aggregates shipped alongside traces.

pub mod errors;
pub mod methods;
pub mod pubsub;

pub use errors::{
    filter_common_errors, filter_validation_errors, ErrorDef, ErrorFilter, ErrorModel, ErrorsPayload,
    TrackedError,
};
pub use methods::{MethodMetrics, MethodsModel, MethodsPayload, MinuteMethodMetrics};
pub use pubsub::{MinutePubMetrics, PubMetrics, PubsubModel, PubsubPayload};

const MINUTE_MS: i64 = 60 * 1000;

/// Start of the minute `timestamp` falls in.
pub(crate) fn date_id(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(MINUTE_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_id() {
        assert_eq!(date_id(0), 0);
        assert_eq!(date_id(59_999), 0);
        assert_eq!(date_id(60_000), 60_000);
        assert_eq!(date_id(1_386_707_472_000), 1_386_707_460_000);
    }
}
