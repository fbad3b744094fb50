// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Raised by a user supplied filter. The filter that produced it has already
/// been removed from its chain when the caller sees this error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("an error thrown from a filter you've supplied: {message}")]
pub struct FilterError {
    pub message: String,
}

impl FilterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur while querying the time endpoint
#[derive(Debug, thiserror::Error)]
pub enum NtpError {
    #[error("time endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("time endpoint answered with status {0}")]
    Status(u16),

    #[error("unable to parse server time from {0:?}")]
    Parse(String),
}

/// Errors that can occur when delivering a payload
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("network error after {attempts} attempts: {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("collector rejected payload with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unable to build http client: {0}")]
    Client(String),
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while assembling an agent from its configuration
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unable to set up time sync: {0}")]
    Ntp(#[from] NtpError),

    #[error("unable to set up payload delivery: {0}")]
    Send(#[from] SendError),
}
