// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::tracer_store::TracerStoreOptions;

const DEFAULT_ENDPOINT: &str = "https://engine.montiapm.com";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Collector base url, also serving the time endpoint
    pub endpoint: String,
    /// Application credentials sent with every payload
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// How often a payload is built and delivered
    pub flush_interval: Duration,
    /// How often the trace stores close an interval
    pub trace_interval: Duration,
    /// Interval maxima kept per trace kind
    pub max_total_points: usize,
    /// Unconditional archival period, in intervals
    pub archive_every: u64,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            app_id: None,
            app_secret: None,
            log_level: "info".to_string(),
            flush_interval: Duration::from_secs(10),
            trace_interval: Duration::from_secs(60),
            max_total_points: 30,
            archive_every: 5,
            https_proxy: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let endpoint = env::var("APM_ENDPOINT").unwrap_or(defaults.endpoint);
        let app_id = env::var("APM_APP_ID").ok();
        let app_secret = env::var("APM_APP_SECRET").ok();
        let log_level = env::var("APM_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let flush_interval = parse_var::<u64>("APM_FLUSH_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.flush_interval);
        let trace_interval = parse_var::<u64>("APM_TRACE_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.trace_interval);
        let max_total_points =
            parse_var::<usize>("APM_MAX_TOTAL_POINTS").unwrap_or(defaults.max_total_points);
        let archive_every = parse_var::<u64>("APM_ARCHIVE_EVERY").unwrap_or(defaults.archive_every);
        let https_proxy = env::var("APM_HTTPS_PROXY")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        let config = Self {
            endpoint,
            app_id,
            app_secret,
            log_level,
            flush_interval,
            trace_interval,
            max_total_points,
            archive_every,
            https_proxy,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "APM_ENDPOINT cannot be empty".to_string(),
            ));
        }

        if self.flush_interval.is_zero() || self.trace_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Flush and trace intervals must be greater than 0".to_string(),
            ));
        }

        if self.max_total_points == 0 {
            return Err(ConfigError::Invalid(
                "APM_MAX_TOTAL_POINTS must be greater than 0".to_string(),
            ));
        }

        if self.archive_every == 0 {
            return Err(ConfigError::Invalid(
                "APM_ARCHIVE_EVERY must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Options shared by the method and subscription trace stores.
    pub fn tracer_store_options(&self) -> TracerStoreOptions {
        TracerStoreOptions::new(self.max_total_points, self.trace_interval)
            .with_archive_every(self.archive_every)
    }
}
