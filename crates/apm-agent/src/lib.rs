// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM Agent
//!
//! Telemetry pipeline of an application-performance-monitoring agent embedded
//! in an application server.
//!
//! ## Overview
//!
//! - [`tracer`]: request lifecycle state machine producing normalized traces
//! - [`tracer_store`]: bounded, outlier-driven retention of traces per kind
//! - [`ntp`]: clock offset estimation against the collector's time endpoint
//! - [`wait_time`]: queue-wait attribution for sequentially processed messages
//! - [`models`]: per-minute method, publication and error aggregates
//! - [`sender`]: payload delivery with retry
//! - [`agent`]: service object wiring the pieces together

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod errors;
pub mod http_utils;
pub mod models;
pub mod ntp;
pub mod payload;
pub mod retry;
pub mod sender;
pub mod trace;
pub mod tracer;
pub mod tracer_store;
pub mod tracer_store_service;
pub mod wait_time;
