// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use tokio::time::interval;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use apm_agent::{agent::Agent, config::AgentConfig};

#[tokio::main]
pub async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error creating config on apm agent startup: {e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let agent = match Agent::from_config(&config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Error creating apm agent: {e}");
            return;
        }
    };
    agent.start();
    info!("apm agent reporting to {}", config.endpoint);

    let mut flush_interval = interval(config.flush_interval);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = flush_interval.tick() => {
                debug!("Flushing apm payload");
                if let Err(e) = agent.flush().await {
                    error!("Failed to flush apm payload: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down apm agent");
                break;
            }
        }
    }

    if let Err(e) = agent.flush().await {
        error!("Failed to flush apm payload on shutdown: {e}");
    }
    agent.shutdown();
}
