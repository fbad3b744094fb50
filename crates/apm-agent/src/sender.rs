// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::errors::SendError;
use crate::http_utils::{build_client, join_url};
use crate::payload::Payload;
use crate::retry::{RetryOptions, Sleeper, TokioSleeper};

const MAX_ATTEMPTS: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const APP_ID_HEADER: &str = "kadira-app-id";
const APP_SECRET_HEADER: &str = "kadira-app-secret";

/// Delivers payloads to the collector.
#[async_trait]
pub trait PayloadSender: Send + Sync {
    async fn send(&self, path: &str, payload: &Payload) -> Result<(), SendError>;
}

/// Application credentials attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
}

impl Credentials {
    fn headers(&self) -> Result<HeaderMap, SendError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in [
            (APP_ID_HEADER, &self.app_id),
            (APP_SECRET_HEADER, &self.app_secret),
        ] {
            if let Some(value) = value {
                let value = HeaderValue::from_str(value)
                    .map_err(|e| SendError::Client(format!("invalid {name} header: {e}")))?;
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }
}

/// JSON over HTTP POST. Network errors are retried on the
/// [`RetryOptions::send`] schedule, any answer from the collector is final.
pub struct HttpSender {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    retry: RetryOptions,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpSender {
    pub fn new(
        endpoint: &str,
        credentials: &Credentials,
        proxy_url: Option<&str>,
    ) -> Result<Self, SendError> {
        let client = build_client(proxy_url, REQUEST_TIMEOUT)
            .map_err(|e| SendError::Client(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            headers: credentials.headers()?,
            retry: RetryOptions::send(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_retry(mut self, retry: RetryOptions, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = retry;
        self.sleeper = sleeper;
        self
    }

    async fn send_body(&self, url: &str, body: Vec<u8>) -> Result<(), SendError> {
        let mut attempts = 0;
        loop {
            self.sleeper.sleep(self.retry.timeout(attempts)).await;
            attempts += 1;

            let time = Instant::now();
            let response = self
                .client
                .post(url)
                .headers(self.headers.clone())
                .body(body.clone())
                .send()
                .await;
            let elapsed = time.elapsed();

            match response {
                Ok(r) => {
                    let status = r.status();
                    if status == 202 || status == 200 {
                        debug!(
                            "Sender | Successfully sent payload in {} ms to {url}",
                            elapsed.as_millis()
                        );
                        return Ok(());
                    }
                    let body = r.text().await.unwrap_or_default();
                    error!("Sender | Request failed with status {status}: {body}");
                    return Err(SendError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) => {
                    warn!("Sender | Network error (attempt {}): {}", attempts, e);
                    if attempts >= MAX_ATTEMPTS {
                        error!(
                            "Sender | Failed to send payload after {} attempts",
                            attempts
                        );
                        return Err(SendError::Network {
                            attempts,
                            source: e,
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PayloadSender for HttpSender {
    async fn send(&self, path: &str, payload: &Payload) -> Result<(), SendError> {
        let body = serde_json::to_vec(payload)?;
        let url = join_url(&self.endpoint, path);
        self.send_body(&url, body).await
    }
}
