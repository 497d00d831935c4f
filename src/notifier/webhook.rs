//! JSON webhook sink.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{NotificationEvent, NotificationSink};
use crate::error::NotifyError;

const TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 512;

/// POSTs the event as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
}

impl WebhookSink {
    /// `headers` are `Name: value` strings added to every request.
    pub fn new(endpoint: &str, headers: &[String]) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            headers: parse_headers(headers)?,
        })
    }
}

fn parse_headers(headers: &[String]) -> Result<HeaderMap, NotifyError> {
    let mut map = HeaderMap::new();
    for raw in headers {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| NotifyError::InvalidHeader(raw.clone()))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| NotifyError::InvalidHeader(raw.clone()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| NotifyError::InvalidHeader(raw.clone()))?;
        map.append(name, value);
    }
    Ok(map)
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::Request {
                sink: "webhook",
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(NotifyError::Rejected {
            sink: "webhook",
            status: status.as_u16(),
            body,
        })
    }
}
