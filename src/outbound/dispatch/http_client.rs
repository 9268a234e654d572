use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{BodyFormat, NotificationTask};

/// Only this many leading body bytes are inspected for an acknowledgement.
pub const SUCCESS_SCAN_BYTES: usize = 256;

/// Error type for outbound dispatch calls
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Target URL is empty")]
    EmptyUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Not acknowledged: status={status}, body={body}")]
    NotAcknowledged { status: StatusCode, body: String },
}

impl DeliveryError {
    /// Permanent errors can never succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::EmptyUrl | DeliveryError::InvalidUrl(_))
    }
}

/// Case-insensitive `success` / `ok` check on a response body prefix.
pub fn is_success_body(body: &str) -> bool {
    let lowered = body.to_lowercase();
    lowered.contains("success") || lowered.contains("ok")
}

/// Acknowledged call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub status: u16,
    pub response_time_ms: u64,
}

/// HTTP client for merchant notifications and upstream order queries.
/// Every request is bounded by the client timeout.
#[derive(Debug, Clone)]
pub struct DispatchHttpClient {
    client: Client,
    timeout: Duration,
}

impl DispatchHttpClient {
    pub fn with_timeout(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("PaymentDispatch/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::RequestFailed(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST a notification to the merchant's `notify_url`, as a form or a JSON
    /// body depending on the task.
    pub async fn send_notification(
        &self,
        task: &NotificationTask,
    ) -> Result<Acknowledgement, DeliveryError> {
        let url = parse_target(&task.notify_url)?;
        let request = self.client.post(url);
        let request = match task.body_format {
            BodyFormat::Form => request.form(&task.form_pairs()),
            BodyFormat::Json => request.json(&task.json_body()),
        };

        debug!(order_no = %task.order_no, url = %task.notify_url, "Sending notification");
        self.send_acknowledged(request).await
    }

    /// POST a JSON document and require an acknowledging body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Acknowledgement, DeliveryError> {
        let url = parse_target(url)?;
        self.send_acknowledged(self.client.post(url).json(body)).await
    }

    async fn send_acknowledged(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Acknowledgement, DeliveryError> {
        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "Dispatch request failed");
            self.classify(e)
        })?;

        let status = response.status();
        let prefix = self.read_prefix(response).await?;
        let response_time_ms = start.elapsed().as_millis() as u64;

        debug!(
            status = %status.as_u16(),
            response_time_ms = %response_time_ms,
            "Dispatch response received"
        );

        if !is_success_body(&prefix) {
            return Err(DeliveryError::NotAcknowledged {
                status,
                body: prefix,
            });
        }

        Ok(Acknowledgement {
            status: status.as_u16(),
            response_time_ms,
        })
    }

    /// Read at most [`SUCCESS_SCAN_BYTES`] of the body, then stop.
    async fn read_prefix(&self, mut response: Response) -> Result<String, DeliveryError> {
        let mut buffer = Vec::with_capacity(SUCCESS_SCAN_BYTES);

        while buffer.len() < SUCCESS_SCAN_BYTES {
            let chunk = response.chunk().await.map_err(|e| self.classify(e))?;
            let Some(chunk) = chunk else {
                break;
            };
            let take = chunk.len().min(SUCCESS_SCAN_BYTES - buffer.len());
            buffer.extend_from_slice(&chunk[..take]);
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn classify(&self, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else if err.is_connect() {
            DeliveryError::NetworkError(err.to_string())
        } else if err.is_builder() {
            DeliveryError::InvalidUrl(err.to_string())
        } else {
            DeliveryError::RequestFailed(err.to_string())
        }
    }
}

fn parse_target(raw: &str) -> Result<Url, DeliveryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DeliveryError::EmptyUrl);
    }
    Url::parse(trimmed).map_err(|e| DeliveryError::InvalidUrl(format!("{trimmed}: {e}")))
}
