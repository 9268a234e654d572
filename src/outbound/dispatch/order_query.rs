use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::http_client::{DeliveryError, DispatchHttpClient};
use crate::domain::QueryTask;

/// Result of one upstream re-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Upstream reported a final status.
    Resolved,
    /// Upstream has no final status yet; poll again later.
    Pending,
}

/// Re-polls an upstream payment channel for the final status of an order.
#[async_trait]
pub trait OrderQuerier: Send + Sync {
    async fn query(&self, task: &QueryTask) -> Result<QueryOutcome, DeliveryError>;

    /// `false` when the querier has nowhere to send re-polls. The executor
    /// then leaves query tasks queued instead of draining them.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Posts the task as JSON to a configured endpoint. An acknowledging body
/// means resolved; any other answer means still pending.
pub struct HttpOrderQuerier {
    client: Arc<DispatchHttpClient>,
    url: Option<String>,
}

impl HttpOrderQuerier {
    pub fn new(client: Arc<DispatchHttpClient>, url: Option<String>) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl OrderQuerier for HttpOrderQuerier {
    async fn query(&self, task: &QueryTask) -> Result<QueryOutcome, DeliveryError> {
        let url = self.url.as_deref().ok_or(DeliveryError::EmptyUrl)?;

        match self.client.post_json(url, task).await {
            Ok(_) => Ok(QueryOutcome::Resolved),
            Err(DeliveryError::NotAcknowledged { status, .. }) => {
                debug!(order_no = %task.order_no, status = %status, "Order still pending upstream");
                Ok(QueryOutcome::Pending)
            }
            Err(e) => Err(e),
        }
    }

    fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.is_empty())
    }
}
