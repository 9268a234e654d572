use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use crate::server::AppState;

/// Liveness: the process is up and serving.
pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Readiness: the queue store answers.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.orders.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Queue store unreachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await;
        assert_eq!(response, StatusCode::OK);
    }
}
