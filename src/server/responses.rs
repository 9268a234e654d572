use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::infrastructure::LookupError;
use crate::outbound::dispatch::EnqueueError;
use crate::outbound::jobs::JobError;
use crate::security::SignatureError;

pub const SUCCESS_CODE: &str = "0000";

/// Business error codes shared with the rest of the gateway.
pub mod code {
    pub const SERVER_ERROR: u32 = 10101;
    pub const PARAM_BIND_ERROR: u32 = 10103;
    pub const URL_SIGN_ERROR: u32 = 10105;
    pub const CACHE_SET_ERROR: u32 = 10106;
    pub const CACHE_GET_ERROR: u32 = 10107;
    pub const ORDER_NOT_FOUND: u32 = 10125;
}

/// Envelope for successful API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody<T> {
    pub code: String,
    pub msg: String,
    pub data: T,
}

impl<T: Serialize> ResponseBody<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: SUCCESS_CODE.to_string(),
            msg: "success".to_string(),
            data,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    ParamBind(String),

    #[error("Bad Request")]
    UnsafeRequest,

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    CacheGet(String),

    #[error("{0}")]
    CacheSet(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ParamBind(_) | ApiError::UnsafeRequest => StatusCode::BAD_REQUEST,
            ApiError::Signature(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::CacheGet(_) | ApiError::CacheSet(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ApiError::ParamBind(_) | ApiError::UnsafeRequest => code::PARAM_BIND_ERROR,
            ApiError::Signature(_) => code::URL_SIGN_ERROR,
            ApiError::NotFound(_) => code::ORDER_NOT_FOUND,
            ApiError::CacheGet(_) => code::CACHE_GET_ERROR,
            ApiError::CacheSet(_) => code::CACHE_SET_ERROR,
            ApiError::Internal(_) => code::SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        } else {
            warn!(code = self.code(), error = %self, "Request rejected");
        }

        let body = Failure {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound(_) => ApiError::NotFound("Order not found".to_string()),
            LookupError::Store(e) => ApiError::CacheGet(format!("Failed to read order: {e}")),
            LookupError::Decode { key, .. } => {
                ApiError::CacheGet(format!("Failed to parse cached order at '{key}'"))
            }
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Store(e) => ApiError::CacheSet(format!("Failed to enqueue task: {e}")),
            EnqueueError::Serialization(e) => {
                ApiError::Internal(format!("Failed to encode task: {e}"))
            }
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        ApiError::Internal(format!("Job failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StoreError;

    #[test]
    fn test_status_and_codes() {
        let cases = [
            (ApiError::ParamBind("id".to_string()), 400, 10103),
            (ApiError::UnsafeRequest, 400, 10103),
            (ApiError::Signature(SignatureError::SignatureMismatch), 401, 10105),
            (ApiError::NotFound("x".to_string()), 404, 10125),
            (ApiError::CacheGet("x".to_string()), 500, 10107),
            (ApiError::CacheSet("x".to_string()), 500, 10106),
            (ApiError::Internal("x".to_string()), 500, 10101),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_cache_miss_is_not_a_server_error() {
        let err = ApiError::from(LookupError::NotFound("payin:upi:x:no".to_string()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = ApiError::from(LookupError::Store(StoreError::ConnectionError(
            "down".to_string(),
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_success_envelope() {
        let body = serde_json::to_value(ResponseBody::success(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(body["code"], "0000");
        assert_eq!(body["msg"], "success");
        assert_eq!(body["data"]["a"], 1);
    }
}
