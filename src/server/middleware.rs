use std::sync::Arc;

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::domain::Params;
use crate::domain::tasks::first_param;
use crate::security::{
    SIGN_PARAM, SafeCheckConfig, SignatureEngine, TIMESTAMP_PARAM, Verdict, is_form_content_type,
    scan_request,
};
use crate::server::responses::ApiError;

/// Largest request body the inbound filters will buffer.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// Union of the query string and, for form requests, the body fields.
pub fn request_params(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> Params {
    let mut params = Params::new();
    let mut collect = |encoded: &[u8]| {
        for (key, value) in form_urlencoded::parse(encoded) {
            params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    };

    if let Some(query) = query {
        collect(query.as_bytes());
    }
    if is_form_content_type(content_type) {
        collect(body);
    }
    params
}

async fn buffer_body(request: Request) -> Result<(axum::http::request::Parts, Bytes), ApiError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::ParamBind(format!("Failed to read request body: {e}")))?;
    Ok((parts, bytes))
}

/// Reject requests whose query, form or JSON values look like SQL injection.
pub async fn safe_check(
    State(config): State<Arc<SafeCheckConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    if !config.applies_to(&path) {
        return Ok(next.run(request).await);
    }

    let (parts, bytes) = buffer_body(request).await?;
    let verdict = scan_request(parts.uri.query(), content_type(&parts.headers), &bytes);

    if let Verdict::Reject { source } = verdict {
        warn!(path = %path, source, "Rejected suspicious request");
        return Err(ApiError::UnsafeRequest);
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Verify `sign` over the request parameters and check the `timestamp`
/// against the replay window.
pub async fn verify_signature(
    State(engine): State<SignatureEngine>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, bytes) = buffer_body(request).await?;
    let mut params = request_params(parts.uri.query(), content_type(&parts.headers), &bytes);

    let signature = params
        .remove(SIGN_PARAM)
        .and_then(|values| values.into_iter().next())
        .filter(|sign| !sign.is_empty())
        .ok_or_else(|| ApiError::ParamBind("Missing sign parameter".to_string()))?;

    let timestamp = first_param(&params, TIMESTAMP_PARAM)
        .ok_or_else(|| ApiError::ParamBind("Missing timestamp parameter".to_string()))?
        .parse::<i64>()
        .map_err(|_| ApiError::ParamBind("Invalid timestamp parameter".to_string()))?;

    engine.verify(timestamp, &signature, &params)?;
    debug!(path = %parts.uri.path(), "Signature verified");

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
