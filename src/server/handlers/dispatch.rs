use axum::Json;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::tasks::first_param;
use crate::domain::{BodyFormat, NotificationTask, OrderType, Params, QueryTask};
use crate::outbound::dispatch::ORDER_QUERY_QUEUE;
use crate::outbound::jobs::{CommandJob, JobOutcome};
use crate::server::AppState;
use crate::server::middleware::{content_type, request_params};
use crate::server::responses::{ApiError, ResponseBody};

/// Fields that steer delivery and are never forwarded to the merchant.
/// `order_no`, `merchant_no` and `order_type` stay in the payload.
const RESERVED_NOTIFY_FIELDS: [&str; 4] = ["notify_url", "body_format", "sign", "timestamp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enqueued {
    pub order_no: String,
    pub queue: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedOrderNo {
    pub order_no: String,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: i64,
    /// Response body of the job's command; absent for jobs without one.
    pub body: Option<String>,
}

fn required(params: &Params, key: &str) -> Result<String, ApiError> {
    first_param(params, key)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::ParamBind(format!("Missing {key} parameter")))
}

fn order_type(params: &Params) -> Result<OrderType, ApiError> {
    required(params, "order_type")?
        .parse()
        .map_err(ApiError::ParamBind)
}

/// Queue a merchant notification. Every field except the delivery settings
/// is forwarded to the merchant as a notification parameter.
pub async fn notify(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResponseBody<Enqueued>>, ApiError> {
    let mut params = request_params(query.as_deref(), content_type(&headers), &body);

    let order_no = required(&params, "order_no")?;
    let merchant_no = required(&params, "merchant_no")?;
    let notify_url = required(&params, "notify_url")?;
    let order_type = order_type(&params)?;
    let body_format = match first_param(&params, "body_format") {
        Some(raw) => raw.parse::<BodyFormat>().map_err(ApiError::ParamBind)?,
        None => BodyFormat::default(),
    };

    params.retain(|key, _| !RESERVED_NOTIFY_FIELDS.contains(&key.as_str()));

    let task = NotificationTask::new(
        order_no,
        merchant_no,
        notify_url,
        order_type,
        params,
        state.clock.now(),
    )
    .with_body_format(body_format)
    .sign_with(&state.signature);

    let queue = state.notify_queue.enqueue(&task).await?;
    info!(order_no = %task.order_no, queue = %queue, "Notification queued");

    Ok(Json(ResponseBody::success(Enqueued {
        order_no: task.order_no,
        queue,
    })))
}

/// Queue an upstream status re-poll for an order.
pub async fn query(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResponseBody<Enqueued>>, ApiError> {
    let params = request_params(query.as_deref(), content_type(&headers), &body);

    let task = QueryTask::new(
        required(&params, "order_no")?,
        required(&params, "transaction_no")?,
        required(&params, "channel_no")?,
        order_type(&params)?,
        required(&params, "merchant_no")?,
        state.clock.now(),
    );

    state.query_queue.enqueue(&task).await?;
    info!(order_no = %task.order_no, "Order query queued");

    Ok(Json(ResponseBody::success(Enqueued {
        order_no: task.order_no,
        queue: ORDER_QUERY_QUEUE.to_string(),
    })))
}

/// Issue a fresh order number for a producer about to create an order.
pub async fn order_no(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResponseBody<IssuedOrderNo>>, ApiError> {
    let params = request_params(query.as_deref(), content_type(&headers), &body);
    let order_type = order_type(&params)?;

    let order_no = state.order_nos.for_order_type(order_type);
    info!(order_no = %order_no, "Order number issued");

    Ok(Json(ResponseBody::success(IssuedOrderNo {
        order_no,
        order_type,
    })))
}

/// Run a scheduled job now. The external scheduler calls this whenever the
/// job's cron spec fires.
pub async fn run_job(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResponseBody<JobRun>>, ApiError> {
    let params = request_params(query.as_deref(), content_type(&headers), &body);

    let id = required(&params, "job_id")?
        .parse::<i64>()
        .map_err(|_| ApiError::ParamBind("Invalid job_id parameter".to_string()))?;
    let job = CommandJob {
        id,
        name: required(&params, "name")?,
        spec: first_param(&params, "spec").unwrap_or_default().to_string(),
        command_url: first_param(&params, "command_url")
            .filter(|url| !url.is_empty())
            .map(str::to_string),
    };

    let body = match state.jobs.run_now(&job).await? {
        JobOutcome::Logged => None,
        JobOutcome::Completed { body } => Some(body),
    };

    Ok(Json(ResponseBody::success(JobRun { job_id: id, body })))
}
