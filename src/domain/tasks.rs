use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::security::SignatureEngine;

/// Ordered multi-map of request or notification parameters.
pub type Params = BTreeMap<String, Vec<String>>;

/// Build a [`Params`] map from key/value pairs, keeping repeated keys.
pub fn params_from_pairs<I, K, V>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params = Params::new();
    for (key, value) in pairs {
        params.entry(key.into()).or_default().push(value.into());
    }
    params
}

/// Return the first value stored under `key`.
pub fn first_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Payin,
    Payout,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Payin => "payin",
            OrderType::Payout => "payout",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payin" => Ok(OrderType::Payin),
            "payout" => Ok(OrderType::Payout),
            other => Err(format!("unknown order type '{other}'")),
        }
    }
}

/// Encoding of the notification body posted to the merchant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Form,
    Json,
}

impl FromStr for BodyFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(BodyFormat::Form),
            "json" => Ok(BodyFormat::Json),
            other => Err(format!("unknown body format '{other}'")),
        }
    }
}

/// A merchant webhook delivery waiting on one of the notification shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTask {
    pub order_no: String,

    pub merchant_no: String,

    pub notify_url: String,

    pub params: Params,

    pub retry_count: u32,

    pub order_type: OrderType,

    #[serde(with = "time::serde::rfc3339")]
    pub next_notify_at: OffsetDateTime,

    #[serde(default)]
    pub body_format: BodyFormat,
}

impl NotificationTask {
    /// Create a task that is due immediately.
    pub fn new(
        order_no: String,
        merchant_no: String,
        notify_url: String,
        order_type: OrderType,
        params: Params,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            order_no,
            merchant_no,
            notify_url,
            params,
            retry_count: 0,
            order_type,
            next_notify_at: now,
            body_format: BodyFormat::Form,
        }
    }

    pub fn with_body_format(mut self, body_format: BodyFormat) -> Self {
        self.body_format = body_format;
        self
    }

    /// Add a `sign` parameter so the merchant can authenticate the callback.
    pub fn sign_with(mut self, engine: &SignatureEngine) -> Self {
        engine.sign_params(&mut self.params);
        self
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.next_notify_at <= now
    }

    /// Count one more failed attempt and push the next attempt out by
    /// `interval`.
    ///
    /// The new time is measured from whichever is later, `now` or the
    /// previous schedule, so `next_notify_at` strictly increases.
    pub fn schedule_retry(&mut self, now: OffsetDateTime, interval: std::time::Duration) {
        let base = now.max(self.next_notify_at);
        self.retry_count += 1;
        self.next_notify_at = base + interval;
    }

    /// Parameters flattened to form pairs, in key order.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.clone(), v.clone())))
            .collect()
    }

    /// Parameters as a JSON object; single values become strings and repeated
    /// keys become arrays.
    pub fn json_body(&self) -> Value {
        let mut body = Map::new();
        for (key, values) in &self.params {
            let value = match values.as_slice() {
                [single] => Value::String(single.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            body.insert(key.clone(), value);
        }
        Value::Object(body)
    }
}

/// An upstream status re-poll for an order whose synchronous query did not
/// resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTask {
    pub order_no: String,

    pub transaction_no: String,

    pub channel_no: String,

    pub order_type: OrderType,

    pub merchant_no: String,

    pub retry_count: u32,

    /// Unix seconds.
    pub created_at: i64,

    /// Unix seconds. Payloads without it are due at once.
    #[serde(default)]
    pub next_query_at: i64,
}

impl QueryTask {
    pub fn new(
        order_no: String,
        transaction_no: String,
        channel_no: String,
        order_type: OrderType,
        merchant_no: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            order_no,
            transaction_no,
            channel_no,
            order_type,
            merchant_no,
            retry_count: 0,
            created_at: now.unix_timestamp(),
            next_query_at: now.unix_timestamp(),
        }
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.next_query_at <= now.unix_timestamp()
    }

    /// Same rule as [`NotificationTask::schedule_retry`]: the next poll is
    /// `interval` after whichever is later, `now` or the previous schedule.
    pub fn schedule_retry(&mut self, now: OffsetDateTime, interval: std::time::Duration) {
        let base = now.unix_timestamp().max(self.next_query_at);
        self.retry_count += 1;
        self.next_query_at = base + interval.as_secs() as i64;
    }
}
