use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::order_cache::{LookupError, OrderCache};
use crate::domain::ports::{Clock, QueueStore, StoreError};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Daily counters are kept for a week.
pub const DAILY_STATS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayType {
    Paytm,
    Phonepe,
    Gpay,
    Bhim,
}

impl PayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayType::Paytm => "paytm",
            PayType::Phonepe => "phonepe",
            PayType::Gpay => "gpay",
            PayType::Bhim => "bhim",
        }
    }
}

impl fmt::Display for PayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paytm" => Ok(PayType::Paytm),
            "phonepe" => Ok(PayType::Phonepe),
            "gpay" => Ok(PayType::Gpay),
            "bhim" => Ok(PayType::Bhim),
            other => Err(format!("unsupported pay type '{other}'")),
        }
    }
}

/// What a stats record counts: a visit to the UPI payment page, or a click
/// on one of its wallet buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Access,
    Click(PayType),
}

impl StatsKind {
    pub fn total_key(&self) -> String {
        match self {
            StatsKind::Access => "stats:upi:access:count".to_string(),
            StatsKind::Click(pay_type) => format!("stats:upi:payment:{pay_type}:click"),
        }
    }

    pub fn daily_key(&self, date: &str) -> String {
        match self {
            StatsKind::Access => format!("stats:upi:daily:{date}"),
            StatsKind::Click(_) => format!("stats:upi:payment:daily:{date}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRecord {
    pub upi_id: String,
    pub kind: StatsKind,
}

impl StatsRecord {
    pub fn access(upi_id: impl Into<String>) -> Self {
        Self {
            upi_id: upi_id.into(),
            kind: StatsKind::Access,
        }
    }

    pub fn click(upi_id: impl Into<String>, pay_type: PayType) -> Self {
        Self {
            upi_id: upi_id.into(),
            kind: StatsKind::Click(pay_type),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply one stats record: resolve the order's channel, then bump the total
/// and daily sorted sets for that channel.
///
/// The lookup and the increments are independent store calls.
pub async fn record_stats(
    cache: &OrderCache,
    store: &dyn QueueStore,
    clock: &dyn Clock,
    record: &StatsRecord,
) -> Result<(), StatsError> {
    let state = cache.order_state_by_upi_id(&record.upi_id).await?;
    let member = format!("channel_{}", state.channel_id);

    let now = clock.now();
    let date = now
        .format(DATE_FORMAT)
        .unwrap_or_else(|_| now.date().to_string());

    let total_key = record.kind.total_key();
    let daily_key = record.kind.daily_key(&date);

    store.incr_sorted_set(&total_key, 1.0, &member).await?;
    store.incr_sorted_set(&daily_key, 1.0, &member).await?;
    store.expire(&daily_key, DAILY_STATS_TTL).await?;

    debug!(upi_id = %record.upi_id, member = %member, key = %total_key, "Stats recorded");
    Ok(())
}

/// Non-blocking front for stats recording.
///
/// Records go through a bounded channel to a background task. Submitting never
/// waits; a full or closed channel drops the record with a warning.
#[derive(Clone)]
pub struct StatsRecorder {
    sender: mpsc::Sender<StatsRecord>,
}

impl StatsRecorder {
    pub fn spawn(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(store, clock, DEFAULT_CAPACITY)
    }

    pub fn spawn_with_capacity(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<StatsRecord>(capacity.max(1));
        let cache = OrderCache::new(store.clone());

        let handle = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(e) = record_stats(&cache, store.as_ref(), clock.as_ref(), &record).await
                {
                    warn!(upi_id = %record.upi_id, error = %e, "Failed to record stats");
                }
            }
            debug!("Stats recorder stopped");
        });

        (Self { sender }, handle)
    }

    pub fn submit(&self, record: StatsRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(upi_id = %record.upi_id, "Stats channel full, record dropped");
            }
            Err(TrySendError::Closed(record)) => {
                warn!(upi_id = %record.upi_id, "Stats recorder closed, record dropped");
            }
        }
    }
}
