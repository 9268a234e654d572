use std::sync::{Arc, Mutex};

use rand::Rng;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use super::ports::{Clock, SystemClock};
use super::tasks::OrderType;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

/// Prefix for pay-in order numbers.
pub const PAYIN_PREFIX: &str = "P";

/// Prefix for pay-out (withdrawal) order numbers.
pub const PAYOUT_PREFIX: &str = "W";

#[derive(Debug, Default)]
struct SequenceState {
    last_timestamp_ms: i128,
    sequence: u32,
}

/// Generates order numbers of the form
/// `prefix + YYYYMMDDHHMMSS + 3-digit random + 3-digit sequence`.
///
/// The sequence increments for every number issued within the same
/// millisecond and resets when the millisecond advances.
pub struct OrderNoGenerator {
    state: Mutex<SequenceState>,
    clock: Arc<dyn Clock>,
}

impl OrderNoGenerator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(SequenceState::default()),
            clock,
        }
    }

    pub fn generate(&self, prefix: &str) -> String {
        let (now, sequence) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = self.clock.now();
            let timestamp_ms = now.unix_timestamp_nanos() / 1_000_000;

            if timestamp_ms == state.last_timestamp_ms {
                state.sequence += 1;
            } else {
                state.sequence = 0;
                state.last_timestamp_ms = timestamp_ms;
            }

            (now, state.sequence)
        };

        let random: u32 = rand::thread_rng().gen_range(0..1000);
        let timestamp = now
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());

        format!("{prefix}{timestamp}{random:03}{sequence:03}")
    }

    pub fn payin_order_no(&self) -> String {
        self.generate(PAYIN_PREFIX)
    }

    pub fn payout_order_no(&self) -> String {
        self.generate(PAYOUT_PREFIX)
    }

    pub fn for_order_type(&self, order_type: OrderType) -> String {
        match order_type {
            OrderType::Payin => self.payin_order_no(),
            OrderType::Payout => self.payout_order_no(),
        }
    }
}

impl Default for OrderNoGenerator {
    fn default() -> Self {
        Self::new()
    }
}
