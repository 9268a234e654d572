pub mod order_no;
pub mod order_state;
pub mod ports;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use order_no::OrderNoGenerator;
pub use order_state::{OrderState, WalletInfo};
pub use ports::{Clock, QueueStore, StoreError, SystemClock};
pub use tasks::{BodyFormat, NotificationTask, OrderType, Params, QueryTask};
