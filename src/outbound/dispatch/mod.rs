// Outbound dispatch
//
// Queues (producer side):
//   notify_queue – sharded merchant notification queue
//   query_queue  – single upstream order query queue
//
// Consumer side:
//   executor – worker pool draining both queues
//   http_client, order_query, retry_policy – what the workers call into

pub mod executor;
pub mod http_client;
pub mod notify_queue;
pub mod order_query;
pub mod query_queue;
pub mod retry_policy;
pub mod schemas;

pub use executor::{DeliveryExecutor, ExecutorConfig};
pub use http_client::{DeliveryError, DispatchHttpClient, is_success_body};
pub use notify_queue::{
    EnqueueError, MERCHANT_NOTIFY_QUEUE, NotifyQueue, QUEUE_SHARD_COUNT, shard_index,
    shard_queue_name,
};
pub use order_query::{HttpOrderQuerier, OrderQuerier, QueryOutcome};
pub use query_queue::{ORDER_QUERY_QUEUE, OrderQueryQueue};
pub use retry_policy::RetryPolicy;
pub use schemas::{BatchReport, Disposition};
