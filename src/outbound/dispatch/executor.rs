use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::http_client::DispatchHttpClient;
use super::notify_queue::{NotifyQueue, hold_token};
use super::order_query::{OrderQuerier, QueryOutcome};
use super::query_queue::OrderQueryQueue;
use super::retry_policy::RetryPolicy;
use super::schemas::{BatchReport, Disposition};
use crate::config::DispatchConfig;
use crate::domain::ports::{Clock, StoreError};
use crate::domain::{NotificationTask, QueryTask};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 50;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Tasks popped per queue per cycle.
    pub batch_size: usize,

    /// Outbound calls in flight per worker.
    pub max_concurrent_requests: usize,

    pub retry: RetryPolicy,

    /// Sleep between cycles when a queue has nothing due.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&DispatchConfig> for ExecutorConfig {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            retry: RetryPolicy::new(config.max_retry_count, config.retry_interval()),
            poll_interval: config.poll_interval(),
        }
    }
}

/// A decoded task together with the payload it was claimed as.
struct Claimed<T> {
    payload: String,
    task: T,
}

/// Drains the dispatch queues and performs the outbound calls.
///
/// [`DeliveryExecutor::start`] spawns one worker per notification shard and
/// one for the order query queue. Each worker claims a batch into the queue's
/// processing list, processes it and sleeps for the poll interval when
/// nothing in the batch was due. A payload leaves the processing list only
/// after its task has been delivered, requeued or dead-lettered, and a
/// worker returns whatever a previous run left there before it starts.
///
/// Within a notification batch, tasks are grouped by order. Groups run
/// concurrently up to `max_concurrent_requests`; tasks inside a group run one
/// after another. Once a task of an order is deferred or rescheduled, the
/// order's remaining tasks go back on the queue behind it. A rescheduled task
/// also holds its order, so later tasks of that order in later batches wait
/// for it too.
pub struct DeliveryExecutor {
    notify_queue: NotifyQueue,
    query_queue: OrderQueryQueue,
    http: Arc<DispatchHttpClient>,
    querier: Arc<dyn OrderQuerier>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl DeliveryExecutor {
    pub fn new(
        notify_queue: NotifyQueue,
        query_queue: OrderQueryQueue,
        http: Arc<DispatchHttpClient>,
        querier: Arc<dyn OrderQuerier>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            notify_queue,
            query_queue,
            http,
            querier,
            clock,
            config,
        }
    }

    /// Spawn the workers. They stop after their current batch once `token`
    /// is cancelled.
    ///
    /// The order query worker is only spawned when the querier is configured;
    /// otherwise query tasks stay queued.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let shard_count = self.notify_queue.shard_count();
        info!(
            shards = shard_count,
            batch_size = self.config.batch_size,
            max_concurrent_requests = self.config.max_concurrent_requests,
            "Delivery executor starting"
        );

        let mut handles = Vec::with_capacity(shard_count + 1);
        for shard in 0..shard_count {
            let executor = Arc::clone(self);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                executor.run_notify_worker(shard, token).await;
            }));
        }

        if self.querier.is_configured() {
            let executor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                executor.run_query_worker(token).await;
            }));
        } else {
            warn!("No order query URL configured, order query tasks will stay queued");
        }

        handles
    }

    async fn run_notify_worker(&self, shard: usize, token: CancellationToken) {
        debug!(shard, "Notification worker started");

        if let Err(e) = self.notify_queue.recover(shard).await {
            warn!(shard, error = %e, "Failed to recover unsettled notification tasks");
        }

        while !token.is_cancelled() {
            let idle = match self.process_notify_shard_once(shard).await {
                Ok(report) => report.attempted() == 0,
                Err(e) => {
                    warn!(shard, error = %e, "Failed to drain notification shard");
                    true
                }
            };

            if idle && !self.pause(&token).await {
                break;
            }
        }

        debug!(shard, "Notification worker stopped");
    }

    async fn run_query_worker(&self, token: CancellationToken) {
        debug!("Order query worker started");

        if let Err(e) = self.query_queue.recover().await {
            warn!(error = %e, "Failed to recover unsettled order query tasks");
        }

        while !token.is_cancelled() {
            let idle = match self.process_query_once().await {
                Ok(report) => report.attempted() == 0,
                Err(e) => {
                    warn!(error = %e, "Failed to drain order query queue");
                    true
                }
            };

            if idle && !self.pause(&token).await {
                break;
            }
        }

        debug!("Order query worker stopped");
    }

    /// Returns `false` when cancelled during the pause.
    async fn pause(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }

    /// Claim and process one batch from a notification shard.
    pub async fn process_notify_shard_once(&self, shard: usize) -> Result<BatchReport, StoreError> {
        let raw = self
            .notify_queue
            .claim_batch(shard, self.config.batch_size)
            .await?;
        let mut report = BatchReport::default();
        if raw.is_empty() {
            return Ok(report);
        }

        let mut groups: Vec<Vec<Claimed<NotificationTask>>> = Vec::new();
        let mut by_order: HashMap<String, usize> = HashMap::new();
        for payload in raw {
            match serde_json::from_str::<NotificationTask>(&payload) {
                Ok(task) => {
                    let slot = *by_order.entry(task.order_no.clone()).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[slot].push(Claimed { payload, task });
                }
                Err(e) => {
                    let disposition = self
                        .park_raw_notification(&payload, &format!("Undecodable task: {e}"))
                        .await;
                    let disposition = self.settle_notification(shard, &payload, disposition).await;
                    report.record(&disposition);
                }
            }
        }

        let now = self.clock.now();
        let permits = Semaphore::new(self.config.max_concurrent_requests.max(1));
        let results = join_all(groups.into_iter().map(|group| {
            let permits = &permits;
            async move {
                let Ok(_permit) = permits.acquire().await else {
                    return BatchReport::default();
                };
                self.process_order_group(shard, group, now).await
            }
        }))
        .await;

        for group_report in results {
            report.merge(group_report);
        }

        debug!(
            shard,
            delivered = report.delivered,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "Notification batch processed"
        );
        Ok(report)
    }

    /// Run the claimed tasks of one order in submission order.
    ///
    /// While the order is held, only the held task may be attempted. Once any
    /// task of the order goes back on the queue, every later one follows it.
    async fn process_order_group(
        &self,
        shard: usize,
        group: Vec<Claimed<NotificationTask>>,
        now: OffsetDateTime,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let Some(order_no) = group.first().map(|claimed| claimed.task.order_no.clone()) else {
            return report;
        };

        let (mut holder, mut blocked) = match self.notify_queue.holder(&order_no).await {
            Ok(holder) => (holder, false),
            Err(e) => {
                warn!(order_no = %order_no, error = %e, "Failed to read order hold");
                (None, true)
            }
        };

        for claimed in group {
            let is_holder = holder.as_deref() == Some(hold_token(&claimed.task).as_str());
            let may_attempt = if holder.is_some() { is_holder } else { !blocked };

            if !may_attempt || !claimed.task.is_due(now) {
                report.record(&self.push_back(shard, claimed).await);
                blocked = true;
                continue;
            }

            let Claimed { payload, task } = claimed;
            let disposition = self.deliver(task).await;
            let disposition = self.settle_notification(shard, &payload, disposition).await;
            report.record(&disposition);

            match disposition {
                Disposition::Delivered | Disposition::DeadLettered { .. } => holder = None,
                _ => blocked = true,
            }
        }

        report
    }

    async fn deliver(&self, mut task: NotificationTask) -> Disposition {
        let error = match self.http.send_notification(&task).await {
            Ok(ack) => {
                info!(
                    order_no = %task.order_no,
                    merchant_no = %task.merchant_no,
                    retry_count = task.retry_count,
                    status_code = ack.status,
                    response_time_ms = ack.response_time_ms,
                    "Notification delivered"
                );
                self.release_hold(&task).await;
                return Disposition::Delivered;
            }
            Err(e) => e,
        };

        if error.is_permanent() {
            return self.park_notification(&task, error.to_string()).await;
        }

        if !self.config.retry.should_retry(task.retry_count) {
            let reason = format!("Failed after {} retries: {error}", task.retry_count);
            return self.park_notification(&task, reason).await;
        }

        task.schedule_retry(self.clock.now(), self.config.retry.interval());
        warn!(
            order_no = %task.order_no,
            retry_count = task.retry_count,
            max_retry_count = self.config.retry.max_retry_count(),
            error = %error,
            "Notification failed, will retry"
        );

        if let Err(e) = self.notify_queue.enqueue(&task).await {
            error!(order_no = %task.order_no, error = %e, "Failed to reschedule notification");
            return Disposition::Dropped {
                reason: e.to_string(),
            };
        }

        if let Err(e) = self.notify_queue.hold(&task).await {
            warn!(order_no = %task.order_no, error = %e, "Failed to hold order for retry");
        }
        Disposition::Rescheduled {
            retry_count: task.retry_count,
            next_attempt_at: Some(task.next_notify_at),
        }
    }

    /// A task that has been retried may be holding its order.
    async fn release_hold(&self, task: &NotificationTask) {
        if task.retry_count == 0 {
            return;
        }
        if let Err(e) = self.notify_queue.release(&task.order_no).await {
            warn!(order_no = %task.order_no, error = %e, "Failed to release order hold");
        }
    }

    async fn push_back(&self, shard: usize, claimed: Claimed<NotificationTask>) -> Disposition {
        let disposition = match self.notify_queue.enqueue(&claimed.task).await {
            Ok(_) => Disposition::Deferred,
            Err(e) => {
                error!(order_no = %claimed.task.order_no, error = %e, "Failed to push back notification");
                Disposition::Dropped {
                    reason: e.to_string(),
                }
            }
        };
        self.settle_notification(shard, &claimed.payload, disposition).await
    }

    /// Ack the claimed payload once the task has a new home. A dropped task
    /// stays in the processing list for the next worker start.
    async fn settle_notification(
        &self,
        shard: usize,
        payload: &str,
        disposition: Disposition,
    ) -> Disposition {
        if matches!(disposition, Disposition::Dropped { .. }) {
            return disposition;
        }
        if let Err(e) = self.notify_queue.ack(shard, payload).await {
            warn!(shard, error = %e, "Failed to ack settled notification task");
        }
        disposition
    }

    async fn park_notification(&self, task: &NotificationTask, reason: String) -> Disposition {
        match self.notify_queue.dead_letter(task, &reason).await {
            Ok(()) => {
                self.release_hold(task).await;
                Disposition::DeadLettered {
                    retry_count: task.retry_count,
                    reason,
                }
            }
            Err(e) => {
                error!(order_no = %task.order_no, error = %e, "Failed to dead-letter notification");
                Disposition::Dropped { reason }
            }
        }
    }

    async fn park_raw_notification(&self, payload: &str, reason: &str) -> Disposition {
        error!(reason = %reason, "Dead-lettering undecodable notification payload");
        match self.notify_queue.dead_letter_raw(payload).await {
            Ok(()) => Disposition::DeadLettered {
                retry_count: 0,
                reason: reason.to_string(),
            },
            Err(e) => {
                error!(error = %e, "Failed to dead-letter notification payload");
                Disposition::Dropped {
                    reason: reason.to_string(),
                }
            }
        }
    }

    /// Claim and process one batch from the order query queue. Tasks whose
    /// next poll is still ahead go back on the queue untouched.
    pub async fn process_query_once(&self) -> Result<BatchReport, StoreError> {
        let raw = self.query_queue.claim_batch(self.config.batch_size).await?;
        let mut report = BatchReport::default();
        if raw.is_empty() {
            return Ok(report);
        }

        let now = self.clock.now();
        let mut due = Vec::with_capacity(raw.len());
        for payload in raw {
            let disposition = match serde_json::from_str::<QueryTask>(&payload) {
                Ok(task) if task.is_due(now) => {
                    due.push(Claimed { payload, task });
                    continue;
                }
                Ok(task) => match self.query_queue.enqueue(&task).await {
                    Ok(()) => Disposition::Deferred,
                    Err(e) => {
                        error!(order_no = %task.order_no, error = %e, "Failed to push back order query");
                        Disposition::Dropped {
                            reason: e.to_string(),
                        }
                    }
                },
                Err(e) => {
                    error!(error = %e, "Dead-lettering undecodable order query payload");
                    match self.query_queue.dead_letter_raw(&payload).await {
                        Ok(()) => Disposition::DeadLettered {
                            retry_count: 0,
                            reason: e.to_string(),
                        },
                        Err(store_err) => Disposition::Dropped {
                            reason: store_err.to_string(),
                        },
                    }
                }
            };
            report.record(&self.settle_query(&payload, disposition).await);
        }

        let permits = Semaphore::new(self.config.max_concurrent_requests.max(1));
        let dispositions = join_all(due.into_iter().map(|claimed| {
            let permits = &permits;
            async move {
                let Ok(_permit) = permits.acquire().await else {
                    return Disposition::Dropped {
                        reason: "concurrency limiter closed".to_string(),
                    };
                };
                let disposition = self.run_query(claimed.task).await;
                self.settle_query(&claimed.payload, disposition).await
            }
        }))
        .await;

        for disposition in &dispositions {
            report.record(disposition);
        }

        debug!(
            resolved = report.delivered,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "Order query batch processed"
        );
        Ok(report)
    }

    async fn run_query(&self, mut task: QueryTask) -> Disposition {
        let reason = match self.querier.query(&task).await {
            Ok(QueryOutcome::Resolved) => {
                info!(
                    order_no = %task.order_no,
                    channel_no = %task.channel_no,
                    retry_count = task.retry_count,
                    "Order status resolved"
                );
                return Disposition::Delivered;
            }
            Ok(QueryOutcome::Pending) => "still pending".to_string(),
            Err(e) if e.is_permanent() => return self.park_query(&task, e.to_string()).await,
            Err(e) => e.to_string(),
        };

        if !self.config.retry.should_retry(task.retry_count) {
            let reason = format!("Gave up after {} retries: {reason}", task.retry_count);
            return self.park_query(&task, reason).await;
        }

        task.schedule_retry(self.clock.now(), self.config.retry.interval());
        debug!(
            order_no = %task.order_no,
            retry_count = task.retry_count,
            next_query_at = task.next_query_at,
            reason = %reason,
            "Order query will retry"
        );

        match self.query_queue.enqueue(&task).await {
            Ok(()) => Disposition::Rescheduled {
                retry_count: task.retry_count,
                next_attempt_at: OffsetDateTime::from_unix_timestamp(task.next_query_at).ok(),
            },
            Err(e) => {
                error!(order_no = %task.order_no, error = %e, "Failed to reschedule order query");
                Disposition::Dropped {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn settle_query(&self, payload: &str, disposition: Disposition) -> Disposition {
        if matches!(disposition, Disposition::Dropped { .. }) {
            return disposition;
        }
        if let Err(e) = self.query_queue.ack(payload).await {
            warn!(error = %e, "Failed to ack settled order query task");
        }
        disposition
    }

    async fn park_query(&self, task: &QueryTask, reason: String) -> Disposition {
        match self.query_queue.dead_letter(task, &reason).await {
            Ok(()) => Disposition::DeadLettered {
                retry_count: task.retry_count,
                reason,
            },
            Err(e) => {
                error!(order_no = %task.order_no, error = %e, "Failed to dead-letter order query");
                Disposition::Dropped { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderType;
    use crate::domain::ports::QueueStore;
    use crate::domain::tasks::{first_param, params_from_pairs};
    use crate::domain::testing::ManualClock;
    use crate::infrastructure::InMemoryQueueStore;
    use crate::outbound::dispatch::http_client::DeliveryError;
    use crate::outbound::dispatch::notify_queue::{QUEUE_SHARD_COUNT, shard_index};
    use crate::outbound::dispatch::order_query::HttpOrderQuerier;
    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::{Form, State};
    use axum::routing::post;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::macros::datetime;

    const REFUSED_URL: &str = "http://127.0.0.1:9/notify";

    /// Reports `Pending` until it has been asked `resolve_on` times.
    struct CountingQuerier {
        calls: AtomicU32,
        resolve_on: u32,
    }

    #[async_trait]
    impl OrderQuerier for CountingQuerier {
        async fn query(&self, _task: &QueryTask) -> Result<QueryOutcome, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.resolve_on {
                Ok(QueryOutcome::Resolved)
            } else {
                Ok(QueryOutcome::Pending)
            }
        }
    }

    struct Harness {
        store: InMemoryQueueStore,
        clock: Arc<ManualClock>,
        notify_queue: NotifyQueue,
        query_queue: OrderQueryQueue,
        executor: Arc<DeliveryExecutor>,
    }

    fn harness_with_querier(querier: Arc<dyn OrderQuerier>) -> Harness {
        harness_with(
            querier,
            ExecutorConfig {
                poll_interval: Duration::from_millis(10),
                ..ExecutorConfig::default()
            },
        )
    }

    fn harness_with(querier: Arc<dyn OrderQuerier>, config: ExecutorConfig) -> Harness {
        let store = InMemoryQueueStore::new();
        let shared: Arc<dyn QueueStore> = Arc::new(store.clone());
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-20 15:35:01 UTC)));
        let notify_queue = NotifyQueue::new(shared.clone(), QUEUE_SHARD_COUNT);
        let query_queue = OrderQueryQueue::new(shared);
        let http = Arc::new(DispatchHttpClient::with_timeout(Duration::from_secs(2)).unwrap());

        let executor = Arc::new(DeliveryExecutor::new(
            notify_queue.clone(),
            query_queue.clone(),
            http,
            querier,
            clock.clone(),
            config,
        ));

        Harness {
            store,
            clock,
            notify_queue,
            query_queue,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with_querier(Arc::new(CountingQuerier {
            calls: AtomicU32::new(0),
            resolve_on: 1,
        }))
    }

    fn make_task(h: &Harness, order_no: &str, url: &str, seq: &str) -> NotificationTask {
        NotificationTask::new(
            order_no.to_string(),
            "M1001".to_string(),
            url.to_string(),
            OrderType::Payin,
            params_from_pairs([("status", "success"), ("seq", seq)]),
            h.clock.now(),
        )
    }

    async fn shard_tasks(h: &Harness, order_no: &str) -> Vec<NotificationTask> {
        let queue = h.notify_queue.queue_for(order_no);
        h.store
            .list_items(&queue)
            .await
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    type Received = Arc<Mutex<Vec<String>>>;

    async fn spawn_merchant(reply: &'static str) -> (SocketAddr, Received) {
        spawn_merchant_failing_first(0, reply).await
    }

    /// Answers `fail` to the first `failures` calls and `reply` afterwards.
    async fn spawn_merchant_failing_first(
        failures: usize,
        reply: &'static str,
    ) -> (SocketAddr, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route(
                "/notify",
                post(
                    move |State(received): State<Received>,
                          Form(form): Form<Vec<(String, String)>>| async move {
                        let params = params_from_pairs(form);
                        let seq = first_param(&params, "seq").unwrap_or_default().to_string();
                        let mut received = received.lock().unwrap();
                        received.push(seq);
                        if received.len() <= failures { "fail" } else { reply }
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, received)
    }

    #[tokio::test]
    async fn test_acknowledged_notification_is_delivered() {
        let h = harness();
        let (addr, received) = spawn_merchant("success").await;
        let task = make_task(&h, "P20250620153501120001", &format!("http://{addr}/notify"), "1");
        h.notify_queue.enqueue(&task).await.unwrap();

        let shard = shard_index(&task.order_no, QUEUE_SHARD_COUNT);
        let report = h.executor.process_notify_shard_once(shard).await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(received.lock().unwrap().as_slice(), ["1"]);
        assert!(shard_tasks(&h, &task.order_no).await.is_empty());
        assert!(
            h.store
                .list_items(&format!("{}_processing", h.notify_queue.queue_for(&task.order_no)))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_retry_schedule_then_dead_letter() {
        let h = harness();
        let order_no = "P20250620153501120001";
        let shard = shard_index(order_no, QUEUE_SHARD_COUNT);
        let start = h.clock.now();
        h.notify_queue
            .enqueue(&make_task(&h, order_no, REFUSED_URL, "1"))
            .await
            .unwrap();

        for attempt in 1..=3u32 {
            let report = h.executor.process_notify_shard_once(shard).await.unwrap();
            assert_eq!(report.rescheduled, 1);

            let queued = shard_tasks(&h, order_no).await;
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].retry_count, attempt);
            assert_eq!(
                queued[0].next_notify_at - start,
                time::Duration::minutes(attempt as i64)
            );

            h.clock.advance(time::Duration::minutes(1));
        }

        let report = h.executor.process_notify_shard_once(shard).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert!(shard_tasks(&h, order_no).await.is_empty());

        let parked = h.store.list_items("merchant_notify_queue_dead_letter").await;
        let parked: NotificationTask = serde_json::from_str(&parked[0]).unwrap();
        assert_eq!(parked.retry_count, 3);
        assert_eq!(h.notify_queue.holder(order_no).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_task_not_yet_due_is_pushed_back_with_its_followers() {
        let h = harness();
        let order_no = "P20250620153501120001";
        let shard = shard_index(order_no, QUEUE_SHARD_COUNT);

        let mut waiting = make_task(&h, order_no, REFUSED_URL, "1");
        waiting.next_notify_at = h.clock.now() + time::Duration::minutes(1);
        h.notify_queue.enqueue(&waiting).await.unwrap();
        h.notify_queue
            .enqueue(&make_task(&h, order_no, REFUSED_URL, "2"))
            .await
            .unwrap();

        let report = h.executor.process_notify_shard_once(shard).await.unwrap();

        assert_eq!(report.deferred, 2);
        assert_eq!(report.attempted(), 0);
        let queued = shard_tasks(&h, order_no).await;
        let seqs: Vec<_> = queued
            .iter()
            .map(|t| first_param(&t.params, "seq").unwrap().to_string())
            .collect();
        assert_eq!(seqs, ["1", "2"]);
        assert!(queued.iter().all(|t| t.retry_count == 0));
    }

    #[tokio::test]
    async fn test_tasks_of_one_order_are_sent_in_order() {
        let h = harness();
        let (addr, received) = spawn_merchant("ok").await;
        let url = format!("http://{addr}/notify");
        let order_no = "P20250620153501120001";

        for seq in ["1", "2", "3"] {
            h.notify_queue
                .enqueue(&make_task(&h, order_no, &url, seq))
                .await
                .unwrap();
        }

        let shard = shard_index(order_no, QUEUE_SHARD_COUNT);
        let report = h.executor.process_notify_shard_once(shard).await.unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(received.lock().unwrap().as_slice(), ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_failure_holds_back_rest_of_order() {
        let h = harness();
        let (addr, received) = spawn_merchant("fail").await;
        let url = format!("http://{addr}/notify");
        let order_no = "P20250620153501120001";

        h.notify_queue.enqueue(&make_task(&h, order_no, &url, "1")).await.unwrap();
        h.notify_queue.enqueue(&make_task(&h, order_no, &url, "2")).await.unwrap();

        let shard = shard_index(order_no, QUEUE_SHARD_COUNT);
        let report = h.executor.process_notify_shard_once(shard).await.unwrap();

        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(received.lock().unwrap().as_slice(), ["1"]);

        let queued = shard_tasks(&h, order_no).await;
        assert_eq!(queued[0].retry_count, 1);
        assert_eq!(first_param(&queued[1].params, "seq"), Some("2"));
    }

    #[tokio::test]
    async fn test_retry_keeps_later_tasks_of_the_order_waiting() {
        let h = harness_with(
            Arc::new(CountingQuerier {
                calls: AtomicU32::new(0),
                resolve_on: 1,
            }),
            ExecutorConfig {
                batch_size: 1,
                poll_interval: Duration::from_millis(10),
                ..ExecutorConfig::default()
            },
        );
        let (addr, received) = spawn_merchant_failing_first(1, "success").await;
        let url = format!("http://{addr}/notify");
        let order_no = "P20250620153501120001";
        let shard = shard_index(order_no, QUEUE_SHARD_COUNT);

        h.notify_queue.enqueue(&make_task(&h, order_no, &url, "1")).await.unwrap();
        h.notify_queue.enqueue(&make_task(&h, order_no, &url, "2")).await.unwrap();

        let first = h.executor.process_notify_shard_once(shard).await.unwrap();
        assert_eq!(first.rescheduled, 1);

        // Seq 2 is now at the head of the shard, but seq 1 holds the order.
        let second = h.executor.process_notify_shard_once(shard).await.unwrap();
        assert_eq!(second.deferred, 1);
        assert_eq!(second.attempted(), 0);
        assert_eq!(received.lock().unwrap().as_slice(), ["1"]);

        h.clock.advance(time::Duration::minutes(2));
        for _ in 0..4 {
            h.executor.process_notify_shard_once(shard).await.unwrap();
        }

        assert_eq!(received.lock().unwrap().as_slice(), ["1", "1", "2"]);
        assert!(shard_tasks(&h, order_no).await.is_empty());
        assert_eq!(h.notify_queue.holder(order_no).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_held_task_runs_ahead_of_tasks_queued_before_it() {
        let h = harness();
        let (addr, received) = spawn_merchant("success").await;
        let url = format!("http://{addr}/notify");
        let order_no = "P20250620153501120001";
        let shard = shard_index(order_no, QUEUE_SHARD_COUNT);

        // Seq 1 was retried and re-enqueued behind seq 2.
        let mut retried = make_task(&h, order_no, &url, "1");
        retried.schedule_retry(h.clock.now(), Duration::from_secs(60));
        h.notify_queue.enqueue(&make_task(&h, order_no, &url, "2")).await.unwrap();
        h.notify_queue.enqueue(&retried).await.unwrap();
        h.notify_queue.hold(&retried).await.unwrap();

        h.clock.advance(time::Duration::minutes(1));
        let report = h.executor.process_notify_shard_once(shard).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.deferred, 1);

        let report = h.executor.process_notify_shard_once(shard).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(received.lock().unwrap().as_slice(), ["1", "2"]);
    }

    #[tokio::test]
    async fn test_empty_url_is_dead_lettered_without_retry() {
        let h = harness();
        let task = make_task(&h, "P1", "", "1");
        h.notify_queue.enqueue(&task).await.unwrap();

        let shard = shard_index("P1", QUEUE_SHARD_COUNT);
        let report = h.executor.process_notify_shard_once(shard).await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.rescheduled, 0);
        let parked = h.store.list_items("merchant_notify_queue_dead_letter").await;
        let parked: NotificationTask = serde_json::from_str(&parked[0]).unwrap();
        assert_eq!(parked.retry_count, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let h = harness();
        h.store.enqueue("merchant_notify_queue_4", "{not json").await.unwrap();

        let report = h.executor.process_notify_shard_once(4).await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(
            h.store.list_items("merchant_notify_queue_dead_letter").await,
            ["{not json"]
        );
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_from_batch() {
        let h = harness();
        h.store.set_offline(true);

        assert!(h.executor.process_notify_shard_once(0).await.is_err());
    }

    fn make_query(order_no: &str) -> QueryTask {
        QueryTask::new(
            order_no.to_string(),
            "T1".to_string(),
            "CH01".to_string(),
            OrderType::Payin,
            "M1".to_string(),
            datetime!(2025-06-20 15:35:01 UTC),
        )
    }

    #[tokio::test]
    async fn test_pending_query_retries_until_resolved() {
        let h = harness_with_querier(Arc::new(CountingQuerier {
            calls: AtomicU32::new(0),
            resolve_on: 2,
        }));
        h.query_queue.enqueue(&make_query("P1")).await.unwrap();

        let first = h.executor.process_query_once().await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let raw = h.store.list_items("order_query_tasks").await;
        let requeued: QueryTask = serde_json::from_str(&raw[0]).unwrap();
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.next_query_at, h.clock.now().unix_timestamp() + 60);

        let early = h.executor.process_query_once().await.unwrap();
        assert_eq!(early.deferred, 1);
        assert_eq!(early.attempted(), 0);

        h.clock.advance(time::Duration::minutes(1));
        let second = h.executor.process_query_once().await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(h.query_queue.len().await.unwrap(), 0);
        assert!(h.store.list_items("order_query_tasks_processing").await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_query_outlives_three_retry_intervals() {
        let h = harness_with_querier(Arc::new(CountingQuerier {
            calls: AtomicU32::new(0),
            resolve_on: u32::MAX,
        }));
        h.query_queue.enqueue(&make_query("P1")).await.unwrap();

        // Poll every 20 seconds for just under three intervals.
        for _ in 0..9 {
            let report = h.executor.process_query_once().await.unwrap();
            assert_eq!(report.dead_lettered, 0);
            h.clock.advance(time::Duration::seconds(20));
        }
        assert_eq!(h.query_queue.len().await.unwrap(), 1);

        let report = h.executor.process_query_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let parked = h.store.list_items("order_query_tasks_dead_letter").await;
        let parked: QueryTask = serde_json::from_str(&parked[0]).unwrap();
        assert_eq!(parked.retry_count, 3);
        assert_eq!(h.query_queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop_on_cancel() {
        let h = harness();
        let (addr, received) = spawn_merchant("success").await;
        let url = format!("http://{addr}/notify");
        h.notify_queue
            .enqueue(&make_task(&h, "P20250620153501120001", &url, "1"))
            .await
            .unwrap();
        h.notify_queue
            .enqueue(&make_task(&h, "W20250620153501120001", &url, "2"))
            .await
            .unwrap();
        h.query_queue.enqueue(&make_query("P1")).await.unwrap();

        // A previous worker claimed this one and died before settling it.
        let orphan = make_task(&h, "P20250620153501120002", &url, "3");
        let orphan_shard = shard_index(&orphan.order_no, QUEUE_SHARD_COUNT);
        h.notify_queue.enqueue(&orphan).await.unwrap();
        assert_eq!(h.notify_queue.claim_batch(orphan_shard, 10).await.unwrap().len(), 1);

        let token = CancellationToken::new();
        let handles = h.executor.start(token.clone());
        assert_eq!(handles.len(), QUEUE_SHARD_COUNT + 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let delivered = received.lock().unwrap().len();
            let pending_queries = h.query_queue.len().await.unwrap();
            if delivered == 3 && pending_queries == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "workers did not drain the queues");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_query_worker_not_started_without_query_url() {
        let http = Arc::new(DispatchHttpClient::with_timeout(Duration::from_secs(2)).unwrap());
        let h = harness_with_querier(Arc::new(HttpOrderQuerier::new(http, None)));
        h.query_queue.enqueue(&make_query("P1")).await.unwrap();

        let token = CancellationToken::new();
        let handles = h.executor.start(token.clone());
        assert_eq!(handles.len(), QUEUE_SHARD_COUNT);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.query_queue.len().await.unwrap(), 1);
        assert!(h.store.list_items("order_query_tasks_dead_letter").await.is_empty());

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
