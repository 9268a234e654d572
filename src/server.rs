mod handlers;
pub mod middleware;
pub mod responses;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, StoreBackend, StoreConfig};
use crate::domain::{Clock, OrderNoGenerator, QueueStore, SystemClock};
use crate::infrastructure::{InMemoryQueueStore, OrderCache, StatsRecorder};
use crate::outbound::dispatch::{
    DeliveryExecutor, DispatchHttpClient, ExecutorConfig, HttpOrderQuerier, NotifyQueue,
    OrderQueryQueue,
};
use crate::outbound::jobs::JobRunner;
use crate::security::{SafeCheckConfig, SignatureEngine};
use crate::server::handlers::health::{health_check, readiness};
use crate::server::handlers::{dispatch, payment};
use crate::server::middleware::{safe_check, verify_signature};
use axum::http::Method;
use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use color_eyre::eyre::{Context, Result};
use futures::future::join_all;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

#[derive(Clone)]
/// The global application state shared between all request handlers.
pub struct AppState {
    pub orders: OrderCache,
    pub stats: StatsRecorder,
    pub notify_queue: NotifyQueue,
    pub query_queue: OrderQueryQueue,
    pub signature: SignatureEngine,
    pub order_nos: Arc<OrderNoGenerator>,
    pub jobs: JobRunner,
    pub clock: Arc<dyn Clock>,
}

pub struct Server {
    router: Router,
    listener: TcpListener,
    executor: Arc<DeliveryExecutor>,
    stats_task: JoinHandle<()>,
    consume: bool,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates the server on the store backend selected in `config`.
    pub async fn new(config: &Config) -> Result<Self> {
        let store = open_store(&config.store).await?;
        Self::with_store(config, store).await
    }

    /// Creates the server on an already opened queue store.
    pub async fn with_store(config: &Config, store: Arc<dyn QueueStore>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let signature = SignatureEngine::with_clock(
            config.signature.secret.clone(),
            config.signature.ttl_secs,
            clock.clone(),
        );
        let notify_queue = NotifyQueue::new(store.clone(), config.dispatch.shard_count);
        let query_queue = OrderQueryQueue::new(store.clone());

        let http = Arc::new(
            DispatchHttpClient::with_timeout(config.dispatch.http_timeout())
                .wrap_err("Failed to build dispatch HTTP client")?,
        );
        let querier = Arc::new(HttpOrderQuerier::new(
            http.clone(),
            config.dispatch.order_query_url.clone(),
        ));
        let executor = Arc::new(DeliveryExecutor::new(
            notify_queue.clone(),
            query_queue.clone(),
            http,
            querier,
            clock.clone(),
            ExecutorConfig::from(&config.dispatch),
        ));

        let jobs = JobRunner::new(config.dispatch.http_timeout())
            .wrap_err("Failed to build job runner")?;
        let (stats, stats_task) = StatsRecorder::spawn(store.clone(), clock.clone());

        let state = AppState {
            orders: OrderCache::new(store),
            stats,
            notify_queue,
            query_queue,
            signature,
            order_nos: Arc::new(OrderNoGenerator::with_clock(clock.clone())),
            jobs,
            clock,
        };
        let safety = Arc::new(SafeCheckConfig::from(&config.safety));

        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

        let dispatch_routes = Router::new()
            .route("/notify", post(dispatch::notify))
            .route("/query", post(dispatch::query))
            .route("/order_no", post(dispatch::order_no))
            .route("/jobs/run", post(dispatch::run_job))
            .route_layer(axum_middleware::from_fn_with_state(
                state.signature.clone(),
                verify_signature,
            ));

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness))
            .route("/api/payment/status/{id}", get(payment::status))
            .route("/api/payment/upi/{id}", get(payment::upi))
            .route("/api/payment/stats", get(payment::stats))
            .nest("/api/dispatch", dispatch_routes)
            .layer(axum_middleware::from_fn_with_state(safety, safe_check))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state);

        let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await
            .wrap_err_with(|| format!("Failed to bind to port {}", config.server.port))?;

        Ok(Self {
            router,
            listener,
            executor,
            stats_task,
            consume: config.dispatch.consume,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn port(&self) -> Result<u16> {
        let addr = self
            .listener
            .local_addr()
            .wrap_err("Failed to read listener address")?;
        Ok(addr.port())
    }

    /// Cancelling this token stops the server and its dispatch workers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the HTTP server and the delivery workers until shutdown.
    pub async fn run(self) -> Result<()> {
        info!("Server listening on {}", self.listener.local_addr()?);

        let workers = if self.consume {
            self.executor.start(self.shutdown.child_token())
        } else {
            info!("Delivery workers disabled, running as producer only");
            Vec::new()
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal(self.shutdown.clone()))
            .await?;

        self.shutdown.cancel();
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Dispatch worker ended abnormally");
            }
        }
        if let Err(e) = self.stats_task.await {
            warn!(error = %e, "Stats recorder ended abnormally");
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn QueueStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory queue store");
            Ok(Arc::new(InMemoryQueueStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = crate::infrastructure::RedisQueueStore::connect(&config.url)
                .await
                .wrap_err("Failed to connect to the redis queue store")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(color_eyre::eyre::eyre!(
            "The redis store backend requires building with the `redis` feature"
        )),
    }
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                token.cancelled().await;
            }
        },
    }
}
