use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber with human readable output.
pub fn init_tracing() {
    init_tracing_with(false);
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `info`. Calling this
/// more than once is harmless; later calls are ignored.
pub fn init_tracing_with(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
