use payment_dispatch::config::Config;
use payment_dispatch::server::Server;
use payment_dispatch::telemetry;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Load configuration
    let config = Config::load()?;
    telemetry::init_tracing_with(config.telemetry.json);
    tracing::info!("Loaded configuration: {:?}", config);

    // Create and run server
    let server = Server::new(&config).await?;
    server.run().await
}
