//! capped-echo: a TCP echo server with a hard connection cap
//!
//! Every byte read from a client is written straight back. When the number
//! of open connections reaches the configured maximum, the connection that
//! has been quiet the longest is evicted to make room for the next one.
//!
//! Features:
//! - Per-connection idle timeout
//! - `quit` command for a graceful close
//! - O(log n) least-recently-active eviction
//! - Configuration via CLI arguments or TOML file

mod config;
mod heap;
mod pool;
mod server;
mod session;
mod transport;
mod worker;

use config::Config;
use server::{Server, ServerError};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = ?config.workers,
        max_connections = config.max_connections,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        max_read_bytes = config.max_read_bytes,
        "Starting capped-echo server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(serve(config))?;
    Ok(())
}

/// Run the accept loop until it fails or the process is interrupted.
async fn serve(config: Config) -> Result<(), ServerError> {
    let server = Server::bind(&config).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            Ok(())
        }
    }
}
