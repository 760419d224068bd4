//! rget-cache: an in-memory key-value cache server
//!
//! Speaks a memcached-style text protocol extended with `rget`, a
//! range query over keys.
//!
//! Features:
//! - Key-value storage with get, set, add, replace, append, prepend, delete
//! - Range retrieval with inclusive/exclusive bounds and a result limit
//! - Ordered (sorted) or hashed item store
//! - Single-threaded mio or tokio runtime
//! - Configuration via CLI arguments or TOML file

mod config;
mod context;
mod protocol;
mod protocols;
mod runtime;
mod server;
mod storage;

use config::{Config, RuntimeType};
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
        listen = %config.listen,
        runtime = ?config.runtime,
        backend = ?config.backend,
        max_value_size = config.max_value_size,
        "Starting rget-cache server"
    );

    match config.runtime {
        RuntimeType::Mio => run_mio(config),
        RuntimeType::Tokio => run_tokio(config),
    }
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    runtime::run_mio(config)?;
    Ok(())
}

/// Run with a current-thread tokio runtime
fn run_tokio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using tokio runtime (current thread)");
    server::run(config)?;
    Ok(())
}
