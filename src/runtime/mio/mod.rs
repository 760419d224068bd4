//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS), driven
//! from a single thread.

mod event_loop;

use crate::config::Config;
use std::io;
use tracing::info;

use event_loop::EventLoop;

/// Bind the configured address and run the event loop until it fails.
pub fn run(config: Config) -> io::Result<()> {
    let addr = super::resolve(&config.listen)?;
    let listener = super::bind_listener(addr)?;

    info!(
        addr = %addr,
        backend = ?config.backend,
        max_connections = config.max_connections,
        "Starting mio runtime"
    );

    EventLoop::new(listener, &config)?.run()
}
