//! Runtime support for the connection engine.
//!
//! The transport-independent pieces live here:
//! - `Connection`: per-connection framing and command dispatch
//! - `Outbound`: FIFO queue of replies the transport has refused
//!
//! The default driver is a single-threaded mio event loop (epoll on Linux,
//! kqueue on macOS). The tokio driver in `crate::server` reuses the same
//! engine.

mod connection;
mod mio;
mod outbound;

pub(crate) use connection::Connection;

use crate::config::Config;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Pending connections the kernel may queue before `accept`
const LISTEN_BACKLOG: i32 = 1024;

/// Run the server on the mio event loop.
pub fn run_mio(config: Config) -> io::Result<()> {
    self::mio::run(config)
}

/// Resolve the configured listen address.
pub(crate) fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listen address '{listen}' did not resolve"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
