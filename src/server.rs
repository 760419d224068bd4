//! TCP server on a current-thread tokio runtime.
//!
//! Every connection runs as a task on one `LocalSet` and drives the same
//! `Connection` engine as the mio event loop. Tasks share the store and
//! counters through `Rc<RefCell<Shared>>`; a borrow is only taken between
//! awaits, so commands from different connections never interleave.

use crate::config::Config;
use crate::context::Shared;
use crate::runtime::{self, Connection};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{self, LocalSet};
use tracing::{debug, error, info, trace, warn};

/// Bind the configured address and serve until the listener fails.
pub fn run(config: Config) -> io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();

    local.block_on(&rt, async move {
        let addr = runtime::resolve(&config.listen)?;
        let listener = TcpListener::from_std(runtime::bind_listener(addr)?)?;

        info!(
            addr = %addr,
            backend = ?config.backend,
            max_connections = config.max_connections,
            "Starting tokio runtime"
        );

        serve(listener, config).await
    })
}

/// Accept connections forever. Must run inside a `LocalSet`.
pub async fn serve(listener: TcpListener, config: Config) -> io::Result<()> {
    let shared = Rc::new(RefCell::new(Shared::new(config.backend)));
    let connection_limit = Arc::new(Semaphore::new(config.max_connections));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&connection_limit).try_acquire_owned() else {
            warn!(
                peer = %peer,
                max_connections = config.max_connections,
                "Connection limit reached"
            );
            continue;
        };

        shared.borrow_mut().context.connection_opened();
        debug!(peer = %peer, "Accepted connection");

        let shared = Rc::clone(&shared);
        let buffer_size = config.buffer_size;
        let max_value_size = config.max_value_size;

        task::spawn_local(async move {
            if let Err(e) = handle_connection(&stream, &shared, buffer_size, max_value_size).await {
                debug!(peer = %peer, error = %e, "Connection error");
            }
            shared.borrow_mut().context.connection_closed();
            debug!(peer = %peer, "Connection closed");
            drop(permit);
        });
    }
}

/// Non-blocking `Write` over a tokio socket. A full socket buffer surfaces as
/// `WouldBlock`, which hands the remainder to the outbound queue.
struct TryWriter<'a>(&'a TcpStream);

impl Write for TryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn handle_connection(
    stream: &TcpStream,
    shared: &RefCell<Shared>,
    buffer_size: usize,
    max_value_size: usize,
) -> io::Result<()> {
    let mut conn = Connection::new(max_value_size);
    let mut buffer = vec![0; buffer_size.max(1)];

    while !conn.is_finished() {
        let interest = if conn.is_closing() {
            Interest::WRITABLE
        } else if conn.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = stream.ready(interest).await?;

        if ready.is_writable() {
            conn.on_writable(&mut TryWriter(stream))?;
        }

        if ready.is_readable() && !conn.is_closing() {
            match stream.try_read(&mut buffer) {
                Ok(0) => {
                    trace!("Peer closed connection");
                    let _ = conn.on_writable(&mut TryWriter(stream));
                    return Ok(());
                }
                Ok(n) => {
                    let mut shared = shared.borrow_mut();
                    conn.on_data(&buffer[..n], &mut shared, &mut TryWriter(stream))?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Backend;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    async fn spawn_server(config: Config) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        task::spawn_local(serve(listener, config));
        addr
    }

    async fn request(client: &mut TcpStream, data: &[u8], expected: &str) {
        assert_ok!(client.write_all(data).await);
        let mut response = vec![0; expected.len()];
        let read = timeout(Duration::from_secs(5), client.read_exact(&mut response)).await;
        assert_ok!(assert_ok!(read));
        assert_eq!(String::from_utf8_lossy(&response), expected);
    }

    #[tokio::test]
    async fn test_set_get_and_range() {
        LocalSet::new()
            .run_until(async {
                let addr = spawn_server(Config::default()).await;
                let mut client = TcpStream::connect(addr).await.unwrap();

                for key in ["a", "b", "c", "d"] {
                    let set = format!("set {key} 0 0 1\r\n{key}\r\n");
                    request(&mut client, set.as_bytes(), "STORED\r\n").await;
                }
                request(&mut client, b"add a 0 0 1\r\nz\r\n", "NOT_STORED\r\n").await;
                request(
                    &mut client,
                    b"rget 1 0 0 b d\r\n",
                    "VALUE b 0 1\r\nb\r\nVALUE c 0 1\r\nc\r\nEND\r\n",
                )
                .await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_split_writes_and_stats() {
        LocalSet::new()
            .run_until(async {
                let config = Config {
                    backend: Backend::Hash,
                    ..Config::default()
                };
                let addr = spawn_server(config).await;
                let mut client = TcpStream::connect(addr).await.unwrap();

                assert_ok!(client.write_all(b"set foo 0 0 3\r\nb").await);
                tokio::time::sleep(Duration::from_millis(20)).await;
                request(&mut client, b"ar\r\n", "STORED\r\n").await;

                request(
                    &mut client,
                    b"stats\r\n",
                    "STAT num_conns 1\r\nSTAT tot_conns 1\r\nSTAT curr_items 1\r\nEND\r\n",
                )
                .await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_quit_and_limit() {
        LocalSet::new()
            .run_until(async {
                let config = Config {
                    max_connections: 1,
                    ..Config::default()
                };
                let addr = spawn_server(config).await;

                let mut first = TcpStream::connect(addr).await.unwrap();
                request(&mut first, b"get a\r\n", "END\r\n").await;

                // A second client is accepted and dropped at once.
                let mut rejected = TcpStream::connect(addr).await.unwrap();
                let mut buf = [0; 16];
                let read = timeout(Duration::from_secs(5), rejected.read(&mut buf)).await;
                match assert_ok!(read) {
                    Ok(n) => assert_eq!(n, 0),
                    Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
                }

                assert_ok!(first.write_all(b"quit\r\n").await);
                let mut rest = Vec::new();
                let read = timeout(Duration::from_secs(5), first.read_to_end(&mut rest)).await;
                assert_ok!(assert_ok!(read));
                assert!(rest.is_empty());
            })
            .await;
    }
}
