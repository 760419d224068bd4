//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls. Sockets are
//! edge-triggered, so every readable event is drained until `WouldBlock`.
//!
//! Interest follows the connection: `READABLE` normally, `READABLE |
//! WRITABLE` while replies are queued behind a refused write.

use crate::config::Config;
use crate::context::Shared;
use crate::runtime::Connection;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Events handled per poll iteration
const EVENTS_CAPACITY: usize = 1024;

/// A client socket and its protocol state.
struct MioConnection {
    stream: TcpStream,
    peer: SocketAddr,
    interest: Interest,
    conn: Connection,
}

/// Single-threaded accept/read/write loop over every connection.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<MioConnection>,
    shared: Shared,
    read_buf: Vec<u8>,
    max_connections: usize,
    max_value_size: usize,
}

impl EventLoop {
    /// Take ownership of a bound, non-blocking listener.
    pub fn new(listener: std::net::TcpListener, config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: Slab::with_capacity(config.max_connections),
            shared: Shared::new(config.backend),
            read_buf: vec![0; config.buffer_size.max(1)],
            max_connections: config.max_connections,
            max_value_size: config.max_value_size,
        })
    }

    /// Poll forever. Only a failure of the poller itself ends the loop.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(
                            peer = %peer,
                            max_connections = self.max_connections,
                            "Connection limit reached"
                        );
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(conn_id), Interest::READABLE)
                    {
                        debug!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    entry.insert(MioConnection {
                        stream,
                        peer,
                        interest: Interest::READABLE,
                        conn: Connection::new(self.max_value_size),
                    });
                    self.shared.context.connection_opened();

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) {
        match self.drive(conn_id, event.is_readable(), event.is_writable()) {
            Ok(true) => {}
            Ok(false) => self.close_connection(conn_id),
            Err(e) => {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    /// Service one readiness event. Returns false once the connection should
    /// be closed.
    fn drive(&mut self, conn_id: usize, readable: bool, writable: bool) -> io::Result<bool> {
        let Some(entry) = self.connections.get_mut(conn_id) else {
            return Ok(true);
        };

        if writable {
            entry.conn.on_writable(&mut entry.stream)?;
        }

        if readable {
            while !entry.conn.is_closing() {
                match entry.stream.read(&mut self.read_buf) {
                    Ok(0) => {
                        trace!(conn_id, "Peer closed connection");
                        // Best effort: the peer may still read what is queued.
                        let _ = entry.conn.on_writable(&mut entry.stream);
                        return Ok(false);
                    }
                    Ok(n) => {
                        entry
                            .conn
                            .on_data(&self.read_buf[..n], &mut self.shared, &mut entry.stream)?;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        if entry.conn.is_finished() {
            return Ok(false);
        }

        let interest = if entry.conn.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest != entry.interest {
            self.poll
                .registry()
                .reregister(&mut entry.stream, Token(conn_id), interest)?;
            entry.interest = interest;
        }

        Ok(true)
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut entry) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut entry.stream);
            self.shared.context.connection_closed();
            debug!(conn_id, peer = %entry.peer, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{bind_listener, resolve};
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn spawn_server(config: Config) -> SocketAddr {
        let listener = bind_listener(resolve("127.0.0.1:0").unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let mut event_loop = EventLoop::new(listener, &config).unwrap();
            event_loop.run()
        });
        addr
    }

    fn connect(addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn request(stream: &mut StdTcpStream, data: &[u8], expected: &str) {
        stream.write_all(data).unwrap();
        let mut response = vec![0; expected.len()];
        stream.read_exact(&mut response).unwrap();
        assert_eq!(String::from_utf8_lossy(&response), expected);
    }

    fn expect_stats(stream: &mut StdTcpStream, num_conns: u64, tot_conns: u64, curr_items: u64) {
        let expected = format!(
            "STAT num_conns {num_conns}\r\nSTAT tot_conns {tot_conns}\r\n\
             STAT curr_items {curr_items}\r\nEND\r\n"
        );
        request(stream, b"stats\r\n", &expected);
    }

    #[test]
    fn test_set_get_over_socket() {
        let addr = spawn_server(Config::default());
        let mut client = connect(addr);

        request(&mut client, b"set foo 0 0 3\r\nbar\r\n", "STORED\r\n");
        request(&mut client, b"get foo\r\n", "VALUE foo 0 3\r\nbar\r\nEND\r\n");
        request(&mut client, b"append foo 0 0 2\r\nXY\r\n", "STORED\r\n");
        request(&mut client, b"get foo\r\n", "VALUE foo 0 5\r\nbarXY\r\nEND\r\n");
    }

    #[test]
    fn test_connection_counters() {
        let addr = spawn_server(Config::default());
        let mut first = connect(addr);
        request(&mut first, b"set a 0 0 1\r\n1\r\n", "STORED\r\n");

        let mut second = connect(addr);
        expect_stats(&mut second, 2, 2, 1);

        drop(second);

        // The close is observed asynchronously.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            first.write_all(b"stats\r\n").unwrap();
            let expected = "STAT num_conns 1\r\nSTAT tot_conns 2\r\nSTAT curr_items 1\r\nEND\r\n";
            let mut response = vec![0; expected.len()];
            first.read_exact(&mut response).unwrap();
            if response == expected.as_bytes() {
                break;
            }
            assert!(Instant::now() < deadline, "close never counted");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_quit_closes_socket() {
        let addr = spawn_server(Config::default());
        let mut client = connect(addr);

        client.write_all(b"set a 0 0 1\r\n1\r\nquit\r\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"STORED\r\n");
    }

    #[test]
    fn test_connection_limit() {
        let config = Config {
            max_connections: 1,
            ..Config::default()
        };
        let addr = spawn_server(config);
        let mut first = connect(addr);
        request(&mut first, b"get a\r\n", "END\r\n");

        let mut rejected = connect(addr);
        let mut buf = [0; 16];
        match rejected.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }

        expect_stats(&mut first, 1, 1, 0);
    }

    #[test]
    fn test_large_pipelined_replies_survive_backpressure() {
        let addr = spawn_server(Config::default());
        let mut client = connect(addr);

        let value = vec![b'x'; 256 * 1024];
        let mut set = b"set big 0 0 262144\r\n".to_vec();
        set.extend_from_slice(&value);
        set.extend_from_slice(b"\r\n");
        request(&mut client, &set, "STORED\r\n");

        // Ask for far more than the socket buffers hold before reading any of it.
        let gets = 32;
        client.write_all(&b"get big\r\n".repeat(gets)).unwrap();

        let mut reply = b"VALUE big 0 262144\r\n".to_vec();
        reply.extend_from_slice(&value);
        reply.extend_from_slice(b"\r\nEND\r\n");

        let mut response = vec![0; reply.len() * gets];
        client.read_exact(&mut response).unwrap();
        for chunk in response.chunks(reply.len()) {
            assert!(chunk == reply.as_slice());
        }
    }
}
