//! Connection state machine.
//!
//! Bytes arrive in arbitrary chunks. The framer accumulates them and
//! alternates between scanning for a command line and waiting for the data
//! block announced by a value command header. Every complete unit is
//! dispatched as soon as it is available, so pipelined commands are answered
//! in arrival order and a command split across chunks is processed exactly
//! once.

use crate::context::Shared;
use crate::protocol::{
    find_crlf, parse_value_header, tokenize, HeaderParse, Response, CRLF, MAX_LINE_LENGTH,
};
use crate::protocols::memcached::{Emit, Flow, SimpleCommand, ValueCommand};
use crate::runtime::outbound::{Emitter, Outbound};
use crate::storage::Item;
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Write};
use std::mem;
use tracing::{trace, warn};

/// What the framer is waiting for.
#[derive(Debug)]
enum ParseMode {
    /// A `\r\n` terminated command line
    AwaitingLine,
    /// `nval` data bytes followed by `\r\n`
    AwaitingValue(PendingValue),
}

#[derive(Debug)]
struct PendingValue {
    nval: usize,
    target: ValueTarget,
}

#[derive(Debug)]
enum ValueTarget {
    /// Header was well formed: store the block under `item`
    Store { command: ValueCommand, item: Item },
    /// Header was rejected but its length is known: drop the block
    Discard,
}

enum Step {
    Continue,
    Suspend,
    Close,
}

/// Input reassembly for one connection.
#[derive(Debug)]
struct Framer {
    leftover: BytesMut,
    /// Prefix of `leftover` already searched for a line terminator
    scanned: usize,
    mode: ParseMode,
    max_value_size: usize,
}

impl Framer {
    fn step(&mut self, shared: &mut Shared, out: &mut dyn Emit) -> Step {
        match mem::replace(&mut self.mode, ParseMode::AwaitingLine) {
            ParseMode::AwaitingLine => self.read_line(shared, out),
            ParseMode::AwaitingValue(pending) => {
                if self.leftover.len() < pending.nval.saturating_add(CRLF.len()) {
                    self.mode = ParseMode::AwaitingValue(pending);
                    return Step::Suspend;
                }
                self.read_value(pending, shared, out)
            }
        }
    }

    fn read_line(&mut self, shared: &mut Shared, out: &mut dyn Emit) -> Step {
        let Some(found) = find_crlf(&self.leftover[self.scanned..]) else {
            if self.leftover.len() > MAX_LINE_LENGTH {
                warn!(
                    buffered = self.leftover.len(),
                    max_line_length = MAX_LINE_LENGTH,
                    "Command line too long, closing connection"
                );
                out.emit(Response::client_error());
                return Step::Close;
            }
            // A trailing `\r` may still pair with the next chunk.
            self.scanned = self.leftover.len().saturating_sub(1);
            return Step::Suspend;
        };
        let line = self.leftover.split_to(self.scanned + found);
        self.scanned = 0;
        self.leftover.advance(CRLF.len());

        let Some(args) = tokenize(&line) else {
            trace!("Command line is not UTF-8");
            out.emit(Response::client_error());
            return Step::Continue;
        };
        let Some(&name) = args.first() else {
            out.emit(Response::client_error());
            return Step::Continue;
        };

        if let Some(command) = SimpleCommand::lookup(name) {
            let flow = command.execute(&args, shared.store.as_mut(), &mut shared.context, out);
            return match flow {
                Flow::Continue => Step::Continue,
                Flow::Close => Step::Close,
            };
        }

        if let Some(command) = ValueCommand::lookup(name) {
            return self.start_value(command, &args, out);
        }

        trace!(command = name, "Unknown command");
        out.emit(Response::client_error());
        Step::Continue
    }

    fn start_value(&mut self, command: ValueCommand, args: &[&str], out: &mut dyn Emit) -> Step {
        let (nval, target) = match parse_value_header(args) {
            HeaderParse::Complete(header) => {
                let item = Item::new(header.key, header.flags, header.exptime, Bytes::new());
                (header.bytes, ValueTarget::Store { command, item })
            }
            HeaderParse::Skip { bytes } => {
                out.emit(Response::client_error());
                (bytes, ValueTarget::Discard)
            }
            HeaderParse::NoLength => {
                out.emit(Response::client_error());
                return Step::Continue;
            }
            HeaderParse::BadLength => {
                warn!(?command, "Unreadable data block length, closing connection");
                out.emit(Response::client_error());
                return Step::Close;
            }
        };

        if nval > self.max_value_size {
            warn!(
                ?command,
                bytes = nval,
                max_value_size = self.max_value_size,
                "Data block too large, closing connection"
            );
            if matches!(target, ValueTarget::Store { .. }) {
                out.emit(Response::client_error());
            }
            return Step::Close;
        }

        self.mode = ParseMode::AwaitingValue(PendingValue { nval, target });
        Step::Continue
    }

    fn read_value(&mut self, pending: PendingValue, shared: &mut Shared, out: &mut dyn Emit) -> Step {
        let value = self.leftover.split_to(pending.nval).freeze();
        let terminator = self.leftover.split_to(CRLF.len());
        if &terminator[..] != CRLF {
            warn!("Data block not terminated by CRLF, closing connection");
            out.emit(Response::client_error());
            return Step::Close;
        }

        if let ValueTarget::Store { command, mut item } = pending.target {
            item.value = value;
            let reply = command.apply(item, shared.store.as_mut(), &mut shared.context);
            out.emit(reply);
        }
        Step::Continue
    }

    fn discard(&mut self) {
        self.leftover.clear();
        self.scanned = 0;
        self.mode = ParseMode::AwaitingLine;
    }
}

/// Protocol state of one client connection, independent of the transport.
#[derive(Debug)]
pub struct Connection {
    framer: Framer,
    outbound: Outbound,
    closing: bool,
}

impl Connection {
    pub fn new(max_value_size: usize) -> Self {
        Self {
            framer: Framer {
                leftover: BytesMut::new(),
                scanned: 0,
                mode: ParseMode::AwaitingLine,
                max_value_size,
            },
            outbound: Outbound::new(),
            closing: false,
        }
    }

    /// Feed a chunk of received bytes, dispatching every complete command.
    ///
    /// Replies go to `sink` directly, or behind the outbound queue once the
    /// sink has refused a write. Input after `quit` or a framing error is
    /// ignored.
    pub fn on_data<W: Write>(
        &mut self,
        chunk: &[u8],
        shared: &mut Shared,
        sink: &mut W,
    ) -> io::Result<()> {
        if self.closing {
            return Ok(());
        }
        self.framer.leftover.extend_from_slice(chunk);

        let mut out = Emitter::new(&mut self.outbound, sink);
        loop {
            match self.framer.step(shared, &mut out) {
                Step::Continue => {}
                Step::Suspend => break,
                Step::Close => {
                    self.closing = true;
                    self.framer.discard();
                    break;
                }
            }
        }
        out.finish()
    }

    /// The transport is writable again: flush queued replies.
    pub fn on_writable<W: Write>(&mut self, sink: &mut W) -> io::Result<()> {
        if self.outbound.drain(sink)? {
            trace!("Outbound queue drained");
        } else {
            trace!(queued_bytes = self.outbound.queued_bytes(), "Transport refused output");
        }
        Ok(())
    }

    /// True while replies are waiting for the transport.
    pub fn wants_write(&self) -> bool {
        self.outbound.is_blocked()
    }

    /// True once the connection stopped accepting input.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// True once the connection is closing and every reply has been written.
    pub fn is_finished(&self) -> bool {
        self.closing && !self.outbound.is_blocked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::outbound::mock::MockSink;
    use crate::storage::Backend;

    struct Harness {
        shared: Shared,
        conn: Connection,
        sink: MockSink,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_sink(MockSink::unlimited())
        }

        fn with_sink(sink: MockSink) -> Self {
            Self {
                shared: Shared::new(Backend::Ordered),
                conn: Connection::new(1024),
                sink,
            }
        }

        /// Send one chunk and return only the bytes written in response.
        fn send(&mut self, chunk: &[u8]) -> String {
            let before = self.sink.written.len();
            self.conn
                .on_data(chunk, &mut self.shared, &mut self.sink)
                .unwrap();
            String::from_utf8_lossy(&self.sink.written[before..]).into_owned()
        }

        fn framer_scanned(&self) -> usize {
            self.conn.framer.scanned
        }

        fn send_in_pieces(&mut self, pieces: &[&[u8]]) -> String {
            pieces.iter().map(|piece| self.send(piece)).collect()
        }
    }

    #[test]
    fn test_set_then_get() {
        let mut h = Harness::new();
        assert_eq!(h.send(b"set foo 0 0 3\r\nbar\r\n"), "STORED\r\n");
        assert_eq!(h.send(b"get foo\r\n"), "VALUE foo 0 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn test_add_existing_key() {
        let mut h = Harness::new();
        h.send(b"set foo 0 0 3\r\nbar\r\n");
        assert_eq!(h.send(b"add foo 0 0 3\r\nbaz\r\n"), "NOT_STORED\r\n");
        assert_eq!(h.send(b"get foo\r\n"), "VALUE foo 0 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn test_append() {
        let mut h = Harness::new();
        h.send(b"set foo 0 0 3\r\nbar\r\n");
        assert_eq!(h.send(b"append foo 0 0 2\r\nXY\r\n"), "STORED\r\n");
        assert_eq!(h.send(b"get foo\r\n"), "VALUE foo 0 5\r\nbarXY\r\nEND\r\n");
    }

    #[test]
    fn test_rget_over_engine() {
        let mut h = Harness::new();
        for key in ["a", "b", "c", "d"] {
            let request = format!("set {key} 0 0 1\r\n{key}\r\n");
            assert_eq!(h.send(request.as_bytes()), "STORED\r\n");
        }
        assert_eq!(
            h.send(b"rget 1 0 0 b d\r\n"),
            "VALUE b 0 1\r\nb\r\nVALUE c 0 1\r\nc\r\nEND\r\n"
        );
    }

    #[test]
    fn test_command_split_across_chunks() {
        let mut h = Harness::new();
        let out = h.send_in_pieces(&[&b"se"[..], &b"t foo 0 0 3\r\nb"[..], &b"ar\r\n"[..]]);
        assert_eq!(out, "STORED\r\n");
        assert_eq!(h.shared.context.curr_items, 1);
        assert_eq!(h.send(b"get foo\r\n"), "VALUE foo 0 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn test_every_split_point_gives_same_output() {
        let request: &[u8] = b"set foo 0 0 5\r\na\r\nbc\r\nget foo\r\ndelete foo\r\n";
        let expected = "STORED\r\nVALUE foo 0 5\r\na\r\nbc\r\nEND\r\nDELETED\r\n";

        let mut whole = Harness::new();
        assert_eq!(whole.send(request), expected);

        for split in 0..=request.len() {
            let mut h = Harness::new();
            let (head, tail) = request.split_at(split);
            assert_eq!(h.send_in_pieces(&[head, tail]), expected, "split at {split}");
            assert_eq!(h.shared.context.curr_items, 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut h = Harness::new();
        let request: &[u8] = b"set k 3 0 2\r\nhi\r\nprepend k 4 0 2\r\n>>\r\nget k\r\n";
        let out: String = request.iter().map(|byte| h.send(&[*byte])).collect();
        assert_eq!(out, "STORED\r\nSTORED\r\nVALUE k 4 4\r\n>>hi\r\nEND\r\n");
    }

    #[test]
    fn test_pipelined_commands_in_one_chunk() {
        let mut h = Harness::new();
        let out = h.send(b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\nget a b\r\nstats\r\n");
        assert_eq!(
            out,
            "STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n\
             STAT num_conns 0\r\nSTAT tot_conns 0\r\nSTAT curr_items 2\r\nEND\r\n"
        );
    }

    #[test]
    fn test_unknown_and_empty_lines() {
        let mut h = Harness::new();
        assert_eq!(h.send(b"bogus\r\n"), "CLIENT_ERROR\r\n");
        assert_eq!(h.send(b"\r\n"), "CLIENT_ERROR\r\n");
        assert_eq!(h.send(b"   \r\n"), "CLIENT_ERROR\r\n");
        assert_eq!(h.send(b"get \xff\r\n"), "CLIENT_ERROR\r\n");
        assert_eq!(h.send(b"get x\r\n"), "END\r\n");
        assert!(!h.conn.is_closing());
    }

    #[test]
    fn test_short_header_keeps_scanning() {
        let mut h = Harness::new();
        // The body line is then read as a command of its own.
        assert_eq!(h.send(b"set foo 0 0\r\nbar\r\n"), "CLIENT_ERROR\r\nCLIENT_ERROR\r\n");
        assert!(!h.conn.is_closing());
        assert_eq!(h.shared.context.curr_items, 0);
    }

    #[test]
    fn test_extra_tokens_skip_data_block() {
        let mut h = Harness::new();
        let out = h.send(b"set foo 0 0 3 noreply\r\nbar\r\nget foo\r\n");
        assert_eq!(out, "CLIENT_ERROR\r\nEND\r\n");
        assert_eq!(h.shared.context.curr_items, 0);

        let out = h.send(b"set foo 0 later 3\r\nb\r\n\r\nget foo\r\n");
        assert_eq!(out, "CLIENT_ERROR\r\nEND\r\n");
    }

    #[test]
    fn test_bad_length_closes() {
        let mut h = Harness::new();
        assert_eq!(h.send(b"set foo 0 0 x\r\nget foo\r\n"), "CLIENT_ERROR\r\n");
        assert!(h.conn.is_closing());
        assert!(h.conn.is_finished());
        assert_eq!(h.send(b"get foo\r\n"), "");
    }

    #[test]
    fn test_oversized_value_closes() {
        let mut h = Harness::new();
        assert_eq!(h.send(b"set foo 0 0 4096\r\n"), "CLIENT_ERROR\r\n");
        assert!(h.conn.is_closing());
    }

    #[test]
    fn test_unterminated_block_closes() {
        let mut h = Harness::new();
        assert_eq!(h.send(b"set foo 0 0 3\r\nbarXYget foo\r\n"), "CLIENT_ERROR\r\n");
        assert!(h.conn.is_closing());
        assert!(h.shared.store.is_empty());
    }

    #[test]
    fn test_line_split_inside_terminator() {
        let mut h = Harness::new();
        assert_eq!(h.send(b"get foo\r"), "");
        assert_eq!(h.framer_scanned(), 7);
        assert_eq!(h.send(b"\nget"), "END\r\n");
        assert_eq!(h.send(b" foo\r\n"), "END\r\n");
    }

    #[test]
    fn test_unterminated_line_is_bounded() {
        let mut h = Harness::new();
        let chunk = vec![b'a'; 16 * 1024];
        let mut out = String::new();
        for _ in 0..(MAX_LINE_LENGTH / chunk.len()) {
            out.push_str(&h.send(&chunk));
        }
        assert_eq!(out, "");
        assert!(!h.conn.is_closing());
        assert_eq!(h.framer_scanned(), MAX_LINE_LENGTH - 1);

        assert_eq!(h.send(&chunk), "CLIENT_ERROR\r\n");
        assert!(h.conn.is_closing());
        assert!(h.conn.framer.leftover.is_empty());
        assert_eq!(h.send(b"get a\r\n"), "");
    }

    #[test]
    fn test_long_line_within_limit() {
        let mut h = Harness::new();
        let key = "k".repeat(1000);
        let request = format!("get {}\r\n", vec![key.as_str(); 40].join(" "));
        for chunk in request.as_bytes().chunks(100) {
            h.send(chunk);
        }
        assert!(!h.conn.is_closing());
        assert_eq!(h.sink.text(), "END\r\n");
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        let mut shared = Shared::new(Backend::Ordered);
        let mut conn = Connection::new(usize::MAX);
        let mut sink = MockSink::unlimited();
        let request = format!("set k 0 0 {}\r\nab", usize::MAX);
        conn.on_data(request.as_bytes(), &mut shared, &mut sink).unwrap();
        assert_eq!(sink.text(), "");
        assert!(!conn.is_closing());
    }

    #[test]
    fn test_quit_ignores_remaining_input() {
        let mut h = Harness::new();
        let out = h.send(b"set a 0 0 1\r\n1\r\nquit\r\nget a\r\n");
        assert_eq!(out, "STORED\r\n");
        assert!(h.conn.is_finished());
        assert_eq!(h.send(b"get a\r\n"), "");
    }

    #[test]
    fn test_count_conservation() {
        let mut h = Harness::new();
        h.send(b"set a 0 0 1\r\n1\r\nset a 0 0 1\r\n2\r\nadd b 0 0 1\r\n3\r\n");
        h.send(b"replace zz 0 0 1\r\n4\r\nappend yy 0 0 1\r\n5\r\ndelete b\r\n");
        assert_eq!(h.shared.context.curr_items, 1);
        assert_eq!(h.shared.store.len(), 1);

        assert_eq!(h.send(b"flush_all\r\nflush_all\r\n"), "OK\r\nOK\r\n");
        assert_eq!(h.shared.context.curr_items, 0);
    }

    #[test]
    fn test_backpressure_preserves_order() {
        let mut h = Harness::with_sink(MockSink::with_capacity(10));
        h.send(b"set k 0 0 5\r\nhello\r\n");
        assert!(!h.conn.wants_write());

        h.send(b"get k\r\nget k\r\ndelete k\r\nget k\r\n");
        assert_eq!(h.sink.text(), "STORED\r\nVA");
        assert!(h.conn.wants_write());

        h.sink.open(7);
        h.conn.on_writable(&mut h.sink).unwrap();
        assert!(h.conn.wants_write());

        h.sink.open(usize::MAX);
        h.conn.on_writable(&mut h.sink).unwrap();
        assert!(!h.conn.wants_write());
        assert_eq!(
            h.sink.text(),
            "STORED\r\nVALUE k 0 5\r\nhello\r\nEND\r\nVALUE k 0 5\r\nhello\r\nEND\r\n\
             DELETED\r\nEND\r\n"
        );
    }

    #[test]
    fn test_quit_waits_for_queue() {
        let mut h = Harness::with_sink(MockSink::with_capacity(0));
        h.send(b"stats\r\nquit\r\n");
        assert!(h.conn.is_closing());
        assert!(!h.conn.is_finished());

        h.sink.open(usize::MAX);
        h.conn.on_writable(&mut h.sink).unwrap();
        assert!(h.conn.is_finished());
        assert!(h.sink.text().ends_with("END\r\n"));
    }
}
