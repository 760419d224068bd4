//! Backpressure-aware response emission.
//!
//! Responses are written straight to the transport until a write is refused
//! (`WouldBlock`) or only partially accepted. From then on every fragment is
//! queued, and the queue is flushed in FIFO order when the transport signals
//! it is writable again. A flush that is refused part way stops and keeps the
//! remainder queued for the next writable signal.

use crate::protocols::memcached::Emit;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, Write};

/// Pending output for one connection.
#[derive(Debug, Default)]
pub struct Outbound {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the transport has refused output that is still queued.
    pub fn is_blocked(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Bytes waiting for the transport.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Write `data` now, or queue it behind earlier refused output.
    pub fn emit<W: Write>(&mut self, sink: &mut W, mut data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if !self.is_blocked() {
            let written = write_until_blocked(sink, &data)?;
            data.advance(written);
            if data.is_empty() {
                return Ok(());
            }
        }

        self.queued_bytes += data.len();
        self.queue.push_back(data);
        Ok(())
    }

    /// Flush queued output in order. Returns true once the queue is empty.
    pub fn drain<W: Write>(&mut self, sink: &mut W) -> io::Result<bool> {
        while let Some(front) = self.queue.front_mut() {
            let written = write_until_blocked(sink, front)?;
            front.advance(written);
            self.queued_bytes -= written;
            if !front.is_empty() {
                return Ok(false);
            }
            self.queue.pop_front();
        }
        Ok(true)
    }
}

/// Write as much of `buf` as the sink accepts without blocking.
fn write_until_blocked<W: Write>(sink: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match sink.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Binds an `Outbound` queue to a transport for the duration of one batch of
/// commands.
///
/// Commands cannot handle transport errors, so the first error is kept and
/// every later fragment is dropped; the caller collects it with `finish`.
pub struct Emitter<'a, W: Write> {
    outbound: &'a mut Outbound,
    sink: &'a mut W,
    error: Option<io::Error>,
}

impl<'a, W: Write> Emitter<'a, W> {
    pub fn new(outbound: &'a mut Outbound, sink: &'a mut W) -> Self {
        Self {
            outbound,
            sink,
            error: None,
        }
    }

    pub fn finish(self) -> io::Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<W: Write> Emit for Emitter<'_, W> {
    fn emit(&mut self, data: Bytes) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.outbound.emit(&mut *self.sink, data) {
            self.error = Some(e);
        }
    }
}
