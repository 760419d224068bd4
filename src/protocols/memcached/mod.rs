//! Memcached-style command table.
//!
//! Commands fall into two registries:
//! - simple commands (`get`, `delete`, `stats`, `flush_all`, `quit`, `rget`)
//!   run as soon as their line arrives
//! - value commands (`set`, `add`, `replace`, `append`, `prepend`) wait for
//!   a data block and then decide what to store
//!
//! Commands never touch a socket. They write response fragments through an
//! [`Emit`] sink supplied by the connection.

pub mod simple;
pub mod value;

pub use simple::SimpleCommand;
pub use value::ValueCommand;

use bytes::Bytes;

/// Destination for response fragments.
pub trait Emit {
    fn emit(&mut self, data: Bytes);
}

#[cfg(test)]
impl Emit for Vec<Bytes> {
    fn emit(&mut self, data: Bytes) {
        self.push(data);
    }
}

/// What the connection should do after a command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}
