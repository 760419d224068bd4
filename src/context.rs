//! Server-wide state shared by every connection.

use crate::storage::{Backend, ItemStore};
use tracing::debug;

/// Counters reported by `stats`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerContext {
    /// Live item count, maintained by the command table
    pub curr_items: u64,
    /// Currently open connections
    pub num_conns: u64,
    /// Connections accepted since startup
    pub tot_conns: u64,
}

impl ServerContext {
    pub fn connection_opened(&mut self) {
        self.num_conns += 1;
        self.tot_conns += 1;
        debug!(num_conns = self.num_conns, tot_conns = self.tot_conns, "Connection opened");
    }

    pub fn connection_closed(&mut self) {
        self.num_conns = self.num_conns.saturating_sub(1);
        debug!(num_conns = self.num_conns, "Connection closed");
    }

    /// Apply a signed change to the live item count.
    pub fn adjust_items(&mut self, delta: i64) {
        self.curr_items = self.curr_items.saturating_add_signed(delta);
    }
}

/// The item store together with the server counters.
///
/// Owned by the runtime driver and lent to one connection at a time.
pub struct Shared {
    pub store: Box<dyn ItemStore>,
    pub context: ServerContext,
}

impl Shared {
    pub fn new(backend: Backend) -> Self {
        Self {
            store: backend.build(),
            context: ServerContext::default(),
        }
    }
}
