//! Value commands: a data block follows the command line.
//!
//! Each command is a pure decision over the incoming item and the item
//! currently stored under its key. The connection applies the decision
//! through `ItemStore::update`, so the decision and the write happen as one
//! atomic step.

use crate::context::ServerContext;
use crate::protocol::Response;
use crate::storage::{Item, ItemStore, Mutation};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Registry of value commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// What to store and what to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub mutation: Mutation,
    pub reply: Bytes,
}

impl Decision {
    fn stored(item: Item) -> Self {
        Self {
            mutation: Mutation::Put(item),
            reply: Response::stored(),
        }
    }

    fn not_stored() -> Self {
        Self {
            mutation: Mutation::Keep,
            reply: Response::not_stored(),
        }
    }
}

impl ValueCommand {
    /// Find the command registered under `name`.
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "set" => Some(Self::Set),
            "add" => Some(Self::Add),
            "replace" => Some(Self::Replace),
            "append" => Some(Self::Append),
            "prepend" => Some(Self::Prepend),
            _ => None,
        }
    }

    /// Decide the outcome of storing `item` over `previous`.
    pub fn decide(self, mut item: Item, previous: Option<&Item>) -> Decision {
        match (self, previous) {
            (Self::Set, _) => Decision::stored(item),
            (Self::Add, None) | (Self::Replace, Some(_)) => Decision::stored(item),
            (Self::Add, Some(_)) | (Self::Replace, None) => Decision::not_stored(),
            (Self::Append, Some(previous)) => {
                item.value = concat(&previous.value, &item.value);
                Decision::stored(item)
            }
            (Self::Prepend, Some(previous)) => {
                item.value = concat(&item.value, &previous.value);
                Decision::stored(item)
            }
            (Self::Append, None) | (Self::Prepend, None) => Decision::not_stored(),
        }
    }

    /// Decide and store `item` in one atomic update, keeping the live item
    /// count in step with the store. Returns the reply for the client.
    pub fn apply(
        self,
        item: Item,
        store: &mut dyn ItemStore,
        context: &mut ServerContext,
    ) -> Bytes {
        let key = item.key.clone();
        let mut incoming = Some(item);
        let mut reply = Response::not_stored();

        let outcome = store.update(&key, &mut |previous| match incoming.take() {
            Some(item) => {
                let decision = self.decide(item, previous);
                reply = decision.reply;
                decision.mutation
            }
            None => Mutation::Keep,
        });
        context.adjust_items(outcome.item_delta());

        trace!(command = ?self, key = %key, ?outcome, "Value command applied");
        reply
    }
}

fn concat(head: &[u8], tail: &[u8]) -> Bytes {
    let mut value = BytesMut::with_capacity(head.len() + tail.len());
    value.put_slice(head);
    value.put_slice(tail);
    value.freeze()
}
