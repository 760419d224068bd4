//! Simple commands: no data block follows the command line.

use super::{Emit, Flow};
use crate::context::ServerContext;
use crate::protocol::Response;
use crate::storage::{ItemStore, KeyRange, Visit};
use std::ops::{Bound, ControlFlow};
use tracing::trace;

/// Registry of simple commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleCommand {
    Get,
    Delete,
    Stats,
    FlushAll,
    Quit,
    Rget,
}

impl SimpleCommand {
    /// Find the command registered under `name`.
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "get" => Some(Self::Get),
            "delete" => Some(Self::Delete),
            "stats" => Some(Self::Stats),
            "flush_all" => Some(Self::FlushAll),
            "quit" => Some(Self::Quit),
            "rget" => Some(Self::Rget),
            _ => None,
        }
    }

    /// Run the command. `args[0]` is the command name.
    pub fn execute(
        self,
        args: &[&str],
        store: &mut dyn ItemStore,
        context: &mut ServerContext,
        out: &mut dyn Emit,
    ) -> Flow {
        trace!(command = ?self, ?args, "Executing command");
        match self {
            Self::Get => get(args, store, out),
            Self::Delete => delete(args, store, context, out),
            Self::Stats => stats(context, out),
            Self::FlushAll => flush_all(store, context, out),
            Self::Quit => return Flow::Close,
            Self::Rget => rget(args, store, out),
        }
        Flow::Continue
    }
}

/// `get` with no keys is an empty lookup: just `END`.
fn get(args: &[&str], store: &dyn ItemStore, out: &mut dyn Emit) {
    store.lookup(&args[1..], &mut |visit| {
        match visit {
            Visit::Found(_, item) => out.emit(Response::value(&item.key, &item.flags, &item.value)),
            Visit::Missing(_) => {}
            Visit::Done => out.emit(Response::end()),
        }
        ControlFlow::Continue(())
    });
}

fn delete(args: &[&str], store: &mut dyn ItemStore, context: &mut ServerContext, out: &mut dyn Emit) {
    if args.len() != 2 {
        out.emit(Response::client_error());
        return;
    }

    match store.remove(args[1]) {
        Some(_) => {
            context.adjust_items(-1);
            out.emit(Response::deleted());
        }
        None => out.emit(Response::not_found()),
    }
}

fn stats(context: &ServerContext, out: &mut dyn Emit) {
    out.emit(Response::stat("num_conns", context.num_conns));
    out.emit(Response::stat("tot_conns", context.tot_conns));
    out.emit(Response::stat("curr_items", context.curr_items));
    out.emit(Response::end());
}

fn flush_all(store: &mut dyn ItemStore, context: &mut ServerContext, out: &mut dyn Emit) {
    store.reset();
    context.curr_items = 0;
    out.emit(Response::ok());
}

/// `rget <start_inclusive> <end_inclusive> <max_items> <start_key> [end_key]`
fn rget(args: &[&str], store: &dyn ItemStore, out: &mut dyn Emit) {
    if !(5..=6).contains(&args.len()) {
        out.emit(Response::client_error());
        return;
    }

    let max_items = match args[3].parse::<usize>() {
        Ok(max_items) => max_items,
        Err(_) => {
            out.emit(Response::client_error());
            return;
        }
    };

    let start = bound(args[4], args[1]);
    let end = args.get(5).map_or(Bound::Unbounded, |&key| bound(key, args[2]));

    let mut sent = 0;
    store.range(KeyRange::new(start, end), &mut |visit| match visit {
        Visit::Found(_, item) => {
            out.emit(Response::value(&item.key, &item.flags, &item.value));
            sent += 1;
            if max_items == 0 || sent < max_items {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        }
        Visit::Missing(_) => ControlFlow::Continue(()),
        Visit::Done => {
            out.emit(Response::end());
            ControlFlow::Continue(())
        }
    });
}

/// `"1"` marks an inclusive bound; anything else is exclusive.
fn bound<'a>(key: &'a str, inclusion: &str) -> Bound<&'a str> {
    if inclusion == "1" {
        Bound::Included(key)
    } else {
        Bound::Excluded(key)
    }
}
