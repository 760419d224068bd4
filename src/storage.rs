//! In-memory item storage.
//!
//! Provides the `ItemStore` abstraction used by the protocol engine and two
//! backends:
//! - `OrderedStore`: sorted map, range scans visit keys in ascending order
//! - `HashStore`: hash map, range scans visit keys in unspecified order
//!
//! Every operation reports its results through a visitor or a return value
//! that marks completion explicitly, so a backend that later performs real
//! I/O can keep the same shape. `update` takes `&mut self`, which makes the
//! read-modify-write of a single key atomic with respect to every other
//! store operation.

use bytes::Bytes;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, ControlFlow};
use tracing::{info, trace};

/// A single cached item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Key the item is stored under
    pub key: String,
    /// Client flags, echoed back verbatim
    pub flags: String,
    /// Expiration as sent by the client (stored, never enforced)
    pub exptime: i64,
    /// The stored value
    pub value: Bytes,
}

impl Item {
    pub fn new(key: impl Into<String>, flags: impl Into<String>, exptime: i64, value: Bytes) -> Self {
        Self {
            key: key.into(),
            flags: flags.into(),
            exptime,
            value,
        }
    }
}

/// One step of a lookup or range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit<'a> {
    /// An item is stored under the key
    Found(&'a str, &'a Item),
    /// No item is stored under the key (lookups only)
    Missing(&'a str),
    /// The scan is complete; delivered exactly once, last
    Done,
}

/// What `update` should do with a key after inspecting its current item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Leave the key as it was
    Keep,
    /// Store this item under the key, replacing any previous one
    Put(Item),
    /// Remove the key
    Remove,
}

/// Completion of an `update`: whether the key held an item before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub existed: bool,
    pub exists: bool,
}

impl UpdateOutcome {
    /// Change in the number of stored items caused by the update.
    pub fn item_delta(&self) -> i64 {
        i64::from(self.exists) - i64::from(self.existed)
    }
}

/// Key bounds for a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange<'a> {
    pub start: Bound<&'a str>,
    pub end: Bound<&'a str>,
}

impl<'a> KeyRange<'a> {
    pub fn new(start: Bound<&'a str>, end: Bound<&'a str>) -> Self {
        Self { start, end }
    }

    /// Range covering every key.
    #[cfg(test)]
    pub fn full() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn contains(&self, key: &str) -> bool {
        let above_start = match self.start {
            Bound::Included(start) => key >= start,
            Bound::Excluded(start) => key > start,
            Bound::Unbounded => true,
        };
        let below_end = match self.end {
            Bound::Included(end) => key <= end,
            Bound::Excluded(end) => key < end,
            Bound::Unbounded => true,
        };
        above_start && below_end
    }

    /// True if no key can fall inside the bounds.
    pub fn is_empty(&self) -> bool {
        let (start, start_inclusive) = match self.start {
            Bound::Included(start) => (start, true),
            Bound::Excluded(start) => (start, false),
            Bound::Unbounded => return false,
        };
        let (end, end_inclusive) = match self.end {
            Bound::Included(end) => (end, true),
            Bound::Excluded(end) => (end, false),
            Bound::Unbounded => return false,
        };
        start > end || (start == end && !(start_inclusive && end_inclusive))
    }
}

/// Visitor for lookups and range scans.
pub type Visitor<'v> = dyn for<'a> FnMut(Visit<'a>) -> ControlFlow<()> + 'v;

/// Storage contract shared by all backends.
pub trait ItemStore {
    /// Visit each key in `keys` in order, then `Visit::Done`.
    fn lookup(&self, keys: &[&str], visit: &mut Visitor<'_>);

    /// Read-modify-write a single key. `mutate` is called exactly once with
    /// the current item and its result is applied before the call returns.
    fn update(&mut self, key: &str, mutate: &mut dyn FnMut(Option<&Item>) -> Mutation)
        -> UpdateOutcome;

    /// Delete a key, returning the item it held.
    fn remove(&mut self, key: &str) -> Option<Item>;

    /// Delete every key.
    fn reset(&mut self);

    /// Visit every stored key inside `range`, then `Visit::Done`.
    fn range(&self, range: KeyRange<'_>, visit: &mut Visitor<'_>);

    /// Number of stored items.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Sorted map; range scans are ordered and page deterministically
    #[default]
    Ordered,
    /// Hash map; range scans visit keys in unspecified order
    Hash,
}

impl Backend {
    /// Create an empty store of this kind.
    pub fn build(self) -> Box<dyn ItemStore> {
        info!(backend = ?self, "Initializing storage");
        match self {
            Backend::Ordered => Box::new(OrderedStore::new()),
            Backend::Hash => Box::new(HashStore::new()),
        }
    }
}

/// Apply a mutation to a map entry, shared by both backends.
macro_rules! apply_mutation {
    ($map:expr, $key:expr, $mutate:expr) => {{
        let existed = $map.contains_key($key);
        match $mutate($map.get($key)) {
            Mutation::Keep => {}
            Mutation::Put(item) => {
                $map.insert($key.to_string(), item);
            }
            Mutation::Remove => {
                $map.remove($key);
            }
        }
        let exists = $map.contains_key($key);
        trace!(key = $key, existed, exists, "Item updated");
        UpdateOutcome { existed, exists }
    }};
}

/// Sorted in-memory store
#[derive(Debug, Default)]
pub struct OrderedStore {
    items: BTreeMap<String, Item>,
}

impl OrderedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ItemStore for OrderedStore {
    fn lookup(&self, keys: &[&str], visit: &mut Visitor<'_>) {
        lookup_in(keys, |key| self.items.get(key), visit);
    }

    fn update(
        &mut self,
        key: &str,
        mutate: &mut dyn FnMut(Option<&Item>) -> Mutation,
    ) -> UpdateOutcome {
        apply_mutation!(self.items, key, mutate)
    }

    fn remove(&mut self, key: &str) -> Option<Item> {
        self.items.remove(key)
    }

    fn reset(&mut self) {
        self.items.clear();
    }

    fn range(&self, range: KeyRange<'_>, visit: &mut Visitor<'_>) {
        // BTreeMap::range panics on inverted bounds.
        if !range.is_empty() {
            for (key, item) in self.items.range::<str, _>((range.start, range.end)) {
                if visit(Visit::Found(key, item)).is_break() {
                    break;
                }
            }
        }
        let _ = visit(Visit::Done);
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Hashed in-memory store
#[derive(Debug, Default)]
pub struct HashStore {
    items: HashMap<String, Item>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ItemStore for HashStore {
    fn lookup(&self, keys: &[&str], visit: &mut Visitor<'_>) {
        lookup_in(keys, |key| self.items.get(key), visit);
    }

    fn update(
        &mut self,
        key: &str,
        mutate: &mut dyn FnMut(Option<&Item>) -> Mutation,
    ) -> UpdateOutcome {
        apply_mutation!(self.items, key, mutate)
    }

    fn remove(&mut self, key: &str) -> Option<Item> {
        self.items.remove(key)
    }

    fn reset(&mut self) {
        self.items.clear();
    }

    fn range(&self, range: KeyRange<'_>, visit: &mut Visitor<'_>) {
        for (key, item) in self.items.iter().filter(|(key, _)| range.contains(key)) {
            if visit(Visit::Found(key, item)).is_break() {
                break;
            }
        }
        let _ = visit(Visit::Done);
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn lookup_in<'s>(
    keys: &[&str],
    get: impl Fn(&str) -> Option<&'s Item>,
    visit: &mut Visitor<'_>,
) {
    for &key in keys {
        let step = match get(key) {
            Some(item) => Visit::Found(key, item),
            None => Visit::Missing(key),
        };
        if visit(step).is_break() {
            break;
        }
    }
    let _ = visit(Visit::Done);
}
