//! Property keys for dependency tracking.
//!
//! Every dependency record is addressed by `(target, key)` where the key is
//! a [`PropKey`]: a named slot, a list index, an opaque symbol, a collection
//! key value, or one of three iteration sentinels. The sentinels are their
//! own variants, so they can never collide with user keys.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

/// An opaque, process-unique token usable as a property key.
///
/// Symbols compare equal only to themselves. Allocating one is a single
/// atomic increment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u64);

static NEXT_SYMBOL: AtomicU64 = AtomicU64::new(1);

impl Symbol {
    /// Allocate a fresh symbol, distinct from every other symbol.
    pub fn new() -> Self {
        Symbol(NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Symbol {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

/// A key addressing one dependency record of a reactive target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropKey {
    /// A named record slot.
    Str(Arc<str>),
    /// A list index.
    Index(usize),
    /// An opaque [`Symbol`] key.
    Sym(Symbol),
    /// A map or set key, compared with SameValue semantics.
    Val(Value),
    /// Sentinel: keyed iteration over a record, map or set.
    Iterate,
    /// Sentinel: key-only iteration over a map (`Map::keys`).
    MapKeyIterate,
    /// Sentinel: list length and index iteration.
    Length,
}

impl PropKey {
    /// True for the three iteration sentinels.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            PropKey::Iterate | PropKey::MapKeyIterate | PropKey::Length
        )
    }
}

impl From<&str> for PropKey {
    fn from(s: &str) -> Self {
        PropKey::Str(Arc::from(s))
    }
}

impl From<String> for PropKey {
    fn from(s: String) -> Self {
        PropKey::Str(Arc::from(s.as_str()))
    }
}

impl From<usize> for PropKey {
    fn from(i: usize) -> Self {
        PropKey::Index(i)
    }
}

impl From<Symbol> for PropKey {
    fn from(s: Symbol) -> Self {
        PropKey::Sym(s)
    }
}

impl From<Value> for PropKey {
    fn from(v: Value) -> Self {
        PropKey::Val(v)
    }
}
