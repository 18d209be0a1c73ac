//! Reactive cells: single-value sources with `.get()` / `.set()`.
//!
//! A [`Ref`] owns one [`Value`] and a dedicated dep. Reads track, writes
//! trigger unless the new value is SameValue-equal to the old (compared on
//! raw forms, so rewrapping the same container is a no-op). A deep ref
//! converts stored containers to their reactive flavor; a shallow ref
//! stores exactly what it is given.
//!
//! Inside deep reactive records, refs unwrap transparently: reading the
//! slot yields the cell's value, assigning the slot writes the cell.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::arena::dep_map;
use crate::arena::graph::DepId;
use crate::arena::tracking;
use crate::reactive::{to_raw, to_reactive};
use crate::value::Value;

struct RefData {
    dep: DepId,
    shallow: bool,
    value: RwLock<Value>,
}

impl Drop for RefData {
    fn drop(&mut self) {
        dep_map::free_dep(self.dep);
    }
}

/// A reactive cell. Cheap to clone; clones share the same cell.
#[derive(Clone)]
pub struct Ref(Arc<RefData>);

impl Ref {
    /// Create a deep cell: stored containers become reactive.
    pub fn new(value: impl Into<Value>) -> Ref {
        Self::create(value.into(), false)
    }

    /// Create a shallow cell: the value is stored untouched and only the
    /// `.value` slot itself is reactive.
    pub fn shallow(value: impl Into<Value>) -> Ref {
        Self::create(value.into(), true)
    }

    fn create(value: Value, shallow: bool) -> Ref {
        let stored = if shallow { value } else { to_reactive(value) };
        Ref(Arc::new(RefData {
            dep: dep_map::alloc_dep(None),
            shallow,
            value: RwLock::new(stored),
        }))
    }

    /// Read the cell, tracking it as a dependency of the observing
    /// subscriber.
    pub fn get(&self) -> Value {
        tracking::track_dep(self.0.dep);
        self.0.value.read().clone()
    }

    /// Write the cell. No-op when the new value is SameValue-equal to the
    /// current one (compared on raw forms).
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        let stored = if self.0.shallow {
            value
        } else {
            to_reactive(value)
        };

        {
            let current = self.0.value.read();
            if to_raw(&current) == to_raw(&stored) {
                return;
            }
        }
        *self.0.value.write() = stored;
        dep_map::trigger_single(self.0.dep);
    }

    /// Whether this cell stores values untouched.
    pub fn is_shallow(&self) -> bool {
        self.0.shallow
    }

    pub(crate) fn same_identity(&self, other: &Ref) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity_hash(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shallow by design: cells can hold cycles.
        write!(f, "Ref({:p})", Arc::as_ptr(&self.0))
    }
}
