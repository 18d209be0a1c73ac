//! Lists: the array handler.
//!
//! Index reads track per-index deps; length and iteration track the
//! `Length` sentinel, which every length-affecting write also triggers.
//! Ordering mutators (`shift`, `unshift`, `splice`, `truncate`) snapshot
//! the old contents, apply the change raw, then report exactly the index
//! slots whose values really moved, all inside one batch, so dependents
//! dispatch once. Search methods compare with both the given value and its
//! raw form, so a wrapped handle still finds its raw twin.
//!
//! Unlike records, index reads do not unwrap cells; a stored
//! [`Ref`](crate::Ref) comes back as the cell itself.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::arena::dep_map::{self, TargetId, TargetKind, TriggerOp};
use crate::batch;
use crate::key::PropKey;
use crate::reactive::{Flavor, RAW_FROZEN, to_raw, wrap_value};
use crate::value::Value;

pub(crate) struct RawList {
    id: TargetId,
    flags: AtomicU8,
    items: RwLock<Vec<Value>>,
}

impl Drop for RawList {
    fn drop(&mut self) {
        dep_map::release_target(self.id);
    }
}

/// An ordered list handle; equality is raw identity plus flavor.
#[derive(Clone)]
pub struct List {
    raw: Arc<RawList>,
    flavor: Flavor,
}

impl List {
    /// Create an empty plain list.
    pub fn new() -> List {
        Self::from_values(std::iter::empty::<Value>())
    }

    /// Create a plain list from values.
    pub fn from_values<I, V>(values: I) -> List
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        List {
            raw: Arc::new(RawList {
                id: TargetId::next(),
                flags: AtomicU8::new(0),
                items: RwLock::new(values.into_iter().map(Into::into).collect()),
            }),
            flavor: Flavor::Raw,
        }
    }

    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) fn with_flavor(&self, flavor: Flavor) -> List {
        List {
            raw: self.raw.clone(),
            flavor,
        }
    }

    pub(crate) fn raw_flags(&self) -> u8 {
        self.raw.flags.load(Ordering::Relaxed)
    }

    pub(crate) fn set_raw_flag(&self, flag: u8) {
        self.raw.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub(crate) fn same_identity(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw) && self.flavor == other.flavor
    }

    pub(crate) fn identity_hash(&self) -> (usize, Flavor) {
        (Arc::as_ptr(&self.raw) as usize, self.flavor)
    }

    fn rejects_writes(&self, what: &str) -> bool {
        if self.flavor.is_readonly() {
            tracing::warn!("{what} on a readonly list is ignored");
            return true;
        }
        if self.raw_flags() & RAW_FROZEN != 0 {
            tracing::warn!("{what} on a frozen list is ignored");
            return true;
        }
        false
    }

    /// Read one index. Tracked per index through non-raw flavors.
    pub fn get(&self, index: usize) -> Option<Value> {
        if self.flavor.is_raw() {
            return self.raw.items.read().get(index).cloned();
        }
        dep_map::track(self.raw.id, PropKey::Index(index));
        let value = self.raw.items.read().get(index).cloned()?;
        Some(wrap_value(self.flavor, value))
    }

    /// Write one index; extends the list (padding with nulls) when the
    /// index is past the end.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        if self.rejects_writes("set") {
            return;
        }
        let value = value.into();
        let stored = if self.flavor.is_shallow() || self.flavor.is_raw() {
            value
        } else {
            to_raw(&value)
        };
        if self.flavor.is_raw() {
            let mut items = self.raw.items.write();
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items[index] = stored;
            return;
        }

        let op = {
            let mut items = self.raw.items.write();
            if index < items.len() {
                if items[index] == stored {
                    None
                } else {
                    items[index] = stored;
                    Some(TriggerOp::Set)
                }
            } else {
                items.resize(index, Value::Null);
                items.push(stored);
                Some(TriggerOp::Add)
            }
        };
        if let Some(op) = op {
            dep_map::trigger(self.raw.id, TargetKind::List, Some(PropKey::Index(index)), op);
        }
    }

    /// Number of elements. Tracks the length sentinel.
    pub fn len(&self) -> usize {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Length);
        }
        self.raw.items.read().len()
    }

    /// Whether the list is empty. Tracks the length sentinel.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an element.
    pub fn push(&self, value: impl Into<Value>) {
        if self.rejects_writes("push") {
            return;
        }
        let value = value.into();
        let stored = if self.flavor.is_shallow() || self.flavor.is_raw() {
            value
        } else {
            to_raw(&value)
        };
        let index = {
            let mut items = self.raw.items.write();
            items.push(stored);
            items.len() - 1
        };
        if !self.flavor.is_raw() {
            dep_map::trigger(
                self.raw.id,
                TargetKind::List,
                Some(PropKey::Index(index)),
                TriggerOp::Add,
            );
        }
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Option<Value> {
        if self.rejects_writes("pop") {
            return None;
        }
        let (removed, index) = {
            let mut items = self.raw.items.write();
            let removed = items.pop()?;
            (removed, items.len())
        };
        if !self.flavor.is_raw() {
            dep_map::trigger(
                self.raw.id,
                TargetKind::List,
                Some(PropKey::Index(index)),
                TriggerOp::Delete,
            );
        }
        Some(wrap_value(self.flavor, removed))
    }

    /// Remove and return the first element; surviving elements shift down.
    pub fn shift(&self) -> Option<Value> {
        if self.rejects_writes("shift") {
            return None;
        }
        let (removed, old, new) = {
            let mut items = self.raw.items.write();
            if items.is_empty() {
                return None;
            }
            let old = items.clone();
            let removed = items.remove(0);
            (removed, old, items.clone())
        };
        self.report_reindex(&old, &new);
        Some(wrap_value(self.flavor, removed))
    }

    /// Insert an element at the front; existing elements shift up.
    pub fn unshift(&self, value: impl Into<Value>) {
        if self.rejects_writes("unshift") {
            return;
        }
        let value = value.into();
        let stored = if self.flavor.is_shallow() || self.flavor.is_raw() {
            value
        } else {
            to_raw(&value)
        };
        let (old, new) = {
            let mut items = self.raw.items.write();
            let old = items.clone();
            items.insert(0, stored);
            (old, items.clone())
        };
        self.report_reindex(&old, &new);
    }

    /// Remove `delete_count` elements starting at `start`, inserting
    /// `values` in their place; returns the removed elements.
    pub fn splice<I, V>(&self, start: usize, delete_count: usize, values: I) -> Vec<Value>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if self.rejects_writes("splice") {
            return Vec::new();
        }
        let inserted: Vec<Value> = values
            .into_iter()
            .map(Into::into)
            .map(|v| {
                if self.flavor.is_shallow() || self.flavor.is_raw() {
                    v
                } else {
                    to_raw(&v)
                }
            })
            .collect();

        let (removed, old, new) = {
            let mut items = self.raw.items.write();
            let old = items.clone();
            let start = start.min(items.len());
            let end = (start + delete_count).min(items.len());
            let removed: Vec<Value> = items.splice(start..end, inserted).collect();
            (removed, old, items.clone())
        };
        self.report_reindex(&old, &new);
        removed
            .into_iter()
            .map(|v| wrap_value(self.flavor, v))
            .collect()
    }

    /// Shorten the list to `len` elements.
    pub fn truncate(&self, len: usize) {
        if self.rejects_writes("truncate") {
            return;
        }
        let (old, new) = {
            let mut items = self.raw.items.write();
            if len >= items.len() {
                return;
            }
            let old = items.clone();
            items.truncate(len);
            (old, items.clone())
        };
        self.report_reindex(&old, &new);
    }

    /// Report index-level changes between two snapshots in one batch: SET
    /// for moved values, ADD for growth, DELETE for shrinkage. ADD and
    /// DELETE sweep the length sentinel once by the trigger rules.
    fn report_reindex(&self, old: &[Value], new: &[Value]) {
        if self.flavor.is_raw() {
            return;
        }
        batch::batch(|| {
            let common = old.len().min(new.len());
            for i in 0..common {
                if old[i] != new[i] {
                    dep_map::trigger(
                        self.raw.id,
                        TargetKind::List,
                        Some(PropKey::Index(i)),
                        TriggerOp::Set,
                    );
                }
            }
            for i in old.len()..new.len() {
                dep_map::trigger(
                    self.raw.id,
                    TargetKind::List,
                    Some(PropKey::Index(i)),
                    TriggerOp::Add,
                );
            }
            for i in new.len()..old.len() {
                dep_map::trigger(
                    self.raw.id,
                    TargetKind::List,
                    Some(PropKey::Index(i)),
                    TriggerOp::Delete,
                );
            }
        });
    }

    /// Whether the list contains `value`, by SameValue on either the given
    /// form or its raw form.
    pub fn includes(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }

    /// First index holding `value` (given or raw form).
    pub fn index_of(&self, value: &Value) -> Option<usize> {
        let items = self.search_snapshot();
        let raw = to_raw(value);
        items.iter().position(|v| v == value || *v == raw)
    }

    /// Last index holding `value` (given or raw form).
    pub fn last_index_of(&self, value: &Value) -> Option<usize> {
        let items = self.search_snapshot();
        let raw = to_raw(value);
        items.iter().rposition(|v| v == value || *v == raw)
    }

    fn search_snapshot(&self) -> Vec<Value> {
        let items = self.raw.items.read().clone();
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Length);
            for i in 0..items.len() {
                dep_map::track(self.raw.id, PropKey::Index(i));
            }
        }
        items
    }

    /// Iterate over a snapshot, wrapping elements lazily. Tracks the
    /// length sentinel.
    pub fn iter(&self) -> ListIter {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Length);
        }
        ListIter {
            inner: self.raw.items.read().clone().into_iter(),
            flavor: self.flavor,
        }
    }

    /// Collect the wrapped elements. Tracks the length sentinel.
    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().collect()
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shallow by design: lists can hold cycles.
        write!(f, "List({:p}, {:?})", Arc::as_ptr(&self.raw), self.flavor)
    }
}

/// Snapshot iterator over a list; elements are wrapped on yield.
pub struct ListIter {
    inner: std::vec::IntoIter<Value>,
    flavor: Flavor,
}

impl Iterator for ListIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.inner.next().map(|v| wrap_value(self.flavor, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::reactive::reactive;
    use crate::record::Record;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn reactive_list() -> List {
        reactive(List::new()).as_list().unwrap().clone()
    }

    #[test]
    fn push_and_pop_drive_length_subscribers() {
        let l = reactive_list();
        let runs = Arc::new(AtomicUsize::new(0));

        let l2 = l.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            l2.len();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);

        l.push(1);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        l.pop();
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 3);
        // Empty pop is not a change.
        assert!(l.pop().is_none());
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn in_place_set_does_not_touch_length_subscribers() {
        let l = reactive_list();
        l.push(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let l2 = l.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            l2.len();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });

        l.set(0, 9);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
        l.set(5, 1); // extends: length changed
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(l.get(3), Some(Value::Null));
    }

    #[test]
    fn shift_dispatches_each_dependent_once() {
        let l = reactive_list();
        l.push(1);
        l.push(2);
        l.push(3);

        let runs = Arc::new(AtomicUsize::new(0));
        let l2 = l.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            l2.get(0);
            l2.len();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);

        assert_eq!(l.shift(), Some(Value::Int(1)));
        // Index 0 and length both changed, one dispatch.
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(l.get(0), Some(Value::Int(2)));
    }

    #[test]
    fn splice_reports_removed_values() {
        let l = reactive_list();
        for i in 0..5 {
            l.push(i as i64);
        }
        let removed = l.splice(1, 2, [9i64]);
        assert_eq!(removed, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(l.to_vec(), vec![
            Value::Int(0),
            Value::Int(9),
            Value::Int(3),
            Value::Int(4)
        ]);
    }

    #[test]
    fn search_sees_through_flavors() {
        let needle = Record::new();
        let l = reactive_list();
        l.push(needle.clone());

        // Stored raw; searching with the wrapped handle still finds it.
        let wrapped = reactive(needle.clone());
        assert!(l.includes(&wrapped));
        assert_eq!(l.index_of(&Value::Record(needle)), Some(0));
        assert!(!l.includes(&Value::Record(Record::new())));
    }
}
