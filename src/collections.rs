//! Keyed collections: the map and set handlers.
//!
//! Maps and sets key by [`Value`] with SameValue semantics, which lets a
//! flavored handle be used where its raw twin was inserted: read paths
//! track and look up both the given key and its raw form, and new entries
//! are stored under the raw form. `size`, `for_each` and value iteration
//! track the `Iterate` sentinel; map key-only iteration tracks
//! `MapKeyIterate`, so `keys()` subscribers ignore value-only SETs.
//!
//! Write paths mutate first and trigger after, only on actual change:
//! ADD for new keys, SET when the stored value is SameValue-unequal,
//! DELETE only when the key existed, CLEAR only when non-empty.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::arena::dep_map::{self, TargetId, TargetKind, TriggerOp};
use crate::hash::{FastIndexMap, FastIndexSet};
use crate::key::PropKey;
use crate::reactive::{Flavor, RAW_FROZEN, to_raw, wrap_value};
use crate::value::Value;

pub(crate) struct RawMap {
    id: TargetId,
    flags: AtomicU8,
    entries: RwLock<FastIndexMap<Value, Value>>,
}

impl Drop for RawMap {
    fn drop(&mut self) {
        dep_map::release_target(self.id);
    }
}

/// A keyed map handle; equality is raw identity plus flavor.
#[derive(Clone)]
pub struct Map {
    raw: Arc<RawMap>,
    flavor: Flavor,
}

impl Map {
    /// Create an empty plain map.
    pub fn new() -> Map {
        Map {
            raw: Arc::new(RawMap {
                id: TargetId::next(),
                flags: AtomicU8::new(0),
                entries: RwLock::new(FastIndexMap::default()),
            }),
            flavor: Flavor::Raw,
        }
    }

    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) fn with_flavor(&self, flavor: Flavor) -> Map {
        Map {
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

    pub(crate) fn same_identity(&self, other: &Map) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw) && self.flavor == other.flavor
    }

    pub(crate) fn identity_hash(&self) -> (usize, Flavor) {
        (Arc::as_ptr(&self.raw) as usize, self.flavor)
    }

    /// Track a keyed read under both the given key and its raw form.
    fn track_key(&self, key: &Value) {
        if self.flavor.is_raw() {
            return;
        }
        dep_map::track(self.raw.id, PropKey::Val(key.clone()));
        let raw = to_raw(key);
        if raw != *key {
            dep_map::track(self.raw.id, PropKey::Val(raw));
        }
    }

    fn lookup(&self, key: &Value) -> Option<Value> {
        let entries = self.raw.entries.read();
        if let Some(v) = entries.get(key) {
            return Some(v.clone());
        }
        let raw = to_raw(key);
        if raw != *key {
            return entries.get(&raw).cloned();
        }
        None
    }

    /// Read the value under `key` (given or raw form), wrapped by flavor.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.track_key(key);
        Some(wrap_value(self.flavor, self.lookup(key)?))
    }

    /// Whether either form of `key` is present.
    pub fn has(&self, key: &Value) -> bool {
        self.track_key(key);
        self.lookup(key).is_some()
    }

    /// Number of entries. Tracks iteration.
    pub fn len(&self) -> usize {
        self.track_iteration(PropKey::Iterate);
        self.raw.entries.read().len()
    }

    /// Whether the map is empty. Tracks iteration.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update an entry. New entries are keyed by the raw form of
    /// the key; values are stored raw except through shallow flavors.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if self.flavor.is_readonly() {
            tracing::warn!("set on a readonly map is ignored");
            return;
        }
        if self.raw_flags() & RAW_FROZEN != 0 {
            tracing::warn!("set on a frozen map is ignored");
            return;
        }
        if self.flavor.is_raw() {
            self.raw.entries.write().insert(key, value);
            return;
        }

        let stored = if self.flavor.is_shallow() {
            value
        } else {
            to_raw(&value)
        };
        let (key_form, op) = {
            let mut entries = self.raw.entries.write();
            let key_form = if entries.contains_key(&key) {
                key
            } else {
                to_raw(&key)
            };
            let op = match entries.get(&key_form) {
                Some(old) if *old == stored => None,
                Some(_) => {
                    entries.insert(key_form.clone(), stored);
                    Some(TriggerOp::Set)
                }
                None => {
                    entries.insert(key_form.clone(), stored);
                    Some(TriggerOp::Add)
                }
            };
            (key_form, op)
        };
        if let Some(op) = op {
            dep_map::trigger(self.raw.id, TargetKind::Map, Some(PropKey::Val(key_form)), op);
        }
    }

    /// Remove either form of `key`; triggers only when something was
    /// removed.
    pub fn delete(&self, key: &Value) -> bool {
        if self.flavor.is_readonly() {
            tracing::warn!("delete on a readonly map is ignored");
            return false;
        }
        let removed_key = {
            let mut entries = self.raw.entries.write();
            if entries.shift_remove(key).is_some() {
                Some(key.clone())
            } else {
                let raw = to_raw(key);
                if raw != *key && entries.shift_remove(&raw).is_some() {
                    Some(raw)
                } else {
                    None
                }
            }
        };
        match removed_key {
            Some(k) => {
                if !self.flavor.is_raw() {
                    dep_map::trigger(
                        self.raw.id,
                        TargetKind::Map,
                        Some(PropKey::Val(k)),
                        TriggerOp::Delete,
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Remove every entry; triggers CLEAR only when the map was non-empty.
    pub fn clear(&self) {
        if self.flavor.is_readonly() {
            tracing::warn!("clear on a readonly map is ignored");
            return;
        }
        let was_populated = {
            let mut entries = self.raw.entries.write();
            let was_populated = !entries.is_empty();
            entries.clear();
            was_populated
        };
        if was_populated && !self.flavor.is_raw() {
            dep_map::trigger(self.raw.id, TargetKind::Map, None, TriggerOp::Clear);
        }
    }

    /// Visit every entry as `(value, key)`, both wrapped by flavor.
    /// Tracks iteration.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Value, &Value),
    {
        self.track_iteration(PropKey::Iterate);
        let snapshot: Vec<(Value, Value)> = self
            .raw
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in snapshot {
            f(
                &wrap_value(self.flavor, v),
                &wrap_value(self.flavor, k),
            );
        }
    }

    /// Iterate over keys. Tracks key-only iteration: value SETs do not
    /// re-run subscribers of this.
    pub fn keys(&self) -> ValuesIter {
        self.track_iteration(PropKey::MapKeyIterate);
        ValuesIter {
            inner: self
                .raw
                .entries
                .read()
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .into_iter(),
            flavor: self.flavor,
        }
    }

    /// Iterate over values. Tracks iteration.
    pub fn values(&self) -> ValuesIter {
        self.track_iteration(PropKey::Iterate);
        ValuesIter {
            inner: self
                .raw
                .entries
                .read()
                .values()
                .cloned()
                .collect::<Vec<_>>()
                .into_iter(),
            flavor: self.flavor,
        }
    }

    /// Iterate over `(key, value)` pairs. Tracks iteration.
    pub fn entries(&self) -> EntriesIter {
        self.track_iteration(PropKey::Iterate);
        EntriesIter {
            inner: self
                .raw
                .entries
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
                .into_iter(),
            flavor: self.flavor,
        }
    }

    fn track_iteration(&self, key: PropKey) {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, key);
        }
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map({:p}, {:?})", Arc::as_ptr(&self.raw), self.flavor)
    }
}

pub(crate) struct RawSet {
    id: TargetId,
    flags: AtomicU8,
    items: RwLock<FastIndexSet<Value>>,
}

impl Drop for RawSet {
    fn drop(&mut self) {
        dep_map::release_target(self.id);
    }
}

/// A set handle; equality is raw identity plus flavor.
#[derive(Clone)]
pub struct Set {
    raw: Arc<RawSet>,
    flavor: Flavor,
}

impl Set {
    /// Create an empty plain set.
    pub fn new() -> Set {
        Set {
            raw: Arc::new(RawSet {
                id: TargetId::next(),
                flags: AtomicU8::new(0),
                items: RwLock::new(FastIndexSet::default()),
            }),
            flavor: Flavor::Raw,
        }
    }

    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) fn with_flavor(&self, flavor: Flavor) -> Set {
        Set {
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

    pub(crate) fn same_identity(&self, other: &Set) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw) && self.flavor == other.flavor
    }

    pub(crate) fn identity_hash(&self) -> (usize, Flavor) {
        (Arc::as_ptr(&self.raw) as usize, self.flavor)
    }

    /// Whether either form of `value` is a member.
    pub fn has(&self, value: &Value) -> bool {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Val(value.clone()));
            let raw = to_raw(value);
            if raw != *value {
                dep_map::track(self.raw.id, PropKey::Val(raw));
            }
        }
        let items = self.raw.items.read();
        if items.contains(value) {
            return true;
        }
        let raw = to_raw(value);
        raw != *value && items.contains(&raw)
    }

    /// Number of members. Tracks iteration.
    pub fn len(&self) -> usize {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Iterate);
        }
        self.raw.items.read().len()
    }

    /// Whether the set is empty. Tracks iteration.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `value` (stored raw); triggers ADD only when it was absent.
    pub fn add(&self, value: impl Into<Value>) {
        let value = value.into();
        if self.flavor.is_readonly() {
            tracing::warn!("add on a readonly set is ignored");
            return;
        }
        if self.raw_flags() & RAW_FROZEN != 0 {
            tracing::warn!("add on a frozen set is ignored");
            return;
        }
        if self.flavor.is_raw() {
            self.raw.items.write().insert(value);
            return;
        }

        let stored = to_raw(&value);
        let added = self.raw.items.write().insert(stored.clone());
        if added {
            dep_map::trigger(
                self.raw.id,
                TargetKind::Set,
                Some(PropKey::Val(stored)),
                TriggerOp::Add,
            );
        }
    }

    /// Remove either form of `value`; triggers only on actual removal.
    pub fn delete(&self, value: &Value) -> bool {
        if self.flavor.is_readonly() {
            tracing::warn!("delete on a readonly set is ignored");
            return false;
        }
        let removed = {
            let mut items = self.raw.items.write();
            if items.shift_remove(value) {
                Some(value.clone())
            } else {
                let raw = to_raw(value);
                if raw != *value && items.shift_remove(&raw) {
                    Some(raw)
                } else {
                    None
                }
            }
        };
        match removed {
            Some(v) => {
                if !self.flavor.is_raw() {
                    dep_map::trigger(
                        self.raw.id,
                        TargetKind::Set,
                        Some(PropKey::Val(v)),
                        TriggerOp::Delete,
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Remove every member; triggers CLEAR only when non-empty.
    pub fn clear(&self) {
        if self.flavor.is_readonly() {
            tracing::warn!("clear on a readonly set is ignored");
            return;
        }
        let was_populated = {
            let mut items = self.raw.items.write();
            let was_populated = !items.is_empty();
            items.clear();
            was_populated
        };
        if was_populated && !self.flavor.is_raw() {
            dep_map::trigger(self.raw.id, TargetKind::Set, None, TriggerOp::Clear);
        }
    }

    /// Visit every member, wrapped by flavor. Tracks iteration.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Value),
    {
        for v in self.iter() {
            f(&v);
        }
    }

    /// Iterate over a snapshot of the members. Tracks iteration.
    pub fn iter(&self) -> ValuesIter {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Iterate);
        }
        ValuesIter {
            inner: self
                .raw
                .items
                .read()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .into_iter(),
            flavor: self.flavor,
        }
    }
}

impl Default for Set {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Set({:p}, {:?})", Arc::as_ptr(&self.raw), self.flavor)
    }
}

/// Snapshot iterator over keys, values or set members; items are wrapped
/// on yield.
pub struct ValuesIter {
    inner: std::vec::IntoIter<Value>,
    flavor: Flavor,
}

impl Iterator for ValuesIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.inner.next().map(|v| wrap_value(self.flavor, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Snapshot iterator over `(key, value)` pairs; both sides are wrapped on
/// yield.
pub struct EntriesIter {
    inner: std::vec::IntoIter<(Value, Value)>,
    flavor: Flavor,
}

impl Iterator for EntriesIter {
    type Item = (Value, Value);

    fn next(&mut self) -> Option<(Value, Value)> {
        self.inner
            .next()
            .map(|(k, v)| (wrap_value(self.flavor, k), wrap_value(self.flavor, v)))
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
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn reactive_map() -> Map {
        reactive(Map::new()).as_map().unwrap().clone()
    }

    fn reactive_set() -> Set {
        reactive(Set::new()).as_set().unwrap().clone()
    }

    #[test]
    fn set_only_triggers_on_change() {
        let m = reactive_map();
        let runs = Arc::new(AtomicUsize::new(0));

        let m2 = m.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            m2.get(&Value::from("x"));
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });

        m.set("x", 1);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        m.set("x", 1);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        m.set("x", 2);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn key_iteration_ignores_value_sets() {
        let m = reactive_map();
        m.set("a", 1);
        let runs = Arc::new(AtomicUsize::new(0));

        let m2 = m.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            let _: Vec<Value> = m2.keys().collect();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);

        m.set("a", 2); // value-only change
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
        m.set("b", 1); // new key
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        m.delete(&Value::from("missing"));
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn value_iteration_sees_value_sets() {
        let m = reactive_map();
        m.set("a", 1);
        let runs = Arc::new(AtomicUsize::new(0));

        let m2 = m.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            let _: Vec<Value> = m2.values().collect();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });

        m.set("a", 2);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn flavored_keys_normalize_to_raw() {
        let key = crate::record::Record::new();
        let m = reactive_map();

        // Insert through a wrapped key; stored under the raw form.
        let wrapped_key = reactive(key.clone());
        m.set(wrapped_key.clone(), 1);
        assert_eq!(m.get(&Value::Record(key.clone())), Some(Value::Int(1)));
        assert_eq!(m.get(&wrapped_key), Some(Value::Int(1)));
        assert!(m.delete(&wrapped_key));
        assert!(m.is_empty());
    }

    #[test]
    fn clear_triggers_once_and_only_when_populated() {
        let m = reactive_map();
        let runs = Arc::new(AtomicUsize::new(0));

        let m2 = m.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            m2.len();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });

        m.clear(); // empty: no trigger
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 1);
        m.set("a", 1);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        m.clear();
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn set_membership_and_dedup() {
        let s = reactive_set();
        let runs = Arc::new(AtomicUsize::new(0));

        let s2 = s.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            s2.len();
            runs2.fetch_add(1, AtomicOrdering::Relaxed);
        });

        s.add(1);
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        s.add(1); // already present
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 2);
        assert!(s.has(&Value::Int(1)));
        assert!(s.delete(&Value::Int(1)));
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 3);
        assert!(!s.delete(&Value::Int(1)));
        assert_eq!(runs.load(AtomicOrdering::Relaxed), 3);
    }
}
