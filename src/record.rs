//! Keyed records: the plain-object handler.
//!
//! A [`Record`] maps [`PropKey`]s to [`Value`]s. Through a reactive or
//! readonly flavor, `get`/`has` track the key's dep, key listing and
//! length track the iterate sentinel, and writes trigger ADD, SET or
//! DELETE, with SameValue-equal assignments suppressed entirely. Deep
//! flavors also unwrap reactive cells on both sides of the slot.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::arena::dep_map::{self, TargetId, TargetKind, TriggerOp};
use crate::hash::FastIndexMap;
use crate::key::PropKey;
use crate::reactive::{Flavor, RAW_FROZEN, to_raw, wrap_value};
use crate::value::Value;

pub(crate) struct RawRecord {
    id: TargetId,
    flags: AtomicU8,
    slots: RwLock<FastIndexMap<PropKey, Value>>,
}

impl Drop for RawRecord {
    fn drop(&mut self) {
        dep_map::release_target(self.id);
    }
}

/// A keyed record handle; equality is raw identity plus flavor.
#[derive(Clone)]
pub struct Record {
    raw: Arc<RawRecord>,
    flavor: Flavor,
}

impl Record {
    /// Create an empty plain record.
    pub fn new() -> Record {
        Record {
            raw: Arc::new(RawRecord {
                id: TargetId::next(),
                flags: AtomicU8::new(0),
                slots: RwLock::new(FastIndexMap::default()),
            }),
            flavor: Flavor::Raw,
        }
    }

    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) fn with_flavor(&self, flavor: Flavor) -> Record {
        Record {
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

    pub(crate) fn same_identity(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw) && self.flavor == other.flavor
    }

    pub(crate) fn identity_hash(&self) -> (usize, Flavor) {
        (Arc::as_ptr(&self.raw) as usize, self.flavor)
    }

    /// Read a slot. Tracked through non-raw flavors; deep flavors unwrap
    /// cells and wrap containers lazily.
    pub fn get(&self, key: impl Into<PropKey>) -> Option<Value> {
        let key = key.into();
        if self.flavor.is_raw() {
            return self.raw.slots.read().get(&key).cloned();
        }
        dep_map::track(self.raw.id, key.clone());
        let value = self.raw.slots.read().get(&key).cloned()?;
        match value {
            Value::Ref(cell) if !self.flavor.is_shallow() => Some(cell.get()),
            value => Some(wrap_value(self.flavor, value)),
        }
    }

    /// Write a slot. Triggers ADD for a new key, SET for a changed value,
    /// nothing for a SameValue-equal assignment. Readonly flavors and
    /// frozen records warn and do nothing.
    pub fn set(&self, key: impl Into<PropKey>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if self.flavor.is_readonly() {
            tracing::warn!(?key, "set on a readonly record is ignored");
            return;
        }
        if self.raw_flags() & RAW_FROZEN != 0 {
            tracing::warn!(?key, "set on a frozen record is ignored");
            return;
        }
        if self.flavor.is_raw() {
            self.raw.slots.write().insert(key, value);
            return;
        }

        // Assigning over a cell writes through it instead of replacing it.
        if !self.flavor.is_shallow() && !matches!(value, Value::Ref(_)) {
            let existing = self.raw.slots.read().get(&key).cloned();
            if let Some(Value::Ref(cell)) = existing {
                cell.set(value);
                return;
            }
        }

        let stored = if self.flavor.is_shallow() {
            value
        } else {
            to_raw(&value)
        };
        let op = {
            let mut slots = self.raw.slots.write();
            match slots.get(&key) {
                Some(old) if *old == stored => None,
                Some(_) => {
                    slots.insert(key.clone(), stored);
                    Some(TriggerOp::Set)
                }
                None => {
                    slots.insert(key.clone(), stored);
                    Some(TriggerOp::Add)
                }
            }
        };
        if let Some(op) = op {
            dep_map::trigger(self.raw.id, TargetKind::Record, Some(key), op);
        }
    }

    /// Remove a slot; triggers DELETE only when the key existed.
    ///
    /// Through a readonly flavor nothing is removed, but `true` comes back
    /// anyway: the success code a delete trap must report. A frozen record
    /// reports `false`, the non-configurable-property failure.
    pub fn delete(&self, key: impl Into<PropKey>) -> bool {
        let key = key.into();
        if self.flavor.is_readonly() {
            tracing::warn!(?key, "delete on a readonly record is ignored");
            return true;
        }
        if self.raw_flags() & RAW_FROZEN != 0 {
            tracing::warn!(?key, "delete on a frozen record is ignored");
            return false;
        }
        let existed = self.raw.slots.write().shift_remove(&key).is_some();
        if existed && !self.flavor.is_raw() {
            dep_map::trigger(self.raw.id, TargetKind::Record, Some(key), TriggerOp::Delete);
        }
        existed
    }

    /// Whether a key is present. Tracked through non-raw flavors.
    pub fn has(&self, key: impl Into<PropKey>) -> bool {
        let key = key.into();
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, key.clone());
        }
        self.raw.slots.read().contains_key(&key)
    }

    /// Snapshot of the keys in insertion order. Tracks iteration.
    pub fn keys(&self) -> Vec<PropKey> {
        self.track_iteration();
        self.raw.slots.read().keys().cloned().collect()
    }

    /// Snapshot of the entries with values wrapped as `get` would.
    pub fn entries(&self) -> Vec<(PropKey, Value)> {
        self.track_iteration();
        let snapshot: Vec<(PropKey, Value)> = self
            .raw
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        snapshot
            .into_iter()
            .map(|(k, v)| match v {
                Value::Ref(cell) if !self.flavor.is_shallow() && !self.flavor.is_raw() => {
                    (k, cell.get())
                }
                v => (k, wrap_value(self.flavor, v)),
            })
            .collect()
    }

    /// Number of keys. Tracks iteration.
    pub fn len(&self) -> usize {
        self.track_iteration();
        self.raw.slots.read().len()
    }

    /// Whether the record has no keys. Tracks iteration.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track_iteration(&self) {
        if !self.flavor.is_raw() {
            dep_map::track(self.raw.id, PropKey::Iterate);
        }
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shallow by design: records can hold cycles.
        write!(
            f,
            "Record({:p}, {:?})",
            Arc::as_ptr(&self.raw),
            self.flavor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Ref;
    use crate::effect::Effect;
    use crate::reactive::{is_reactive, reactive};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reactive_record() -> Record {
        reactive(Record::new()).as_record().unwrap().clone()
    }

    #[test]
    fn add_set_delete_dispatch() {
        let r = reactive_record();
        let runs = Arc::new(AtomicUsize::new(0));

        let r2 = r.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            r2.get("n");
            runs2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        r.set("n", 1); // ADD
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        r.set("n", 1); // SameValue: suppressed
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        r.set("n", 2); // SET
        assert_eq!(runs.load(Ordering::Relaxed), 3);
        assert!(r.delete("n")); // DELETE
        assert_eq!(runs.load(Ordering::Relaxed), 4);
        assert!(!r.delete("n"));
        assert_eq!(runs.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn key_iteration_reruns_on_shape_change_only() {
        let r = reactive_record();
        r.set("a", 1);
        let runs = Arc::new(AtomicUsize::new(0));

        let r2 = r.clone();
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            r2.keys();
            runs2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        r.set("a", 2); // value change, same shape
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        r.set("b", 1); // new key
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        r.delete("a");
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn deep_get_wraps_nested_containers() {
        let r = reactive_record();
        r.set("child", Record::new());
        let child = r.get("child").unwrap();
        assert!(is_reactive(&child));

        // Stored form stays raw.
        let raw = crate::reactive::to_raw(&Value::Record(r.clone()));
        let stored = raw.as_record().unwrap().get("child").unwrap();
        assert!(!is_reactive(&stored));
    }

    #[test]
    fn cells_unwrap_in_deep_records() {
        let r = reactive_record();
        let cell = Ref::new(1);
        r.set("n", Value::Ref(cell.clone()));

        assert_eq!(r.get("n"), Some(Value::Int(1)));
        // Assigning the slot writes through the cell.
        r.set("n", 2);
        assert_eq!(cell.get(), Value::Int(2));
    }

    #[test]
    fn readonly_writes_are_silent_noops_reporting_success() {
        let base = Record::new();
        base.set("v", 1);
        let ro = crate::reactive::readonly(base.clone());
        let ro = ro.as_record().unwrap();

        ro.set("v", 2);
        assert_eq!(base.get("v"), Some(Value::Int(1)));
        // The delete trap reports success without removing anything.
        assert!(ro.delete("v"));
        assert_eq!(base.get("v"), Some(Value::Int(1)));
    }
}
