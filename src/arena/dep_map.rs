//! The target map: per-target tables of property-keyed deps.
//!
//! Reactive containers are identified by a process-unique [`TargetId`].
//! Each target owns a lazily-populated `PropKey -> DepId` table in a
//! concurrent map; a container's `Drop` releases its table and detaches
//! every link of every dep in it, so nothing dangles once the raw data is
//! gone.
//!
//! [`track`] is the read-side entry point (a no-op without an observing
//! subscriber) and [`trigger`] the write side: it advances the global
//! version, bumps every affected dep's version first, and only then
//! notifies subscribers inside a batch.

use papaya::HashMap as PapayaHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::graph::{self, DepId, SubId, with_graph};
use super::tracking;
use crate::batch;
use crate::hash::FastIndexMap;
use crate::key::PropKey;

/// Identity of a reactive target (record, list, map, set or cell).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct TargetId(u64);

static NEXT_TARGET: AtomicU64 = AtomicU64::new(1);

impl TargetId {
    /// Allocate a fresh target identity.
    pub(crate) fn next() -> Self {
        TargetId(NEXT_TARGET.fetch_add(1, Ordering::Relaxed))
    }
}

type DepTable = RwLock<FastIndexMap<PropKey, DepId>>;

static DEP_TABLES: LazyLock<PapayaHashMap<TargetId, DepTable>> = LazyLock::new(PapayaHashMap::new);

/// What kind of container a trigger originates from; decides which
/// iteration sentinels are swept in.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TargetKind {
    Record,
    List,
    Map,
    Set,
}

/// The write operation being reported.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TriggerOp {
    /// A key that did not exist before.
    Add,
    /// An existing key's value changed (SameValue-unequal).
    Set,
    /// An existing key was removed.
    Delete,
    /// The whole container was emptied.
    Clear,
}

/// Allocate a free-standing dep (cells and computeds own theirs directly).
pub(crate) fn alloc_dep(owner: Option<SubId>) -> DepId {
    with_graph(|g| g.insert_dep(owner))
}

/// Detach a free-standing dep's links and free it.
pub(crate) fn free_dep(dep: DepId) {
    with_graph(|g| g.remove_dep(dep));
}

/// Record that the observing subscriber read `(target, key)`.
///
/// Outside any tracking run this returns without resolving, or creating,
/// a dep.
pub(crate) fn track(target: TargetId, key: PropKey) {
    if !tracking::has_live_observer() {
        return;
    }
    let dep = resolve_dep(target, key);
    tracking::track_dep(dep);
}

fn resolve_dep(target: TargetId, key: PropKey) -> DepId {
    let guard = DEP_TABLES.pin();
    let table = guard.get_or_insert_with(target, || RwLock::new(FastIndexMap::default()));
    if let Some(dep) = table.read().get(&key) {
        return *dep;
    }
    let mut table = table.write();
    if let Some(dep) = table.get(&key) {
        return *dep;
    }
    let dep = with_graph(|g| g.insert_dep(None));
    table.insert(key, dep);
    dep
}

/// Report a write on `(target, key)`.
///
/// Always advances the global version. Affected deps are the key's own dep
/// plus the iteration sentinels the operation invalidates: ADD/DELETE
/// sweep `Iterate` (and `MapKeyIterate` on maps, `Length` on lists), a
/// map SET sweeps `Iterate` so value iteration re-runs, and CLEAR sweeps
/// everything the target ever handed out.
pub(crate) fn trigger(target: TargetId, kind: TargetKind, key: Option<PropKey>, op: TriggerOp) {
    graph::bump_global_version();

    let mut deps: SmallVec<[DepId; 4]> = SmallVec::new();
    {
        let guard = DEP_TABLES.pin();
        let Some(table) = guard.get(&target) else {
            return;
        };
        let table = table.read();
        if op == TriggerOp::Clear {
            deps.extend(table.values().copied());
        } else {
            let mut keys: SmallVec<[PropKey; 4]> = SmallVec::new();
            if let Some(k) = key {
                keys.push(k);
            }
            match op {
                TriggerOp::Add | TriggerOp::Delete => match kind {
                    TargetKind::List => keys.push(PropKey::Length),
                    TargetKind::Record | TargetKind::Set => keys.push(PropKey::Iterate),
                    TargetKind::Map => {
                        keys.push(PropKey::Iterate);
                        keys.push(PropKey::MapKeyIterate);
                    }
                },
                TriggerOp::Set => {
                    if kind == TargetKind::Map {
                        keys.push(PropKey::Iterate);
                    }
                }
                TriggerOp::Clear => unreachable!(),
            }
            for k in &keys {
                if let Some(dep) = table.get(k) {
                    deps.push(*dep);
                }
            }
        }
    }

    if !deps.is_empty() {
        notify_deps(&deps);
    }
}

/// Trigger a single free-standing dep (cell writes).
pub(crate) fn trigger_single(dep: DepId) {
    graph::bump_global_version();
    notify_deps(&[dep]);
}

/// Bump all versions first, then notify every subscriber inside a batch.
fn notify_deps(deps: &[DepId]) {
    let subs: Vec<(SubId, bool)> = with_graph(|g| {
        for dep in deps {
            if let Some(node) = g.deps.get_mut(dep.index()) {
                node.version += 1;
            }
        }
        let mut all = Vec::new();
        for dep in deps {
            all.extend(g.dep_subscribers(*dep));
        }
        all
    });

    batch::start_batch();
    for (sub, is_computed) in subs {
        batch::notify_sub(sub, is_computed, true);
    }
    batch::end_batch();
}

/// Notify a dep's subscribers without bumping its version: the propagation
/// step for a queued computed, whose value may yet turn out unchanged.
pub(crate) fn propagate_from_computed(dep: DepId) {
    let subs = graph::with_graph_read(|g| g.dep_subscribers(dep));
    for (sub, is_computed) in subs {
        batch::notify_sub(sub, is_computed, false);
    }
}

/// Drop a target's dep table, detaching every link of every dep in it.
pub(crate) fn release_target(target: TargetId) {
    let deps: Vec<DepId> = {
        let guard = DEP_TABLES.pin();
        match guard.remove(&target) {
            Some(table) => table.read().values().copied().collect(),
            None => return,
        }
    };
    with_graph(|g| {
        for dep in deps {
            g.remove_dep(dep);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_without_table_still_advances_global_version() {
        let before = graph::global_version();
        trigger(
            TargetId::next(),
            TargetKind::Record,
            Some(PropKey::from("x")),
            TriggerOp::Set,
        );
        assert!(graph::global_version() > before);
    }

    #[test]
    fn release_target_frees_deps() {
        let target = TargetId::next();
        let dep = resolve_dep(target, PropKey::from("x"));
        assert!(graph::dep_version(dep).is_some());

        release_target(target);
        assert!(graph::dep_version(dep).is_none());
    }

    #[test]
    fn resolve_is_stable_per_key() {
        let target = TargetId::next();
        let a = resolve_dep(target, PropKey::from("x"));
        let b = resolve_dep(target, PropKey::from("x"));
        let c = resolve_dep(target, PropKey::from("y"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        release_target(target);
    }
}
