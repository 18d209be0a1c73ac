//! Lazy cached derivations.
//!
//! A [`Computed`] is a subscriber of whatever its getter reads and, through
//! its own dep, a source for anything that reads it. It starts dirty and
//! never evaluates until first read. Refresh is two-tiered: a global
//! version snapshot skips everything when no trigger has fired anywhere,
//! and a per-link version walk skips recomputation when something changed
//! globally but none of *this* computed's inputs did. An evaluation whose
//! result is SameValue-equal to the cache does not bump the computed's dep
//! version, so downstream subscribers never observe a no-op recompute.
//!
//! ```ignore
//! let a = Ref::new(1);
//! let a2 = a.clone();
//! let doubled = Computed::new(move || a2.get().as_int().unwrap() * 2);
//! assert_eq!(doubled.value(), 2);
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::arena::graph::{
    self, ACTIVE, DIRTY, DepId, PENDING, RUNNING, SubId, SubNode, sub_update_flags, with_graph,
    with_graph_read,
};
use crate::arena::tracking;
use crate::scope;

type Setter<T> = Box<dyn FnMut(T) + Send>;

/// A cached derived value; both a subscriber and a source.
///
/// Construct with [`Computed::new`] (readonly) or [`Computed::writable`].
/// Ownership follows the effect rules: created under an active scope, the
/// computed belongs to that scope and `scope.stop()` tears it down; a
/// top-level computed is torn down when its handle drops. A torn-down
/// computed stops tracking and serves its last cached value.
pub struct Computed<T> {
    id: SubId,
    dep: DepId,
    value: Arc<RwLock<Option<T>>>,
    setter: Mutex<Option<Setter<T>>>,
    scope_owned: bool,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Computed<T> {
    /// Create a readonly computed. The getter does not run until the first
    /// [`value`](Computed::value) read.
    pub fn new<F>(getter: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::create(getter, None)
    }

    /// Create a writable computed; writes are forwarded to `setter`.
    pub fn writable<F, S>(getter: F, setter: S) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
        S: FnMut(T) + Send + 'static,
    {
        Self::create(getter, Some(Box::new(setter) as Setter<T>))
    }

    fn create<F>(mut getter: F, setter: Option<Setter<T>>) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));

        let owner = scope::current_active_scope();
        let (id, dep) = with_graph(|g| {
            let id = g.insert_sub(SubNode::new(ACTIVE | DIRTY, Box::new(|| {})));
            let dep = g.insert_dep(Some(id));
            let node = &mut g.subs[id.index()];
            node.own_dep = Some(dep);
            node.scope_owned = owner.is_some();
            (id, dep)
        });

        if let Some(scope_id) = owner {
            if let Some(index) = scope::register_owned(scope_id, id) {
                with_graph(|g| {
                    if let Some(sub) = g.subs.get_mut(id.index()) {
                        sub.scope = Some((scope_id, index));
                    }
                });
            }
        }

        // The stored callback recomputes, compares against the cache, and
        // bumps the dep version only on a real change.
        let slot = value.clone();
        let callback: graph::SubCallback = Box::new(move || {
            let next = getter();
            let changed = {
                let mut slot = slot.write();
                let changed = match &*slot {
                    Some(old) => *old != next,
                    None => true,
                };
                if changed {
                    *slot = Some(next);
                }
                changed
            };
            if changed {
                cov_mark::hit!(computed_value_changed);
                with_graph(|g| {
                    if let Some(d) = g.deps.get_mut(dep.index()) {
                        d.version += 1;
                    }
                });
            }
        });
        with_graph_read(|g| {
            if let Some(sub) = g.subs.get(id.index()) {
                *sub.callback.lock() = Some(callback);
            }
        });

        Arc::new(Computed {
            id,
            dep,
            value,
            setter: Mutex::new(setter),
            scope_owned: owner.is_some(),
        })
    }

    /// Read the value, registering the calling subscriber as a dependent
    /// and refreshing the cache if needed.
    pub fn value(&self) -> T {
        let link = tracking::track_dep(self.dep);
        refresh_by_id(self.id);
        // Sync the caller's link to the post-refresh dep version so a
        // no-op recompute never reads as a change.
        if let Some(link) = link {
            with_graph(|g| {
                if let Some(version) = g.deps.get(self.dep.index()).map(|d| d.version) {
                    if let Some(l) = g.links.get_mut(link.index()) {
                        l.version = version;
                    }
                }
            });
        }
        self.value
            .read()
            .clone()
            .expect("computed never evaluated: its owning scope stopped before the first read")
    }

    /// Write through to the setter; on a readonly computed this is a no-op
    /// with a warning.
    pub fn set(&self, value: T) {
        let mut setter = self.setter.lock();
        match setter.as_mut() {
            Some(setter) => setter(value),
            None => tracing::warn!("write to a computed without a setter is ignored"),
        }
    }
}

impl<T> Drop for Computed<T> {
    fn drop(&mut self) {
        // Scope-owned computeds outlive their handle; the scope tears
        // them down.
        if self.scope_owned {
            return;
        }
        with_graph(|g| {
            g.detach_deps(self.id);
            g.remove_dep(self.dep);
            g.remove_sub(self.id);
        });
    }
}

/// Refresh a computed by subscriber id.
///
/// 1. If not dirty and the global version matches the snapshot, nothing
///    anywhere has triggered: return.
/// 2. Update the snapshot.
/// 3. If not dirty, a cached value exists, and every upstream link's
///    version still matches its dep (refreshing upstream computeds
///    first), only unrelated state changed: return.
/// 4. Otherwise evaluate under tracking; the callback bumps the dep
///    version only when the result actually changed.
pub(crate) fn refresh_by_id(sub: SubId) {
    let Some((flags, snapshot, own_dep)) =
        with_graph_read(|g| g.subs.get(sub.index()).map(|s| (s.flags, s.snapshot, s.own_dep)))
    else {
        return;
    };
    let Some(dep) = own_dep else {
        return;
    };

    // Mid-teardown: no refresh, the cache stays as it was.
    if flags & ACTIVE == 0 {
        return;
    }

    let global = graph::global_version();
    if flags & DIRTY == 0 && snapshot == global {
        cov_mark::hit!(computed_global_fast_path);
        return;
    }
    with_graph(|g| {
        if let Some(s) = g.subs.get_mut(sub.index()) {
            s.snapshot = global;
        }
    });

    // A computed that reads itself mid-evaluation would recurse forever;
    // hand back the stale cache instead.
    if flags & RUNNING != 0 {
        cov_mark::hit!(computed_recursion_guard);
        return;
    }

    if flags & DIRTY == 0 {
        let has_value = graph::dep_version(dep).is_some_and(|v| v > 0);
        if has_value && !tracking::check_dirty(sub) {
            cov_mark::hit!(computed_fine_grained_skip);
            sub_update_flags(sub, 0, PENDING);
            return;
        }
    }

    // A panicking getter must not leave a clean flag over a stale cache;
    // the next read retries the evaluation.
    struct RedirtyOnUnwind(SubId);
    impl Drop for RedirtyOnUnwind {
        fn drop(&mut self) {
            if std::thread::panicking() {
                sub_update_flags(self.0, DIRTY, 0);
            }
        }
    }
    let _redirty = RedirtyOnUnwind(sub);
    tracking::run_sub(sub);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Ref;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn lazy_until_first_read_then_cached() {
        let evals = Arc::new(AtomicUsize::new(0));
        let evals2 = evals.clone();
        let c = Computed::new(move || {
            evals2.fetch_add(1, Ordering::Relaxed);
            42
        });

        assert_eq!(evals.load(Ordering::Relaxed), 0);
        assert_eq!(c.value(), 42);
        assert_eq!(c.value(), 42);
        assert_eq!(evals.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn recomputes_only_when_input_changed() {
        let a = Ref::new(1);
        let evals = Arc::new(AtomicUsize::new(0));

        let a2 = a.clone();
        let evals2 = evals.clone();
        let c = Computed::new(move || {
            evals2.fetch_add(1, Ordering::Relaxed);
            a2.get().as_int().unwrap() * 10
        });

        assert_eq!(c.value(), 10);
        assert_eq!(evals.load(Ordering::Relaxed), 1);

        a.set(2);
        assert_eq!(c.value(), 20);
        assert_eq!(evals.load(Ordering::Relaxed), 2);

        // Unrelated trigger: the fine-grained check skips recomputation.
        let unrelated = Ref::new(0);
        unrelated.set(1);
        assert_eq!(c.value(), 20);
        assert_eq!(evals.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unchanged_result_does_not_advance_version() {
        let a = Ref::new(1);
        let a2 = a.clone();
        // Parity: flips between same outputs for inputs 1 and 3.
        let c = Computed::new(move || a2.get().as_int().unwrap() % 2);

        assert_eq!(c.value(), 1);
        let v1 = graph::dep_version(c.dep).unwrap();

        a.set(3);
        assert_eq!(c.value(), 1);
        let v2 = graph::dep_version(c.dep).unwrap();
        assert_eq!(v1, v2, "no-op recompute must not look like a change");

        a.set(2);
        assert_eq!(c.value(), 0);
        assert!(graph::dep_version(c.dep).unwrap() > v2);
    }

    #[test]
    fn writable_computed_forwards_writes() {
        let a = Ref::new(1);
        let a_get = a.clone();
        let a_set = a.clone();
        let c = Computed::writable(
            move || a_get.get().as_int().unwrap(),
            move |v| a_set.set(v),
        );

        c.set(5);
        assert_eq!(a.get().as_int(), Some(5));
        assert_eq!(c.value(), 5);
    }

    #[test]
    fn readonly_computed_ignores_writes() {
        let c = Computed::new(|| 1);
        c.set(9);
        assert_eq!(c.value(), 1);
    }
}
