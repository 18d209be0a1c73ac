//! The dynamically-scoped tracking context.
//!
//! At most one subscriber is observing reads on a given thread at a time.
//! `CURRENT_SUB` holds it; nested runs save and restore it through an RAII
//! guard so a panicking callback cannot leak context. A separate pause
//! counter suspends dependency establishment without disturbing the active
//! subscriber, which is what `untracked` and the interior reads of list
//! mutators rely on.
//!
//! This module also owns the run protocol shared by effects and computeds:
//! reset the dep cursor, execute the callback with the subscriber
//! installed, then detach every link the run did not confirm.

use std::cell::Cell;

use super::graph::{
    self, CallbackGuard, DepId, DIRTY, LinkId, PENDING, RUNNING, SubId, TRACKING, with_graph,
    with_graph_read,
};

thread_local! {
    static CURRENT_SUB: Cell<Option<SubId>> = const { Cell::new(None) };
    static PAUSE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The subscriber currently observing reads on this thread, if any.
pub(crate) fn current_sub() -> Option<SubId> {
    CURRENT_SUB.with(Cell::get)
}

fn set_current_sub(sub: Option<SubId>) -> Option<SubId> {
    CURRENT_SUB.with(|c| c.replace(sub))
}

/// True while a pause guard suppresses dependency establishment.
pub(crate) fn tracking_paused() -> bool {
    PAUSE_DEPTH.with(Cell::get) > 0
}

/// Fast-path check used before a dep is even resolved: is there any
/// subscriber that could record this read?
pub(crate) fn has_live_observer() -> bool {
    !tracking_paused() && current_sub().is_some()
}

/// Restores the previous observing subscriber when dropped, panics
/// included.
pub(crate) struct CurrentSubGuard {
    previous: Option<SubId>,
}

impl CurrentSubGuard {
    pub(crate) fn new(sub: Option<SubId>) -> Self {
        CurrentSubGuard {
            previous: set_current_sub(sub),
        }
    }
}

impl Drop for CurrentSubGuard {
    fn drop(&mut self) {
        set_current_sub(self.previous);
    }
}

/// Guard returned by [`crate::pause_tracking`]; reads establish no
/// dependencies until it is dropped. Nestable.
pub struct PauseTracking {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl PauseTracking {
    pub(crate) fn new() -> Self {
        PAUSE_DEPTH.with(|d| d.set(d.get() + 1));
        PauseTracking {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for PauseTracking {
    fn drop(&mut self) {
        PAUSE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Record that the current subscriber read `dep`.
///
/// No-op (returning `None`) outside a tracking run or while tracking is
/// paused.
pub(crate) fn track_dep(dep: DepId) -> Option<LinkId> {
    if tracking_paused() {
        return None;
    }
    let sub = current_sub()?;
    with_graph(|g| {
        let flags = g.subs.get(sub.index()).map(|s| s.flags)?;
        if flags & TRACKING == 0 {
            return None;
        }
        g.track_link(dep, sub)
    })
}

/// Clears run-state flags and prunes unconfirmed links on every exit path.
struct RunFinishGuard(SubId);

impl Drop for RunFinishGuard {
    fn drop(&mut self) {
        with_graph(|g| {
            g.prune_stale(self.0);
            if let Some(sub) = g.subs.get_mut(self.0.index()) {
                sub.flags &= !(RUNNING | TRACKING);
            }
        });
    }
}

/// Execute a subscriber's callback under the full run protocol.
///
/// Sets RUNNING and TRACKING, clears DIRTY and PENDING, resets the dep
/// cursor so link reuse starts from the head, installs the subscriber as
/// the tracking context, and on all exits detaches stale links and
/// restores the outer context.
pub(crate) fn run_sub(sub: SubId) {
    let prepared = with_graph(|g| {
        let node = g.subs.get_mut(sub.index())?;
        node.flags = (node.flags | RUNNING | TRACKING) & !(DIRTY | PENDING);
        node.deps_tail = None;
        Some(())
    });
    if prepared.is_none() {
        return;
    }

    let _context = CurrentSubGuard::new(Some(sub));
    let _finish = RunFinishGuard(sub);
    let mut callback = CallbackGuard::take(sub);
    callback.run();
}

/// Decide whether a PENDING subscriber actually needs to re-run.
///
/// Walks the confirmed dep links in read order; upstream computeds are
/// refreshed first so their dep versions are authoritative. Any version
/// mismatch means a transitive input really changed.
pub(crate) fn check_dirty(sub: SubId) -> bool {
    let links: Vec<LinkId> = with_graph_read(|g| {
        let mut out = Vec::new();
        let Some(node) = g.subs.get(sub.index()) else {
            return out;
        };
        let mut cursor = node.deps_head;
        while let Some(l) = cursor {
            out.push(l);
            cursor = g.links.get(l.index()).and_then(|n| n.next_dep);
        }
        out
    });

    for l in links {
        let Some((dep, seen, owner)) = with_graph_read(|g| {
            let link = g.links.get(l.index())?;
            let owner = g.deps.get(link.dep.index()).and_then(|d| d.owner);
            Some((link.dep, link.version, owner))
        }) else {
            continue;
        };
        if let Some(computed) = owner {
            crate::computed::refresh_by_id(computed);
        }
        if graph::dep_version(dep).is_some_and(|v| v != seen) {
            cov_mark::hit!(revalidation_found_change);
            return true;
        }
    }
    false
}

/// Detach every dep link of a subscriber (stop path).
pub(crate) fn detach_all(sub: SubId) {
    with_graph(|g| g.detach_deps(sub));
}
