//! Arena storage for the dependency graph.
//!
//! Three slabs live behind one `RwLock`: dependency records ([`DepId`]),
//! subscriber records ([`SubId`]) and the [`LinkId`] edges threading them
//! together. A link sits on two intrusive doubly-linked lists at once: the
//! subscriber list of its dep and the dep list of its sub. Slab slots are
//! recycled through the slab's own freelist when links are detached.
//!
//! Ids are `u32` newtypes indexing the slabs. A stale id (its slot was
//! removed) is not an error: accessors return `None` or do nothing, the
//! same contract the rest of the crate relies on for teardown ordering.
//!
//! User callbacks are never invoked while the graph lock is held; they are
//! taken out of their slot for the duration of a run and restored by a
//! drop guard, even on panic.

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::effect::Runner;
use crate::scope::ScopeId;

// Subscriber flag bits.
/// Subscriber has not been stopped.
pub(crate) const ACTIVE: u8 = 1 << 0;
/// Subscriber is currently executing its function.
pub(crate) const RUNNING: u8 = 1 << 1;
/// Reads establish dependency links.
pub(crate) const TRACKING: u8 = 1 << 2;
/// Already queued in the current batch.
pub(crate) const NOTIFIED: u8 = 1 << 3;
/// A dependency version definitely advanced; must re-run.
pub(crate) const DIRTY: u8 = 1 << 4;
/// A computed ancestor may be dirty; revalidate before trusting state.
pub(crate) const PENDING: u8 = 1 << 5;
/// Notifications mark flags but do not dispatch until resume.
pub(crate) const PAUSED: u8 = 1 << 6;
/// One self-notification per run is permitted.
pub(crate) const ALLOW_RECURSE: u8 = 1 << 7;

/// Identifier of a dependency record.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct DepId(u32);

/// Identifier of a link edge.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct LinkId(u32);

/// Identifier of a subscriber (effect or computed).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct SubId(u32);

impl DepId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl LinkId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl SubId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A source of change events: version counter plus its subscriber list.
pub(crate) struct DepNode {
    /// Monotonic counter, incremented on every trigger of this dep.
    pub(crate) version: u64,
    pub(crate) subs_head: Option<LinkId>,
    pub(crate) subs_tail: Option<LinkId>,
    /// The computed that exposes itself through this dep, if any.
    pub(crate) owner: Option<SubId>,
}

/// An edge between one dep and one subscriber.
///
/// `version` is the dep version observed when the link was last confirmed
/// during its subscriber's run.
pub(crate) struct LinkNode {
    pub(crate) dep: DepId,
    pub(crate) sub: SubId,
    pub(crate) version: u64,
    pub(crate) prev_sub: Option<LinkId>,
    pub(crate) next_sub: Option<LinkId>,
    pub(crate) prev_dep: Option<LinkId>,
    pub(crate) next_dep: Option<LinkId>,
}

/// The boxed function a subscriber runs. Effects store the user closure,
/// computeds store the recompute-and-compare closure.
pub(crate) type SubCallback = Box<dyn FnMut() + Send>;

/// A scheduler installed on an effect; receives the runner handle.
pub(crate) type SchedulerFn = Box<dyn FnMut(Runner) + Send>;

/// State shared by effects and computeds.
///
/// The boxed closures sit behind `Mutex`es so the node is `Sync` inside
/// the global arena; they are only ever taken out for the duration of a
/// call.
pub(crate) struct SubNode {
    pub(crate) flags: u8,
    pub(crate) deps_head: Option<LinkId>,
    /// Cursor advanced during a run; links past it are stale afterwards.
    pub(crate) deps_tail: Option<LinkId>,
    /// Computeds only: global version observed at the last refresh.
    pub(crate) snapshot: u64,
    /// Computeds only: the dep through which this subscriber is a source.
    pub(crate) own_dep: Option<DepId>,
    pub(crate) callback: Mutex<Option<SubCallback>>,
    pub(crate) scheduler: Mutex<Option<SchedulerFn>>,
    pub(crate) on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Owning scope and this subscriber's index in its effect list.
    pub(crate) scope: Option<(ScopeId, usize)>,
    /// Set when a scope owns this subscriber; its handle then never tears
    /// it down on drop.
    pub(crate) scope_owned: bool,
}

impl SubNode {
    pub(crate) fn new(flags: u8, callback: SubCallback) -> Self {
        SubNode {
            flags,
            deps_head: None,
            deps_tail: None,
            snapshot: 0,
            own_dep: None,
            callback: Mutex::new(Some(callback)),
            scheduler: Mutex::new(None),
            on_stop: Mutex::new(None),
            scope: None,
            scope_owned: false,
        }
    }
}

/// All graph storage. One lock guards the pointer surgery; everything that
/// runs user code first leaves this structure.
pub(crate) struct Graph {
    pub(crate) deps: Slab<DepNode>,
    pub(crate) links: Slab<LinkNode>,
    pub(crate) subs: Slab<SubNode>,
}

static GRAPH: RwLock<Graph> = RwLock::new(Graph {
    deps: Slab::new(),
    links: Slab::new(),
    subs: Slab::new(),
});

/// Process-wide counter bumped on every trigger. Computeds use it to skip
/// refresh entirely when nothing anywhere has changed.
static GLOBAL_VERSION: AtomicU64 = AtomicU64::new(1);

/// Read the global version.
pub(crate) fn global_version() -> u64 {
    GLOBAL_VERSION.load(Ordering::Acquire)
}

/// Advance the global version. Called once per trigger.
pub(crate) fn bump_global_version() -> u64 {
    GLOBAL_VERSION.fetch_add(1, Ordering::AcqRel) + 1
}

/// Run a closure with exclusive access to the graph.
pub(crate) fn with_graph<F, R>(f: F) -> R
where
    F: FnOnce(&mut Graph) -> R,
{
    f(&mut GRAPH.write())
}

/// Run a closure with shared access to the graph.
pub(crate) fn with_graph_read<F, R>(f: F) -> R
where
    F: FnOnce(&Graph) -> R,
{
    f(&GRAPH.read())
}

impl Graph {
    /// Allocate a dep, optionally owned by a computed.
    pub(crate) fn insert_dep(&mut self, owner: Option<SubId>) -> DepId {
        let key = self.deps.insert(DepNode {
            version: 0,
            subs_head: None,
            subs_tail: None,
            owner,
        });
        DepId(key as u32)
    }

    /// Allocate a subscriber.
    pub(crate) fn insert_sub(&mut self, node: SubNode) -> SubId {
        SubId(self.subs.insert(node) as u32)
    }

    /// Remove a link from both of its lists and free its slot.
    pub(crate) fn unlink(&mut self, id: LinkId) {
        let Some(link) = self.links.try_remove(id.index()) else {
            return;
        };

        // Dep-side list.
        if let Some(dep) = self.deps.get_mut(link.dep.index()) {
            if dep.subs_head == Some(id) {
                dep.subs_head = link.next_sub;
            }
            if dep.subs_tail == Some(id) {
                dep.subs_tail = link.prev_sub;
            }
        }
        if let Some(prev) = link.prev_sub {
            if let Some(p) = self.links.get_mut(prev.index()) {
                p.next_sub = link.next_sub;
            }
        }
        if let Some(next) = link.next_sub {
            if let Some(n) = self.links.get_mut(next.index()) {
                n.prev_sub = link.prev_sub;
            }
        }

        // Sub-side list.
        if let Some(sub) = self.subs.get_mut(link.sub.index()) {
            if sub.deps_head == Some(id) {
                sub.deps_head = link.next_dep;
            }
            if sub.deps_tail == Some(id) {
                sub.deps_tail = link.prev_dep;
            }
        }
        if let Some(prev) = link.prev_dep {
            if let Some(p) = self.links.get_mut(prev.index()) {
                p.next_dep = link.next_dep;
            }
        }
        if let Some(next) = link.next_dep {
            if let Some(n) = self.links.get_mut(next.index()) {
                n.prev_dep = link.prev_dep;
            }
        }
    }

    /// Detach every subscriber link of a dep and free the dep slot.
    pub(crate) fn remove_dep(&mut self, id: DepId) {
        let Some(dep) = self.deps.get(id.index()) else {
            return;
        };
        let mut cursor = dep.subs_head;
        while let Some(l) = cursor {
            cursor = self.links.get(l.index()).and_then(|n| n.next_sub);
            self.unlink(l);
        }
        self.deps.try_remove(id.index());
    }

    /// Detach every dep link of a subscriber.
    pub(crate) fn detach_deps(&mut self, id: SubId) {
        let Some(sub) = self.subs.get(id.index()) else {
            return;
        };
        let mut cursor = sub.deps_head;
        while let Some(l) = cursor {
            cursor = self.links.get(l.index()).and_then(|n| n.next_dep);
            self.unlink(l);
        }
    }

    /// Free a subscriber slot. Links must already be detached.
    pub(crate) fn remove_sub(&mut self, id: SubId) {
        self.subs.try_remove(id.index());
    }

    /// Ensure a confirmed link exists between `dep` and `sub`, reusing the
    /// previous run's link when reads repeat in the same order.
    ///
    /// Reuse policy: if the cursor already sits on a link to `dep` the read
    /// is a duplicate; if the link after the cursor points at `dep` the
    /// previous run's edge is confirmed in place; otherwise a duplicate
    /// scan of the confirmed region runs before a fresh link is spliced in
    /// after the cursor and appended to the dep's subscriber tail. In the
    /// steady state no allocation happens.
    pub(crate) fn track_link(&mut self, dep: DepId, sub: SubId) -> Option<LinkId> {
        let dep_version = self.deps.get(dep.index())?.version;
        let tail = self.subs.get(sub.index())?.deps_tail;

        if let Some(t) = tail {
            let t_node = self.links.get(t.index())?;
            if t_node.dep == dep {
                self.links[t.index()].version = dep_version;
                return Some(t);
            }
        }

        let next = match tail {
            Some(t) => self.links.get(t.index())?.next_dep,
            None => self.subs.get(sub.index())?.deps_head,
        };
        if let Some(n) = next {
            if self.links.get(n.index())?.dep == dep {
                cov_mark::hit!(link_reused_in_order);
                let node = &mut self.links[n.index()];
                node.version = dep_version;
                self.subs[sub.index()].deps_tail = Some(n);
                return Some(n);
            }
        }

        // A read of a dep already confirmed earlier in this run must not
        // create a second (sub, dep) edge.
        if tail.is_some() {
            let mut cursor = self.subs.get(sub.index())?.deps_head;
            while let Some(l) = cursor {
                let (link_dep, link_next) = {
                    let node = self.links.get(l.index())?;
                    (node.dep, node.next_dep)
                };
                if link_dep == dep {
                    cov_mark::hit!(duplicate_read_same_run);
                    self.links[l.index()].version = dep_version;
                    return Some(l);
                }
                if Some(l) == tail {
                    break;
                }
                cursor = link_next;
            }
        }

        let subs_tail = self.deps.get(dep.index())?.subs_tail;
        let id = LinkId(self.links.insert(LinkNode {
            dep,
            sub,
            version: dep_version,
            prev_sub: subs_tail,
            next_sub: None,
            prev_dep: tail,
            next_dep: next,
        }) as u32);

        // Splice into the sub's dep list between cursor and next.
        match tail {
            Some(t) => self.links[t.index()].next_dep = Some(id),
            None => self.subs[sub.index()].deps_head = Some(id),
        }
        if let Some(n) = next {
            self.links[n.index()].prev_dep = Some(id);
        }
        self.subs[sub.index()].deps_tail = Some(id);

        // Append to the dep's subscriber list.
        match subs_tail {
            Some(t) => self.links[t.index()].next_sub = Some(id),
            None => self.deps[dep.index()].subs_head = Some(id),
        }
        self.deps[dep.index()].subs_tail = Some(id);

        Some(id)
    }

    /// Detach every link past the cursor; they were not confirmed by the
    /// run that just finished.
    pub(crate) fn prune_stale(&mut self, id: SubId) {
        let Some(sub) = self.subs.get(id.index()) else {
            return;
        };
        let mut cursor = match sub.deps_tail {
            Some(t) => self.links.get(t.index()).and_then(|n| n.next_dep),
            None => sub.deps_head,
        };
        if cursor.is_some() {
            cov_mark::hit!(stale_links_pruned);
        }
        while let Some(l) = cursor {
            cursor = self.links.get(l.index()).and_then(|n| n.next_dep);
            self.unlink(l);
        }
    }

    /// Snapshot a dep's subscribers in subscription order, paired with
    /// whether each is a computed.
    pub(crate) fn dep_subscribers(&self, dep: DepId) -> Vec<(SubId, bool)> {
        let mut out = Vec::new();
        let Some(node) = self.deps.get(dep.index()) else {
            return out;
        };
        let mut cursor = node.subs_head;
        while let Some(l) = cursor {
            let Some(link) = self.links.get(l.index()) else {
                break;
            };
            let is_computed = self
                .subs
                .get(link.sub.index())
                .is_some_and(|s| s.own_dep.is_some());
            out.push((link.sub, is_computed));
            cursor = link.next_sub;
        }
        out
    }
}

/// Read a subscriber's flags; `None` when the id is stale.
pub(crate) fn sub_flags(id: SubId) -> Option<u8> {
    with_graph_read(|g| g.subs.get(id.index()).map(|s| s.flags))
}

/// Set and clear flag bits in one step. Returns the previous flags.
pub(crate) fn sub_update_flags(id: SubId, set: u8, clear: u8) -> Option<u8> {
    with_graph(|g| {
        let sub = g.subs.get_mut(id.index())?;
        let old = sub.flags;
        sub.flags = (old | set) & !clear;
        Some(old)
    })
}

/// Current version of a dep; `None` when stale.
pub(crate) fn dep_version(id: DepId) -> Option<u64> {
    with_graph_read(|g| g.deps.get(id.index()).map(|d| d.version))
}

/// Guard that restores a taken callback to its slot on drop, panicking
/// callbacks included.
pub(crate) struct CallbackGuard {
    sub: SubId,
    callback: Option<SubCallback>,
}

impl CallbackGuard {
    /// Take the subscriber's callback out of the arena, if present and not
    /// already taken by an outer run.
    pub(crate) fn take(sub: SubId) -> Self {
        let callback =
            with_graph_read(|g| g.subs.get(sub.index()).and_then(|s| s.callback.lock().take()));
        CallbackGuard { sub, callback }
    }

    /// Invoke the callback, if one was taken.
    pub(crate) fn run(&mut self) {
        if let Some(cb) = self.callback.as_mut() {
            cb();
        }
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        if let Some(cb) = self.callback.take() {
            with_graph_read(|g| {
                if let Some(sub) = g.subs.get(self.sub.index()) {
                    *sub.callback.lock() = Some(cb);
                }
            });
        }
    }
}
