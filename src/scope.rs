//! Scopes: tree-structured lifetime management for effects.
//!
//! An [`EffectScope`] collects every effect created while it is current,
//! plus child scopes and user cleanups, so one `stop` tears the whole
//! subtree down. Scopes attach to the currently-running scope unless
//! created detached.
//!
//! ```ignore
//! let scope = EffectScope::new();
//! scope.run(|| {
//!     let _e = Effect::new(|| { /* owned by `scope` */ });
//!     on_scope_dispose(|| println!("bye"));
//! });
//! scope.stop(); // stops the effect, runs the cleanup
//! ```

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::Cell;

use crate::arena::graph::{
    DIRTY, PAUSED, PENDING, SubId, sub_update_flags, with_graph, with_graph_read,
};
use crate::batch;
use crate::effect::stop_subscriber;

/// Identifier of a scope node.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct ScopeId(u32);

impl ScopeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct ScopeNode {
    active: bool,
    paused: bool,
    detached: bool,
    /// Reference count for nested `on()` calls.
    on_depth: u32,
    /// The scope that was current when `on()` made this one current.
    prev_on: Option<Option<ScopeId>>,
    parent: Option<ScopeId>,
    /// This scope's position in its parent's child list.
    parent_index: usize,
    children: Vec<ScopeId>,
    /// Effects and computeds created while this scope was current.
    owned: Vec<SubId>,
    /// Behind a mutex so the node is `Sync` inside the global slab.
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

static SCOPES: RwLock<Slab<ScopeNode>> = RwLock::new(Slab::new());

thread_local! {
    static CURRENT_SCOPE: Cell<Option<ScopeId>> = const { Cell::new(None) };
}

/// The scope that owns effects created right now, if any.
pub(crate) fn current_active_scope() -> Option<ScopeId> {
    let id = CURRENT_SCOPE.with(Cell::get)?;
    SCOPES.read().get(id.index()).filter(|n| n.active)?;
    Some(id)
}

/// Add a subscriber to a scope's owned list; returns its recorded index.
pub(crate) fn register_owned(scope: ScopeId, sub: SubId) -> Option<usize> {
    let mut scopes = SCOPES.write();
    let node = scopes.get_mut(scope.index())?;
    if !node.active {
        return None;
    }
    node.owned.push(sub);
    Some(node.owned.len() - 1)
}

/// Remove a subscriber from its scope's owned list in O(1) via the
/// recorded index, fixing up the index of the entry swapped into its
/// place.
pub(crate) fn unregister_owned(scope: ScopeId, index: usize) {
    let moved = {
        let mut scopes = SCOPES.write();
        let Some(node) = scopes.get_mut(scope.index()) else {
            return;
        };
        if index >= node.owned.len() {
            return;
        }
        node.owned.swap_remove(index);
        node.owned.get(index).copied()
    };
    if let Some(moved) = moved {
        with_graph(|g| {
            if let Some(sub) = g.subs.get_mut(moved.index()) {
                if let Some((_, idx)) = sub.scope.as_mut() {
                    *idx = index;
                }
            }
        });
    }
}

struct CurrentScopeGuard {
    previous: Option<ScopeId>,
}

impl CurrentScopeGuard {
    fn new(scope: Option<ScopeId>) -> Self {
        CurrentScopeGuard {
            previous: CURRENT_SCOPE.with(|c| c.replace(scope)),
        }
    }
}

impl Drop for CurrentScopeGuard {
    fn drop(&mut self) {
        CURRENT_SCOPE.with(|c| c.set(self.previous));
    }
}

/// A node in the scope tree. See the module docs.
pub struct EffectScope {
    id: ScopeId,
    parent_owned: bool,
}

impl EffectScope {
    /// Create a scope attached to the currently active scope (if any).
    pub fn new() -> EffectScope {
        Self::create(false)
    }

    /// Create a detached scope: never attached to a parent, torn down only
    /// by its own `stop` or handle drop.
    pub fn detached() -> EffectScope {
        Self::create(true)
    }

    fn create(detached: bool) -> EffectScope {
        let parent = if detached {
            None
        } else {
            current_active_scope()
        };
        let mut scopes = SCOPES.write();
        let parent_index = parent
            .and_then(|p| scopes.get(p.index()))
            .map_or(0, |p| p.children.len());
        let id = ScopeId(scopes.insert(ScopeNode {
            active: true,
            paused: false,
            detached,
            on_depth: 0,
            prev_on: None,
            parent,
            parent_index,
            children: Vec::new(),
            owned: Vec::new(),
            cleanups: Mutex::new(Vec::new()),
        }) as u32);
        if let Some(p) = parent {
            if let Some(node) = scopes.get_mut(p.index()) {
                node.children.push(id);
            }
        }
        EffectScope {
            id,
            parent_owned: parent.is_some(),
        }
    }

    /// Run a closure with this scope as the current one, so effects and
    /// child scopes created inside attach here. Returns `None` (with a
    /// warning) on a stopped scope.
    pub fn run<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        if !SCOPES
            .read()
            .get(self.id.index())
            .is_some_and(|n| n.active)
        {
            tracing::warn!("cannot run on an inactive scope");
            return None;
        }
        let _current = CurrentScopeGuard::new(Some(self.id));
        Some(f())
    }

    /// Make this scope current without a closure; nestable, undone by the
    /// matching [`off`](EffectScope::off). Invalid on detached scopes.
    pub fn on(&self) {
        let mut scopes = SCOPES.write();
        let Some(node) = scopes.get_mut(self.id.index()) else {
            return;
        };
        if node.detached || !node.active {
            tracing::warn!("on() is only valid on active, attached scopes");
            return;
        }
        node.on_depth += 1;
        if node.on_depth == 1 {
            node.prev_on = Some(CURRENT_SCOPE.with(|c| c.replace(Some(self.id))));
        }
    }

    /// Undo one [`on`](EffectScope::on).
    pub fn off(&self) {
        let mut scopes = SCOPES.write();
        let Some(node) = scopes.get_mut(self.id.index()) else {
            return;
        };
        if node.on_depth == 0 {
            return;
        }
        node.on_depth -= 1;
        if node.on_depth == 0 {
            let previous = node.prev_on.take().flatten();
            CURRENT_SCOPE.with(|c| c.set(previous));
        }
    }

    /// Register a cleanup to run when this scope stops.
    pub fn on_cleanup<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut scopes = SCOPES.write();
        match scopes.get_mut(self.id.index()) {
            Some(node) if node.active => node.cleanups.get_mut().push(Box::new(f)),
            _ => tracing::warn!("cleanup registered on an inactive scope"),
        }
    }

    /// Whether the scope has not been stopped.
    pub fn is_active(&self) -> bool {
        SCOPES
            .read()
            .get(self.id.index())
            .is_some_and(|n| n.active)
    }

    /// Stop every owned effect and computed (insertion order), run
    /// cleanups (registration order), stop child scopes, and unlink from
    /// the parent. Idempotent.
    pub fn stop(&self) {
        stop_scope(self.id, false);
    }

    /// Pause owned effects and child scopes; notifications accumulate.
    pub fn pause(&self) {
        pause_scope(self.id);
    }

    /// Resume owned effects and child scopes, dispatching any that were
    /// notified while paused.
    pub fn resume(&self) {
        resume_scope(self.id);
    }
}

impl Default for EffectScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EffectScope {
    fn drop(&mut self) {
        // Child scopes are owned (and freed) by their parent.
        if self.parent_owned {
            return;
        }
        stop_scope(self.id, false);
        SCOPES.write().try_remove(self.id.index());
    }
}

fn stop_scope(id: ScopeId, from_parent: bool) {
    let taken = {
        let mut scopes = SCOPES.write();
        let Some(node) = scopes.get_mut(id.index()) else {
            return;
        };
        if !node.active {
            return;
        }
        node.active = false;
        (
            std::mem::take(&mut node.owned),
            std::mem::take(node.cleanups.get_mut()),
            std::mem::take(&mut node.children),
            if from_parent { None } else { node.parent },
            node.parent_index,
        )
    };
    let (owned, cleanups, children, parent, parent_index) = taken;

    for sub in owned {
        // Detach the back-reference first so the stop path does not try
        // to unregister from the list we just drained.
        with_graph(|g| {
            if let Some(node) = g.subs.get_mut(sub.index()) {
                node.scope = None;
            }
        });
        stop_subscriber(sub);
        // A computed also stops being a source: releasing its dep
        // detaches every downstream link.
        with_graph(|g| {
            if let Some(dep) = g.subs.get(sub.index()).and_then(|s| s.own_dep) {
                g.remove_dep(dep);
            }
            g.remove_sub(sub);
        });
    }

    for cleanup in cleanups {
        cleanup();
    }

    for child in children {
        stop_scope(child, true);
        SCOPES.write().try_remove(child.index());
    }

    if let Some(parent) = parent {
        unlink_child(parent, parent_index, id);
    }
}

/// O(1) removal from the parent's child list via the recorded index,
/// fixing the swapped-in sibling's index.
fn unlink_child(parent: ScopeId, index: usize, child: ScopeId) {
    let mut scopes = SCOPES.write();
    let moved = {
        let Some(node) = scopes.get_mut(parent.index()) else {
            return;
        };
        if node.children.get(index) != Some(&child) {
            return;
        }
        node.children.swap_remove(index);
        node.children.get(index).copied()
    };
    if let Some(moved) = moved {
        if let Some(moved_node) = scopes.get_mut(moved.index()) {
            moved_node.parent_index = index;
        }
    }
}

/// Computeds are pull-driven and never dispatched, so pause and resume
/// only concern the owned effects.
fn is_computed(sub: SubId) -> bool {
    with_graph_read(|g| g.subs.get(sub.index()).is_some_and(|s| s.own_dep.is_some()))
}

fn pause_scope(id: ScopeId) {
    let (owned, children) = {
        let mut scopes = SCOPES.write();
        let Some(node) = scopes.get_mut(id.index()) else {
            return;
        };
        node.paused = true;
        (node.owned.clone(), node.children.clone())
    };
    for sub in owned {
        if !is_computed(sub) {
            sub_update_flags(sub, PAUSED, 0);
        }
    }
    for child in children {
        pause_scope(child);
    }
}

fn resume_scope(id: ScopeId) {
    let (owned, children) = {
        let mut scopes = SCOPES.write();
        let Some(node) = scopes.get_mut(id.index()) else {
            return;
        };
        if !node.paused {
            return;
        }
        node.paused = false;
        (node.owned.clone(), node.children.clone())
    };
    for sub in owned {
        if is_computed(sub) {
            continue;
        }
        if let Some(old) = sub_update_flags(sub, 0, PAUSED) {
            if old & PAUSED != 0 && old & (DIRTY | PENDING) != 0 {
                batch::dispatch_effect(sub);
            }
        }
    }
    for child in children {
        resume_scope(child);
    }
}

/// Register a cleanup on the currently active scope. Warns and drops the
/// closure when no scope is active.
pub fn on_scope_dispose<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match current_active_scope() {
        Some(id) => {
            let mut scopes = SCOPES.write();
            if let Some(node) = scopes.get_mut(id.index()) {
                node.cleanups.get_mut().push(Box::new(f));
            }
        }
        None => tracing::warn!("on_scope_dispose called outside an active scope"),
    }
}
