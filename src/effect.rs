//! Side-effecting subscribers.
//!
//! An [`Effect`] wraps a closure that re-runs whenever one of the reactive
//! sources it read has changed. The first run happens at creation (unless
//! built `lazy`), establishing the dependency set; each re-run rebuilds it,
//! so branches that stop being read stop re-triggering.
//!
//! # Ownership
//!
//! An effect created while an [`EffectScope`](crate::EffectScope) is
//! current is owned by that scope: the handle can be dropped freely and
//! `scope.stop()` is the teardown path. A top-level effect is owned by its
//! handle and is stopped when the handle drops.
//!
//! # Example
//! ```ignore
//! let count = Ref::new(0);
//! let count2 = count.clone();
//! let _log = Effect::new(move || println!("count = {:?}", count2.get()));
//!
//! count.set(1); // effect re-runs synchronously
//! ```

use crate::arena::graph::{
    ACTIVE, ALLOW_RECURSE, CallbackGuard, DIRTY, PAUSED, PENDING, SchedulerFn, SubId, SubNode,
    sub_flags, sub_update_flags, with_graph,
};
use crate::arena::tracking::{self, CurrentSubGuard, PauseTracking};
use crate::batch;
use crate::scope;

/// A side-effecting subscriber. See the module docs for ownership rules.
pub struct Effect {
    id: SubId,
    scope_owned: bool,
}

/// Handle passed to a scheduler in place of running the effect directly.
///
/// Calling [`Runner::run`] later performs the deferred run. Cheap to clone
/// and inert once the effect is stopped.
#[derive(Clone, Copy)]
pub struct Runner {
    id: SubId,
}

impl Runner {
    pub(crate) fn new(id: SubId) -> Self {
        Runner { id }
    }

    /// Run the deferred effect now. Safe no-op if it was stopped.
    pub fn run(&self) {
        run_effect(self.id);
    }
}

/// Configuration for [`Effect`] creation.
///
/// ```ignore
/// let e = Effect::builder()
///     .allow_recurse()
///     .on_stop(|| println!("stopped"))
///     .create(|| { /* ... */ });
/// ```
#[derive(Default)]
pub struct EffectBuilder {
    lazy: bool,
    allow_recurse: bool,
    scheduler: Option<SchedulerFn>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl EffectBuilder {
    /// Skip the initial run; the effect first runs when dispatched or when
    /// [`Effect::run`] is called.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Permit one self-notification per run instead of dropping it.
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    /// Install a scheduler invoked instead of running the effect when it
    /// is dispatched; the [`Runner`] it receives performs the actual run.
    pub fn scheduler<S>(mut self, scheduler: S) -> Self
    where
        S: FnMut(Runner) + Send + 'static,
    {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Register a hook invoked after the effect is stopped.
    pub fn on_stop<C>(mut self, hook: C) -> Self
    where
        C: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Create the effect, registering it with the current scope and
    /// running it immediately unless `lazy` was requested.
    pub fn create<F>(self, f: F) -> Effect
    where
        F: FnMut() + Send + 'static,
    {
        let mut flags = ACTIVE;
        if self.allow_recurse {
            flags |= ALLOW_RECURSE;
        }

        let owner = scope::current_active_scope();
        let id = with_graph(|g| {
            let mut node = SubNode::new(flags, Box::new(f));
            *node.scheduler.get_mut() = self.scheduler;
            *node.on_stop.get_mut() = self.on_stop;
            node.scope_owned = owner.is_some();
            g.insert_sub(node)
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

        if !self.lazy {
            run_effect(id);
        }
        Effect {
            id,
            scope_owned: owner.is_some(),
        }
    }
}

impl Effect {
    /// Create an effect and run it immediately.
    pub fn new<F>(f: F) -> Effect
    where
        F: FnMut() + Send + 'static,
    {
        Self::builder().create(f)
    }

    /// Start configuring an effect.
    pub fn builder() -> EffectBuilder {
        EffectBuilder::default()
    }

    /// Run the effect now. On a stopped effect the closure is invoked
    /// without tracking.
    pub fn run(&self) {
        run_effect(self.id);
    }

    /// Stop the effect: detach every dependency link, unregister from the
    /// owning scope and invoke the on-stop hook. Idempotent; a stopped
    /// effect never runs again even if already queued.
    pub fn stop(&self) {
        stop_subscriber(self.id);
    }

    /// Suppress dispatch; notifications keep marking the effect dirty.
    pub fn pause(&self) {
        sub_update_flags(self.id, PAUSED, 0);
    }

    /// Lift the pause; if a notification arrived meanwhile, dispatch now.
    pub fn resume(&self) {
        let Some(old) = sub_update_flags(self.id, 0, PAUSED) else {
            return;
        };
        if old & PAUSED != 0 && old & (DIRTY | PENDING) != 0 {
            batch::dispatch_effect(self.id);
        }
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // Scope-owned effects outlive their handle; the scope tears them
        // down.
        if self.scope_owned {
            return;
        }
        stop_subscriber(self.id);
        with_graph(|g| g.remove_sub(self.id));
    }
}

/// Run an effect by id, falling back to an untracked invocation when it
/// has been stopped.
///
/// A notification that lands while the effect is mid-run (a permitted
/// self-notification, or a nested dispatch writing one of its inputs)
/// cannot re-enter the run protocol; it leaves DIRTY or PENDING behind
/// instead, and the loop here picks that up once the run has finished.
pub(crate) fn run_effect(sub: SubId) {
    loop {
        let Some(flags) = sub_flags(sub) else {
            return;
        };
        if flags & ACTIVE == 0 {
            let _outside = CurrentSubGuard::new(None);
            let mut callback = CallbackGuard::take(sub);
            callback.run();
            return;
        }
        tracking::run_sub(sub);

        let Some(flags) = sub_flags(sub) else {
            return;
        };
        if flags & (DIRTY | PENDING) == 0 {
            return;
        }
        if flags & DIRTY == 0 && !tracking::check_dirty(sub) {
            sub_update_flags(sub, 0, PENDING);
            return;
        }
        cov_mark::hit!(rerun_after_midrun_notification);
        sub_update_flags(sub, 0, PENDING);
    }
}

/// Shared stop path for effect handles and scope teardown.
pub(crate) fn stop_subscriber(sub: SubId) {
    let Some(old) = sub_update_flags(sub, 0, ACTIVE | DIRTY | PENDING | PAUSED) else {
        return;
    };
    if old & ACTIVE == 0 {
        return;
    }

    tracking::detach_all(sub);

    let scope_entry = with_graph(|g| g.subs.get_mut(sub.index()).and_then(|s| s.scope.take()));
    if let Some((scope_id, index)) = scope_entry {
        scope::unregister_owned(scope_id, index);
    }

    let hook = with_graph(|g| {
        g.subs
            .get(sub.index())
            .and_then(|s| s.on_stop.lock().take())
    });
    if let Some(hook) = hook {
        hook();
    }
}

/// Run a closure with no observing subscriber: reads inside it establish
/// no dependencies.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _outside = CurrentSubGuard::new(None);
    f()
}

/// Suspend dependency establishment until the returned guard drops,
/// without displacing the active subscriber. Nestable.
pub fn pause_tracking() -> PauseTracking {
    PauseTracking::new()
}
