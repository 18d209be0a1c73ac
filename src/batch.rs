//! The batch scheduler: coalesces notifications and drains them in order.
//!
//! A batch is a bracketed region (`start_batch`/`end_batch`, or the
//! closure form [`batch`]) inside which triggers only queue subscribers.
//! When the depth counter returns to zero the queues drain: computeds
//! first, so cache revalidation precedes side effects, then effects in
//! FIFO enqueue order. Every trigger opens its own one-shot batch, which
//! is why a bare write outside any user batch dispatches synchronously.
//!
//! A panic inside one effect does not starve the rest: the drain captures
//! it, finishes the queue, and rethrows the first payload.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use crate::arena::graph::{
    ACTIVE, ALLOW_RECURSE, DIRTY, NOTIFIED, PAUSED, PENDING, RUNNING, SchedulerFn, SubId,
    sub_flags, sub_update_flags, with_graph_read,
};
use crate::arena::{dep_map, tracking};
use crate::effect::Runner;

struct BatchState {
    depth: usize,
    draining: bool,
    computeds: Vec<SubId>,
    effects: Vec<SubId>,
}

thread_local! {
    static BATCH: RefCell<BatchState> = const {
        RefCell::new(BatchState {
            depth: 0,
            draining: false,
            computeds: Vec::new(),
            effects: Vec::new(),
        })
    };
}

/// Open a batch. Triggers queue instead of dispatching until the matching
/// [`end_batch`].
pub fn start_batch() {
    BATCH.with(|b| b.borrow_mut().depth += 1);
}

/// Close a batch. When the outermost batch closes, queued subscribers are
/// drained.
pub fn end_batch() {
    let should_drain = BATCH.with(|b| {
        let mut b = b.borrow_mut();
        b.depth = b.depth.saturating_sub(1);
        b.depth == 0 && !b.draining && !(b.computeds.is_empty() && b.effects.is_empty())
    });
    if should_drain && !std::thread::panicking() {
        drain();
    }
}

/// True while inside an open batch.
pub fn is_batching() -> bool {
    BATCH.with(|b| b.borrow().depth > 0)
}

struct BatchEnd;

impl Drop for BatchEnd {
    fn drop(&mut self) {
        end_batch();
    }
}

/// Run a closure inside a batch; dependent subscribers dispatch once when
/// the outermost batch closes, even if the closure panics.
pub fn batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    start_batch();
    let _end = BatchEnd;
    f()
}

/// Queue a subscriber for the current batch.
///
/// `direct` distinguishes a real version advance (the notified dep was
/// triggered, so the subscriber is DIRTY) from propagation through a
/// computed whose value may yet be unchanged (PENDING, revalidated at
/// dispatch). The NOTIFIED bit deduplicates enqueues; a self-notification
/// while the effect is running is dropped unless ALLOW_RECURSE is set.
pub(crate) fn notify_sub(sub: SubId, is_computed: bool, direct: bool) {
    let Some(flags) = sub_flags(sub) else {
        return;
    };
    let mark = if direct { DIRTY } else { PENDING };

    if is_computed {
        // A computed notified while refreshing itself would loop forever.
        if flags & RUNNING != 0 && tracking::current_sub() == Some(sub) {
            return;
        }
        if let Some(old) = sub_update_flags(sub, mark | NOTIFIED, 0) {
            if old & NOTIFIED == 0 {
                BATCH.with(|b| b.borrow_mut().computeds.push(sub));
            }
        }
        return;
    }

    if flags & RUNNING != 0
        && tracking::current_sub() == Some(sub)
        && flags & ALLOW_RECURSE == 0
    {
        cov_mark::hit!(self_notification_dropped);
        return;
    }
    if let Some(old) = sub_update_flags(sub, mark | NOTIFIED, 0) {
        if old & NOTIFIED == 0 {
            BATCH.with(|b| b.borrow_mut().effects.push(sub));
        }
    }
}

struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        BATCH.with(|b| b.borrow_mut().draining = false);
    }
}

/// Drain both queues to empty, computeds before effects, repeating while
/// dispatch produces new entries.
fn drain() {
    BATCH.with(|b| b.borrow_mut().draining = true);
    let _guard = DrainGuard;

    let mut first_panic: Option<Box<dyn std::any::Any + Send>> = None;
    loop {
        // Computeds: clear NOTIFIED and let their own dep fan the
        // notification out. Refresh itself stays lazy; downstream
        // subscribers revalidate at dispatch.
        loop {
            let computeds = BATCH.with(|b| std::mem::take(&mut b.borrow_mut().computeds));
            if computeds.is_empty() {
                break;
            }
            for c in computeds {
                sub_update_flags(c, 0, NOTIFIED);
                let own = with_graph_read(|g| g.subs.get(c.index()).and_then(|s| s.own_dep));
                if let Some(dep) = own {
                    dep_map::propagate_from_computed(dep);
                }
            }
        }

        let effects = BATCH.with(|b| std::mem::take(&mut b.borrow_mut().effects));
        if effects.is_empty() {
            break;
        }
        for e in effects {
            let result = catch_unwind(AssertUnwindSafe(|| dispatch_effect(e)));
            if let Err(payload) = result {
                cov_mark::hit!(drain_captured_panic);
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }
    }

    if let Some(payload) = first_panic {
        resume_unwind(payload);
    }
}

/// Dispatch one queued effect: revalidate PENDING state, then run it (or
/// hand the runner to its scheduler) if a transitive input really changed.
pub(crate) fn dispatch_effect(sub: SubId) {
    let Some(old) = sub_update_flags(sub, 0, NOTIFIED) else {
        return;
    };
    let flags = old & !NOTIFIED;
    if flags & ACTIVE == 0 {
        sub_update_flags(sub, 0, DIRTY | PENDING);
        return;
    }
    if flags & PAUSED != 0 {
        cov_mark::hit!(paused_notification_held);
        return;
    }
    // Mid-run re-entry would clobber the running instance's dep cursor;
    // the run loop re-dispatches from the flags it leaves behind.
    if flags & RUNNING != 0 {
        return;
    }

    let mut dirty = flags & DIRTY != 0;
    if !dirty && flags & PENDING != 0 {
        dirty = tracking::check_dirty(sub);
    }
    sub_update_flags(sub, 0, PENDING);
    if !dirty {
        cov_mark::hit!(revalidation_cleared_pending);
        return;
    }

    let scheduler =
        with_graph_read(|g| g.subs.get(sub.index()).and_then(|s| s.scheduler.lock().take()));
    match scheduler {
        Some(scheduler) => {
            // DIRTY stays set so the runner's eventual `run` really runs.
            struct Restore(SubId, Option<SchedulerFn>);
            impl Drop for Restore {
                fn drop(&mut self) {
                    if let Some(f) = self.1.take() {
                        with_graph_read(|g| {
                            if let Some(s) = g.subs.get(self.0.index()) {
                                *s.scheduler.lock() = Some(f);
                            }
                        });
                    }
                }
            }
            let mut restore = Restore(sub, Some(scheduler));
            if let Some(f) = restore.1.as_mut() {
                f(Runner::new(sub));
            }
        }
        None => crate::effect::run_effect(sub),
    }
}
