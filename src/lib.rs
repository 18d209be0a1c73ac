#![deny(missing_docs)]

//! Fine-grained reactivity for dynamic data.
//!
//! This crate observes reads and writes so derived values recompute and
//! side effects re-run when their transitive inputs change. Dependency
//! edges are discovered by running your code, not declared: whatever a
//! subscriber actually reads this run is exactly what re-triggers it.
//!
//! # Quick Start
//!
//! ```ignore
//! use reverb::{Computed, Effect, Record, Ref, batch, reactive};
//!
//! // A reactive record.
//! let state = reactive(Record::new());
//! let state = state.as_record().unwrap().clone();
//! state.set("count", 0);
//!
//! // A cached derivation.
//! let s = state.clone();
//! let doubled = Computed::new(move || {
//!     s.get("count").and_then(|v| v.as_int()).unwrap_or(0) * 2
//! });
//!
//! // A side effect; runs now and after every relevant change.
//! let d = doubled.clone();
//! let _log = Effect::new(move || println!("doubled = {}", d.value()));
//!
//! state.set("count", 1);        // effect re-runs synchronously
//! batch(|| {
//!     state.set("count", 2);    // coalesced:
//!     state.set("count", 3);    // one effect run at batch end
//! });
//! ```
//!
//! # Core types
//!
//! - [`Ref`] - a reactive cell holding one [`Value`].
//! - [`Record`], [`List`], [`Map`], [`Set`] - reactive containers; wrap
//!   plain ones with [`reactive`], [`readonly`] and the shallow variants.
//! - [`Computed`] - a lazy cached derivation; recomputes only when an
//!   input's version advanced, and propagates only when its result
//!   actually changed.
//! - [`Effect`] - a side-effecting subscriber with optional scheduler,
//!   on-stop hook, `lazy` and `allow_recurse` options.
//! - [`EffectScope`] - tree-structured teardown: stopping a scope stops
//!   every effect and child scope created under it.
//!
//! # Batching
//!
//! Every write opens a one-shot batch, so a bare write dispatches its
//! dependents synchronously. [`batch`] (or [`start_batch`]/[`end_batch`])
//! widens the bracket: triggers coalesce and dependents run once at the
//! end, computeds revalidating before effects, effects in first-queued
//! order.
//!
//! # Equality
//!
//! Writes compare with SameValue semantics ([`Value`]'s `Eq`): `NaN`
//! equals itself, `+0.0` and `-0.0` differ, containers compare by
//! identity. A SameValue-equal write triggers nothing at all.

mod arena;
mod batch;
mod cell;
mod collections;
mod computed;
mod effect;
mod hash;
mod key;
mod list;
mod reactive;
mod record;
mod scope;
mod value;

pub use arena::tracking::PauseTracking;
pub use batch::{batch, end_batch, is_batching, start_batch};
pub use cell::Ref;
pub use collections::{EntriesIter, Map, Set, ValuesIter};
pub use computed::Computed;
pub use effect::{Effect, EffectBuilder, Runner, pause_tracking, untracked};
pub use key::{PropKey, Symbol};
pub use list::{List, ListIter};
pub use reactive::{
    freeze, is_proxy, is_reactive, is_readonly, is_shallow, mark_raw, reactive, readonly,
    shallow_reactive, shallow_readonly, to_raw,
};
pub use record::Record;
pub use scope::{EffectScope, on_scope_dispose};
pub use value::Value;

#[cfg(test)]
mod tests;
