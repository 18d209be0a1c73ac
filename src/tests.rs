//! End-to-end tests driving the whole engine through its public surface.
use crate::{
    Computed, Effect, EffectScope, List, Map, Record, Ref, Value, batch, end_batch, is_batching,
    on_scope_dispose, reactive, readonly, start_batch, to_raw, untracked,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn reactive_record() -> Record {
    reactive(Record::new()).as_record().unwrap().clone()
}

fn reactive_map() -> Map {
    reactive(Map::new()).as_map().unwrap().clone()
}

// ============================================================================
// Identity and flavor invariants
// ============================================================================

#[test]
fn raw_roundtrip_and_proxy_identity() {
    let raw = Value::from(Record::new());

    assert_eq!(to_raw(&reactive(raw.clone())), raw);
    assert_eq!(reactive(raw.clone()), reactive(raw.clone()));

    let r = reactive(raw.clone());
    let ro = readonly(r.clone());
    assert_ne!(ro, r, "readonly of reactive is a distinct view");
    assert_eq!(to_raw(&ro), raw, "but over the same raw");
}

#[test]
fn write_then_read_yields_written_value() {
    let r = reactive_record();
    r.set("name", "ada");
    assert_eq!(r.get("name"), Some(Value::from("ada")));

    let cell = Ref::new(10);
    r.set("n", Value::Ref(cell));
    r.set("n", 11); // writes through the cell
    assert_eq!(r.get("n"), Some(Value::Int(11)), "reads unwrap the cell");
}

// ============================================================================
// Effects over records
// ============================================================================

#[test]
fn same_value_writes_do_not_rerun() {
    // reactive({ n: 0 }); effect reads n; n=1; n=1; n=2 -> seen [0, 1, 2]
    let r = reactive_record();
    r.set("n", 0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let r2 = r.clone();
    let seen2 = seen.clone();
    let _e = Effect::new(move || {
        seen2.lock().push(r2.get("n").and_then(|v| v.as_int()).unwrap());
    });

    r.set("n", 1);
    r.set("n", 1);
    r.set("n", 2);
    assert_eq!(*seen.lock(), vec![0, 1, 2]);
}

#[test]
fn effect_dispatch_is_fifo_by_enqueue() {
    let r = Ref::new(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    let r1 = r.clone();
    let o1 = order.clone();
    let _e1 = Effect::new(move || {
        r1.get();
        o1.lock().push(1);
    });
    let r2 = r.clone();
    let o2 = order.clone();
    let _e2 = Effect::new(move || {
        r2.get();
        o2.lock().push(2);
    });

    order.lock().clear();
    r.set(1);
    assert_eq!(*order.lock(), vec![1, 2]);
}

#[test]
fn effect_resubscribes_each_run() {
    // After switching its read to `b`, writes to `a` stop re-running the
    // effect: stale links were detached (link integrity, observable form).
    let a = Ref::new(0);
    let b = Ref::new(0);
    let use_b = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));

    let (a2, b2) = (a.clone(), b.clone());
    let use_b2 = use_b.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        if use_b2.load(Ordering::Relaxed) {
            b2.get();
        } else {
            a2.get();
        }
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    use_b.store(true, Ordering::Relaxed);
    a.set(1); // still subscribed to `a`: reruns, now reading `b`
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    a.set(2); // no longer a dependency
    assert_eq!(runs.load(Ordering::Relaxed), 2);
    b.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 3);
}

#[test]
fn untracked_reads_establish_nothing() {
    let a = Ref::new(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let a2 = a.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        untracked(|| a2.get());
        runs2.fetch_add(1, Ordering::Relaxed);
    });

    a.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 1);
}

#[test]
fn allow_recurse_permits_one_self_notification() {
    cov_mark::check!(rerun_after_midrun_notification);
    let n = Ref::new(0);

    let n2 = n.clone();
    let _e = Effect::builder().allow_recurse().create(move || {
        let v = n2.get().as_int().unwrap();
        if v < 3 {
            n2.set(v + 1); // self-notification; permitted once per run
        }
    });
    // Each run bumps by one and queues one re-run until the guard value.
    assert_eq!(n.get(), Value::Int(3));
}

#[test]
fn self_notification_without_allow_recurse_is_dropped() {
    cov_mark::check!(self_notification_dropped);
    let n = Ref::new(0);

    let n2 = n.clone();
    let _e = Effect::new(move || {
        let v = n2.get().as_int().unwrap();
        n2.set(v + 1);
    });
    assert_eq!(n.get(), Value::Int(1), "ran once, self-trigger dropped");
}

// ============================================================================
// Computed chains and glitch-freeness
// ============================================================================

#[test]
fn batched_writes_reach_computed_chain_once() {
    // a=1, b=2; s=a+b; d=s*10; effect logs d. Batch a=2, b=3.
    let a = Ref::new(1);
    let b = Ref::new(2);

    let (a2, b2) = (a.clone(), b.clone());
    let s = Computed::new(move || a2.get().as_int().unwrap() + b2.get().as_int().unwrap());
    let s2 = s.clone();
    let d = Computed::new(move || s2.value() * 10);

    let out = Arc::new(Mutex::new(Vec::new()));
    let d2 = d.clone();
    let out2 = out.clone();
    let _e = Effect::new(move || out2.lock().push(d2.value()));
    assert_eq!(*out.lock(), vec![30]);

    start_batch();
    a.set(2);
    b.set(3);
    assert_eq!(*out.lock(), vec![30], "no dispatch inside the batch");
    end_batch();

    assert_eq!(*out.lock(), vec![30, 50], "one batched run");
}

#[test]
fn one_write_runs_downstream_effect_at_most_once() {
    // a -> c1 -> c2 -> e: a single write may not run e twice.
    let a = Ref::new(1);

    let a2 = a.clone();
    let c1 = Computed::new(move || a2.get().as_int().unwrap() * 2);
    let c1b = c1.clone();
    let c2 = Computed::new(move || c1b.value() + 1);

    let runs = Arc::new(AtomicUsize::new(0));
    let c2b = c2.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        c2b.value();
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    a.set(2);
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn unchanged_computed_blocks_downstream_dispatch() {
    cov_mark::check!(revalidation_cleared_pending);
    // The computed's output is constant over this input change, so the
    // effect's pending state revalidates to "nothing changed".
    let a = Ref::new(1);

    let a2 = a.clone();
    let parity = Computed::new(move || a2.get().as_int().unwrap() % 2);

    let runs = Arc::new(AtomicUsize::new(0));
    let p2 = parity.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        p2.value();
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    a.set(3); // parity unchanged
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    a.set(2); // parity changed
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn writable_computed_forwards_and_notifies_once() {
    // c = { get: r.n, set: v -> r.n = v }; c.set(5)
    let r = reactive_record();
    r.set("n", 0);

    let (rg, rs) = (r.clone(), r.clone());
    let c = Computed::writable(
        move || rg.get("n").and_then(|v| v.as_int()).unwrap(),
        move |v: i64| rs.set("n", v),
    );

    let runs = Arc::new(AtomicUsize::new(0));
    let c2 = c.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        c2.value();
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    c.set(5);
    assert_eq!(r.get("n"), Some(Value::Int(5)));
    assert_eq!(runs.load(Ordering::Relaxed), 2, "exactly one re-run");
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn nested_batches_defer_to_outermost() {
    let r = Ref::new(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let r2 = r.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        r2.get();
        runs2.fetch_add(1, Ordering::Relaxed);
    });

    batch(|| {
        r.set(1);
        batch(|| r.set(2));
        assert!(is_batching());
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    });
    assert!(!is_batching());
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn panicking_effect_does_not_starve_the_queue() {
    cov_mark::check!(drain_captured_panic);
    let r = Ref::new(0);
    let survivor_runs = Arc::new(AtomicUsize::new(0));

    let r2 = r.clone();
    let _bomb = Effect::new(move || {
        if r2.get().as_int().unwrap() > 0 {
            panic!("effect exploded");
        }
    });
    let r3 = r.clone();
    let sr = survivor_runs.clone();
    let _survivor = Effect::new(move || {
        r3.get();
        sr.fetch_add(1, Ordering::Relaxed);
    });

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| r.set(1)));
    assert!(result.is_err(), "first panic is rethrown after the drain");
    assert_eq!(
        survivor_runs.load(Ordering::Relaxed),
        2,
        "the queue behind the panicking effect still ran"
    );

    // The engine is still consistent afterwards.
    r.set(2);
    assert_eq!(survivor_runs.load(Ordering::Relaxed), 3);
}

#[test]
fn scheduler_defers_the_run_to_the_caller() {
    let r = Ref::new(0);
    let runners = Arc::new(Mutex::new(Vec::new()));
    let runs = Arc::new(AtomicUsize::new(0));

    let runners2 = runners.clone();
    let r2 = r.clone();
    let runs2 = runs.clone();
    let _e = Effect::builder()
        .scheduler(move |runner| runners2.lock().push(runner))
        .create(move || {
            r2.get();
            runs2.fetch_add(1, Ordering::Relaxed);
        });
    assert_eq!(runs.load(Ordering::Relaxed), 1, "initial run is direct");

    r.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 1, "dispatch went to the scheduler");
    let queued: Vec<_> = runners.lock().drain(..).collect();
    assert_eq!(queued.len(), 1);
    queued[0].run();
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

// ============================================================================
// Pause / resume
// ============================================================================

#[test]
fn paused_effect_holds_notifications_until_resume() {
    cov_mark::check!(paused_notification_held);
    let r = Ref::new(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let r2 = r.clone();
    let runs2 = runs.clone();
    let e = Effect::new(move || {
        r2.get();
        runs2.fetch_add(1, Ordering::Relaxed);
    });

    e.pause();
    r.set(1);
    r.set(2);
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    e.resume();
    assert_eq!(runs.load(Ordering::Relaxed), 2, "dispatched once on resume");

    e.resume(); // no pending notification: nothing happens
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

// ============================================================================
// Scopes
// ============================================================================

#[test]
fn stopped_scope_silences_its_effects() {
    let r = reactive_record();
    r.set("v", 0);
    let runs = Arc::new(AtomicUsize::new(0));

    let scope = EffectScope::new();
    let r2 = r.clone();
    let runs2 = runs.clone();
    let _ = scope.run(move || {
        let _e = Effect::new(move || {
            r2.get("v");
            runs2.fetch_add(1, Ordering::Relaxed);
        });
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    scope.stop();
    scope.stop(); // idempotent
    r.set("v", 1);
    assert_eq!(runs.load(Ordering::Relaxed), 1, "zero runs after stop");
}

#[test]
fn stopped_scope_silences_its_computeds() {
    let r = Ref::new(1);
    let evals = Arc::new(AtomicUsize::new(0));

    let scope = EffectScope::new();
    let r2 = r.clone();
    let evals2 = evals.clone();
    let c = scope
        .run(move || {
            Computed::new(move || {
                evals2.fetch_add(1, Ordering::Relaxed);
                r2.get().as_int().unwrap() * 2
            })
        })
        .unwrap();
    assert_eq!(c.value(), 2);
    assert_eq!(evals.load(Ordering::Relaxed), 1);

    scope.stop();

    // The computed no longer tracks or refreshes; it serves its last
    // cached value.
    r.set(5);
    assert_eq!(c.value(), 2);
    assert_eq!(evals.load(Ordering::Relaxed), 1);

    // Nor does reading it through an effect subscribe anyone to anything.
    let runs = Arc::new(AtomicUsize::new(0));
    let c2 = c.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        c2.value();
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    r.set(9);
    assert_eq!(runs.load(Ordering::Relaxed), 1);
}

#[test]
fn scope_cascade_stops_descendants_and_runs_cleanups_once() {
    let r = Ref::new(0);
    let runs = Arc::new(AtomicUsize::new(0));
    let cleanups = Arc::new(AtomicUsize::new(0));

    let parent = EffectScope::new();
    {
        let r = r.clone();
        let runs = runs.clone();
        let cleanups = cleanups.clone();
        let _ = parent.run(move || {
            let cleanups2 = cleanups.clone();
            on_scope_dispose(move || {
                cleanups2.fetch_add(1, Ordering::Relaxed);
            });

            let child = EffectScope::new();
            let _ = child.run(move || {
                let cleanups3 = cleanups.clone();
                on_scope_dispose(move || {
                    cleanups3.fetch_add(1, Ordering::Relaxed);
                });
                let _e = Effect::new(move || {
                    r.get();
                    runs.fetch_add(1, Ordering::Relaxed);
                });
            });
        });
    }
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    parent.stop();
    parent.stop();
    assert_eq!(cleanups.load(Ordering::Relaxed), 2, "each cleanup exactly once");

    r.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 1, "grandchild effect is dead");
}

#[test]
fn scope_pause_and_resume_cascade() {
    let r = Ref::new(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let scope = EffectScope::new();
    let r2 = r.clone();
    let runs2 = runs.clone();
    let _ = scope.run(move || {
        let _e = Effect::new(move || {
            r2.get();
            runs2.fetch_add(1, Ordering::Relaxed);
        });
    });

    scope.pause();
    r.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    scope.resume();
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

// ============================================================================
// Collections through effects
// ============================================================================

#[test]
fn map_key_iteration_scenario() {
    // keys observed: [] then ['x']; same-value set and missing-key delete
    // do not re-run.
    let m = reactive_map();
    let observed = Arc::new(Mutex::new(Vec::new()));

    let m2 = m.clone();
    let observed2 = observed.clone();
    let _e = Effect::new(move || {
        let keys: Vec<Value> = m2.keys().collect();
        observed2.lock().push(keys);
    });

    m.set("x", 1);
    m.set("x", 1);
    m.delete(&Value::from("y"));

    let observed = observed.lock();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0], Vec::<Value>::new());
    assert_eq!(observed[1], vec![Value::from("x")]);
}

#[test]
fn readonly_write_neither_throws_nor_reruns() {
    let base = Record::new();
    base.set("v", 1);
    let ro = readonly(base.clone());
    let ro = ro.as_record().unwrap().clone();

    let runs = Arc::new(AtomicUsize::new(0));
    let ro2 = ro.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        ro2.get("v");
        runs2.fetch_add(1, Ordering::Relaxed);
    });

    ro.set("v", 2);
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert_eq!(base.get("v"), Some(Value::Int(1)));
}

#[test]
fn readonly_view_tracks_changes_made_through_reactive_alias() {
    // readonly(reactive(m)): reads through the readonly view still re-run
    // when the reactive alias mutates the shared raw.
    let raw = Map::new();
    let rw = reactive(raw.clone());
    let rw = rw.as_map().unwrap().clone();
    let ro = readonly(Value::from(raw));
    let ro = ro.as_map().unwrap().clone();

    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        ro.get(&Value::from("k"));
        runs2.fetch_add(1, Ordering::Relaxed);
    });

    rw.set("k", 1);
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn list_iteration_follows_mutators() {
    let l = reactive(List::new());
    let l = l.as_list().unwrap().clone();
    let sums = Arc::new(Mutex::new(Vec::new()));

    let l2 = l.clone();
    let sums2 = sums.clone();
    let _e = Effect::new(move || {
        let sum: i64 = l2.iter().filter_map(|v| v.as_int()).sum();
        sums2.lock().push(sum);
    });

    batch(|| {
        l.push(1);
        l.push(2);
        l.push(3);
    });
    l.shift();
    assert_eq!(*sums.lock(), vec![0, 6, 5]);
}

// ============================================================================
// Stress
// ============================================================================

#[test]
fn many_effects_one_source() {
    let r = Ref::new(0);
    let total = Arc::new(AtomicUsize::new(0));

    let _effects: Vec<Effect> = (0..100)
        .map(|_| {
            let r = r.clone();
            let total = total.clone();
            Effect::new(move || {
                r.get();
                total.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    assert_eq!(total.load(Ordering::Relaxed), 100);

    r.set(1);
    assert_eq!(total.load(Ordering::Relaxed), 200);
}

#[test]
fn one_effect_many_sources() {
    let cells: Vec<Ref> = (0..100).map(|i| Ref::new(i as i64)).collect();
    let runs = Arc::new(AtomicUsize::new(0));

    let cells2 = cells.clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        for c in &cells2 {
            c.get();
        }
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    cells[50].set(1000);
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    batch(|| {
        for c in &cells {
            c.set(-1);
        }
    });
    assert_eq!(runs.load(Ordering::Relaxed), 3, "one run for the whole batch");
}

#[test]
fn deep_computed_chain_stays_glitch_free() {
    let a = Ref::new(0);
    let mut chain: Vec<Arc<Computed<i64>>> = Vec::new();
    let a2 = a.clone();
    chain.push(Computed::new(move || a2.get().as_int().unwrap() + 1));
    for _ in 0..20 {
        let prev = chain.last().unwrap().clone();
        chain.push(Computed::new(move || prev.value() + 1));
    }

    let runs = Arc::new(AtomicUsize::new(0));
    let last = chain.last().unwrap().clone();
    let runs2 = runs.clone();
    let _e = Effect::new(move || {
        last.value();
        runs2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    a.set(5);
    assert_eq!(runs.load(Ordering::Relaxed), 2, "one run through 21 computeds");
    assert_eq!(chain.last().unwrap().value(), 26);
}
