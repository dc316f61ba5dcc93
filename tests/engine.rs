//! Façade behaviour: serialized commits, cancellation coalescing,
//! auto-commit suspension, notifications, and error surfacing.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use calc_flow::nodes::{map1, try_map1, Cell, Sum};
use calc_flow::{Builder, Engine, EngineConfig, GraphError, ValueWatch};

fn empty_engine() -> Engine {
    Engine::new(Builder::new().build_and_commit().unwrap())
}

#[test]
fn batch_registration_returns_handles() {
    let engine = empty_engine();
    let (a, b, sum) = engine
        .register_nodes(|builder| {
            let a = builder.add_input("a", Cell::new(), 2i64)?;
            let b = builder.add_input("b", Cell::new(), 3i64)?;
            let sum = builder.add_calculation("sum", Sum::of(&a, &b))?;
            Ok((a, b, sum))
        })
        .unwrap();

    let snapshot = engine.snapshot();
    assert!(snapshot.is_consistent());
    assert_eq!(*snapshot.get_value(&sum).unwrap(), 5);
    let _ = (a, b);
}

#[test]
fn failed_staging_surfaces_the_error_and_changes_nothing() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 1i64).unwrap();

    let mut foreign_builder = Builder::new();
    let foreign = foreign_builder
        .add_input("foreign", Cell::new(), 1i64)
        .unwrap();

    let err = engine
        .register_calculation("sum", Sum::of(&a, &foreign))
        .unwrap_err();
    assert!(matches!(err, GraphError::MissingDependency { .. }));

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.nodes().len(), 1);
    assert!(snapshot.is_consistent());
}

#[test]
fn removal_is_serialized_with_commits() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 1i64).unwrap();
    let b = engine.register_input("b", Cell::new(), 2i64).unwrap();
    let sum = engine.register_calculation("sum", Sum::of(&a, &b)).unwrap();

    let _ = engine.set_value(&a, 5, true, false).unwrap();
    engine.remove_node_and_dependents(sum.node()).unwrap();

    let snapshot = engine.snapshot();
    let names: Vec<&str> = snapshot.nodes().iter().map(|n| n.name()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(*snapshot.get_value(&a).unwrap(), 5);
}

#[test]
fn notifications_report_commit_changes_in_order() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 0i64).unwrap();
    let sum = engine.register_calculation("sum", Sum::of(&a, &a)).unwrap();

    let observed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let watched = sum.clone();
    engine.subscribe_fn(move |changes, snapshot| {
        if changes.contains(&watched) {
            sink.lock()
                .unwrap()
                .push(*snapshot.get_value(&watched).unwrap());
        }
    });

    for v in 1..=5i64 {
        let _ = engine.set_value(&a, v, false, false).unwrap();
        engine.wait_for_all_pending().unwrap();
    }

    let observed = observed.lock().unwrap();
    assert_eq!(observed.as_slice(), &[2, 4, 6, 8, 10]);
}

#[test]
fn coalesced_set_values_converge_to_the_last_write() {
    let engine = Engine::with_config(
        Builder::new().build_and_commit().unwrap(),
        EngineConfig {
            continue_with_aborted_calculations: true,
            parallel: true,
        },
    );
    let a = engine.register_input("a", Cell::new(), 0i64).unwrap();
    let slow = engine
        .register_calculation(
            "slow",
            map1(&a, |v: &i64| {
                std::thread::sleep(Duration::from_millis(20));
                v * 2
            }),
        )
        .unwrap();

    // The second write cancels the in-flight commit of the first; its
    // partial result is adopted and the fresh input value replayed.
    let _ = engine.set_value(&a, 1, true, false).unwrap();
    let _ = engine.set_value(&a, 2, true, false).unwrap();
    engine.wait_for_all_pending().unwrap();

    let snapshot = engine.snapshot();
    assert!(snapshot.is_consistent());
    assert_eq!(*snapshot.get_value(&a).unwrap(), 2);
    assert_eq!(*snapshot.get_value(&slow).unwrap(), 4);
}

#[test]
fn discarding_engine_also_converges() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 0i64).unwrap();
    let slow = engine
        .register_calculation(
            "slow",
            map1(&a, |v: &i64| {
                std::thread::sleep(Duration::from_millis(20));
                v + 100
            }),
        )
        .unwrap();

    for v in 1..=3i64 {
        let _ = engine.set_value(&a, v, true, false).unwrap();
    }
    engine.wait_for_all_pending().unwrap();

    let snapshot = engine.snapshot();
    assert!(snapshot.is_consistent());
    assert_eq!(*snapshot.get_value(&slow).unwrap(), 103);
}

#[test]
fn auto_commit_suspension_nests() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 0i64).unwrap();
    let sum = engine.register_calculation("sum", Sum::of(&a, &a)).unwrap();

    let commits = Arc::new(AtomicUsize::new(0));
    let counter = commits.clone();
    let watched = sum.clone();
    engine.subscribe_fn(move |changes, _| {
        if changes.contains(&watched) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    {
        let outer = engine.disable_auto_commit();
        let updated = engine.set_value(&a, 1, true, false).unwrap();
        assert!(!updated.is_consistent());
        {
            let _inner = engine.disable_auto_commit();
            let _ = engine.set_value(&a, 2, true, false).unwrap();
        }
        // The inner guard is gone but the outer still suspends.
        engine.wait_for_all_pending().unwrap();
        assert!(!engine.snapshot().is_consistent());
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        drop(outer);
    }

    engine.wait_for_all_pending().unwrap();
    let snapshot = engine.snapshot();
    assert!(snapshot.is_consistent());
    assert_eq!(*snapshot.get_value(&sum).unwrap(), 4);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[test]
fn always_commit_overrides_suspension() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 0i64).unwrap();
    let sum = engine.register_calculation("sum", Sum::of(&a, &a)).unwrap();

    let _guard = engine.disable_auto_commit();
    let _ = engine.set_value(&a, 3, true, true).unwrap();
    engine.wait_for_all_pending().unwrap();

    let snapshot = engine.snapshot();
    assert!(snapshot.is_consistent());
    assert_eq!(*snapshot.get_value(&sum).unwrap(), 6);
}

#[test]
fn background_calculation_errors_surface_on_wait() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 1i64).unwrap();
    let _checked = engine
        .register_calculation(
            "checked",
            try_map1(&a, |v: &i64| {
                if *v < 0 {
                    Err(GraphError::Calculation {
                        node: "checked".into(),
                        message: "negative input".into(),
                    })
                } else {
                    Ok(v * 2)
                }
            }),
        )
        .unwrap();

    let _ = engine.set_value(&a, -1, false, false).unwrap();
    let err = engine.wait_for_all_pending().unwrap_err();
    assert!(matches!(err, GraphError::Calculation { .. }));

    // Nothing was installed; the pending change survives.
    assert!(!engine.snapshot().is_consistent());
    // The error is reported once.
    engine.wait_for_all_pending().unwrap();
}

#[test]
fn awaited_commit_reports_calculation_errors() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 1i64).unwrap();
    let _checked = engine
        .register_calculation(
            "checked",
            try_map1(&a, |v: &i64| {
                if *v < 0 {
                    Err(GraphError::Calculation {
                        node: "checked".into(),
                        message: "negative input".into(),
                    })
                } else {
                    Ok(v * 2)
                }
            }),
        )
        .unwrap();

    {
        let _guard = engine.disable_auto_commit();
        let _ = engine.set_value(&a, -3, true, false).unwrap();
        let err = engine.commit(false).unwrap_err();
        assert!(matches!(err, GraphError::Calculation { .. }));
    }
    let _ = engine.wait_for_all_pending();
}

#[test]
fn watch_reports_typed_values() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 1i64).unwrap();
    let sum = engine.register_calculation("sum", Sum::of(&a, &a)).unwrap();

    let watch = ValueWatch::new(&engine, &sum);
    let latest = Arc::new(AtomicI64::new(0));
    let sink = latest.clone();
    watch.on_changed(move |value| {
        sink.store(**value, Ordering::SeqCst);
    });

    let _ = engine.set_value(&a, 21, false, false).unwrap();
    engine.wait_for_all_pending().unwrap();
    assert_eq!(latest.load(Ordering::SeqCst), 42);
}

#[test]
fn snapshots_taken_from_the_engine_stay_frozen() {
    let engine = empty_engine();
    let a = engine.register_input("a", Cell::new(), 1i64).unwrap();
    let sum = engine.register_calculation("sum", Sum::of(&a, &a)).unwrap();

    let before = engine.snapshot();
    let _ = engine.set_value(&a, 50, false, false).unwrap();
    engine.wait_for_all_pending().unwrap();

    assert_eq!(*before.get_value(&sum).unwrap(), 2);
    assert_eq!(*engine.snapshot().get_value(&sum).unwrap(), 100);
}
