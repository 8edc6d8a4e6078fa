//! Event graph integration tests.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use accel_sched::prelude::*;
use accel_sched::{CompletionMode, EventHandle};
use common::{eventually, init_tracing, Fixture};

#[test]
fn test_fan_out_submits_each_dependent_once() {
    init_tracing();
    for _ in 0..50 {
        let queue = EventQueue::new();
        let _h1 = EventHandler::new(&queue).unwrap();
        let _h2 = EventHandler::new(&queue).unwrap();

        let root_done = Arc::new(AtomicBool::new(false));
        let runs = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);

        let (flag, counts) = (Arc::clone(&root_done), Arc::clone(&runs));
        let r = queue.enqueue(move || {
            counts[0].fetch_add(1, Ordering::SeqCst);
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let dependent = |slot: usize| {
            let (flag, counts) = (Arc::clone(&root_done), Arc::clone(&runs));
            queue.enqueue_with_waitlist(&[r.handle()], move || {
                assert!(flag.load(Ordering::SeqCst));
                counts[slot].fetch_add(1, Ordering::SeqCst);
                Ok(slot)
            })
        };
        let s1 = dependent(1);
        let s2 = dependent(2);

        assert_eq!(s1.get().unwrap(), 1);
        assert_eq!(s2.get().unwrap(), 2);
        r.get().unwrap();
        for count in runs.iter() {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
        assert_eq!(queue.retained(), 0);
    }
}

#[test]
fn test_random_dag_respects_dependencies() {
    init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(1234);
    let queue = EventQueue::new();
    let handlers: Vec<_> = (0..4).map(|_| EventHandler::new(&queue).unwrap()).collect();

    let nodes = 40;
    let finished: Arc<Vec<AtomicBool>> = Arc::new((0..nodes).map(|_| AtomicBool::new(false)).collect());
    let executions: Arc<Vec<AtomicUsize>> = Arc::new((0..nodes).map(|_| AtomicUsize::new(0)).collect());
    let mut handles: Vec<EventHandle> = Vec::new();
    let mut events = Vec::new();

    for node in 0..nodes {
        let deps: Vec<usize> = (0..node).filter(|_| rng.gen_bool(0.15)).collect();
        let dep_handles: Vec<EventHandle> = deps.iter().map(|&d| handles[d].clone()).collect();
        let delay = rng.gen_range(0..300);
        let (finished, executions) = (Arc::clone(&finished), Arc::clone(&executions));

        let event = queue.enqueue_with_waitlist(&dep_handles, move || {
            for &d in &deps {
                assert!(finished[d].load(Ordering::SeqCst), "node {} ran before {}", node, d);
            }
            executions[node].fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(delay));
            finished[node].store(true, Ordering::SeqCst);
            Ok(())
        });
        handles.push(event.handle());
        events.push(event);
    }

    for event in events {
        event.get().unwrap();
    }
    assert!(executions.iter().all(|n| n.load(Ordering::SeqCst) == 1));
    drop(handlers);
}

#[test]
fn test_dependency_on_finished_event() {
    let queue = EventQueue::new();
    let _handler = EventHandler::new(&queue).unwrap();
    let first = queue.enqueue(|| Ok(3));
    let handle = first.handle();
    assert_eq!(first.get().unwrap(), 3);
    assert!(handle.is_done());

    let second = queue.enqueue_with_waitlist(&[handle], || Ok(4));
    assert_eq!(second.get().unwrap(), 4);
}

#[test]
fn test_nothing_runs_without_handler() {
    let queue = EventQueue::new();
    let event = queue.enqueue(|| Ok(()));
    assert_eq!(queue.ready(), 1);
    assert!(!event.is_done());

    let _handler = EventHandler::new(&queue).unwrap();
    event.get().unwrap();
    assert_eq!(queue.ready(), 0);
}

#[test]
fn test_runs_chained_through_graph() {
    let fx = Fixture::sws(1, CompletionMode::Manual);
    let kernel = fx.kernel("vadd", AccessMode::Shared);
    let first = Run::new(&kernel).unwrap();
    let second = Run::new(&kernel).unwrap();

    let queue = EventQueue::new();
    let _handler = EventHandler::new(&queue).unwrap();
    let e1 = first.enqueue(&queue, &[]);
    let e2 = second.enqueue(&queue, &[e1.handle()]);

    assert!(eventually(Duration::from_secs(5), || fx.sim.cu_running(0) == 1));
    std::thread::sleep(Duration::from_millis(10));
    // The second run waits for the first to complete, not just to start.
    assert_eq!(fx.sim.cu_starts(0), 1);
    assert!(!e2.is_done());

    fx.sim.complete_cu(0);
    assert_eq!(e1.get().unwrap(), CommandState::Completed);
    assert!(eventually(Duration::from_secs(5), || fx.sim.cu_running(0) == 1));
    fx.sim.complete_cu(0);
    assert_eq!(e2.get().unwrap(), CommandState::Completed);
    assert_eq!(fx.sim.cu_starts(0), 2);
    fx.runtime.shutdown().unwrap();
}

#[test]
fn test_failed_run_start_completes_event_with_error() {
    let fx = Fixture::sws(1, CompletionMode::Manual);
    let kernel = fx.kernel("vadd", AccessMode::Shared);
    let run = Run::new(&kernel).unwrap();
    run.start().unwrap();

    let queue = EventQueue::new();
    let _handler = EventHandler::new(&queue).unwrap();
    let event = run.enqueue(&queue, &[]);
    let after = queue.enqueue_with_waitlist(&[event.handle()], || Ok(()));

    assert!(matches!(event.get(), Err(ExecError::CommandBusy(_))));
    after.get().unwrap();

    assert!(eventually(Duration::from_secs(5), || fx.sim.cu_running(0) == 1));
    fx.sim.complete_cu(0);
    assert_eq!(run.wait(None).unwrap(), CommandState::Completed);
    fx.runtime.shutdown().unwrap();
}
