// ABOUTME: Integration tests for affinity scheduling of tasks
// ABOUTME: Tests exclusive ordering, concurrent completion and UI thread dispatch

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskchain::engine::{TaskAffinity, TaskManager};

mod common;
use common::{manager, signal, Recorder, WAIT};

#[test]
fn test_exclusive_tasks_run_in_start_order() {
    let tasks = manager();
    let recorder = Recorder::new();
    let (tx, rx) = signal();

    for i in 0..10 {
        let recorder = recorder.clone();
        let tx = tx.clone();
        let task = tasks.create("Exclusive", TaskAffinity::Exclusive, move |_| {
            recorder.record(i.to_string());
            thread::sleep(Duration::from_millis(2));
            Ok(())
        });
        task.on_end(move |_, _, _| tx.send(()).unwrap());
        task.start();
    }

    for _ in 0..10 {
        rx.recv_timeout(WAIT).unwrap();
    }
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(recorder.events(), expected);
}

#[test]
fn test_concurrent_tasks_overlap_and_all_complete() {
    let tasks = manager();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = signal();

    for _ in 0..8 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let tx = tx.clone();
        tasks
            .create("Concurrent", TaskAffinity::Concurrent, move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
                Ok(())
            })
            .start();
    }

    for _ in 0..8 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[test]
fn test_exclusive_work_never_overlaps_concurrent_work() {
    let tasks = manager();
    let concurrent = Arc::new(AtomicUsize::new(0));
    let exclusive = Arc::new(AtomicBool::new(false));
    let overlap = Arc::new(AtomicBool::new(false));
    let (tx, rx) = signal();

    for i in 0..15 {
        let concurrent = Arc::clone(&concurrent);
        let exclusive = Arc::clone(&exclusive);
        let overlap = Arc::clone(&overlap);
        let tx = tx.clone();
        let affinity = if i % 5 == 0 {
            TaskAffinity::Exclusive
        } else {
            TaskAffinity::Concurrent
        };
        tasks
            .create("Mixed", affinity, move |_| {
                if affinity == TaskAffinity::Exclusive {
                    exclusive.store(true, Ordering::SeqCst);
                    if concurrent.load(Ordering::SeqCst) != 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    exclusive.store(false, Ordering::SeqCst);
                } else {
                    concurrent.fetch_add(1, Ordering::SeqCst);
                    if exclusive.load(Ordering::SeqCst) {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(10));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }
                tx.send(()).unwrap();
                Ok(())
            })
            .start();
    }

    for _ in 0..15 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert!(!overlap.load(Ordering::SeqCst));
}

#[test]
fn test_ui_tasks_run_on_the_ui_thread() {
    let tasks = manager();
    let ui = tasks.create("Ui", TaskAffinity::Ui, |ctx| {
        Ok(ctx.task().manager().in_ui_thread())
    });
    let pool = ui.then_func_on(TaskAffinity::Concurrent, |_, on_ui: Option<bool>| {
        Ok((on_ui.unwrap_or_default(), thread::current().name().map(str::to_string)))
    });

    let (on_ui, pool_thread) = pool.start_and_wait().unwrap();
    assert!(on_ui);
    assert_ne!(pool_thread.as_deref(), Some("taskchain-ui"));
    assert!(!tasks.in_ui_thread());
}

#[test]
fn test_long_running_tasks_get_a_dedicated_thread() {
    let tasks = manager();
    let task = tasks.create("Long", TaskAffinity::LongRunning, |_| {
        Ok(thread::current().name().map(str::to_string))
    });
    assert_eq!(
        task.start_and_wait().unwrap().as_deref(),
        Some("taskchain-long-running")
    );
}

#[test]
fn test_shut_down_scheduler_fails_new_tasks() {
    let tasks = manager();
    tasks.scheduler().shutdown();

    let error = tasks.func(|_| Ok(1)).start_and_wait().unwrap_err();
    assert!(error.to_string().contains("shut down"));
}

#[test]
fn test_managers_from_defaults_are_independent() {
    let first = TaskManager::with_defaults().unwrap();
    let second = TaskManager::with_defaults().unwrap();
    first.stop();
    assert!(first.is_stopped());
    assert!(!second.is_stopped());
    assert_eq!(second.func(|_| Ok(2)).start_and_wait().unwrap(), 2);
}
