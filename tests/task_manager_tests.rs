#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use stargz_fs::task::BackgroundTaskManager;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_waits_for_quiet_window_after_priority() {
    let quiet = Duration::from_millis(100);
    let manager = BackgroundTaskManager::new(2, quiet);

    let done_at = {
        let guard = manager.priority();
        // End priority immediately; record when it ended.
        drop(guard);
        Instant::now()
    };

    manager
        .invoke_background(Duration::from_secs(1), |_token| async {})
        .await;
    let waited = done_at.elapsed();
    assert!(
        waited >= quiet,
        "background ran {waited:?} after priority end; quiet window is {quiet:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_background_starts_while_priority_in_flight() {
    let manager = BackgroundTaskManager::new(2, Duration::from_millis(20));
    let started = Arc::new(AtomicBool::new(false));

    let guard = manager.priority();
    let task = {
        let manager = Arc::clone(&manager);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            manager
                .invoke_background(Duration::from_secs(1), |_token| {
                    let started = Arc::clone(&started);
                    async move {
                        started.store(true, Ordering::SeqCst);
                    }
                })
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !started.load(Ordering::SeqCst),
        "background task started while a priority task was in flight"
    );

    drop(guard);
    task.await.unwrap();
    assert!(started.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_priority_task_cancels_running_background() {
    let manager = BackgroundTaskManager::new(1, Duration::from_millis(1));

    let task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .invoke_background(Duration::from_secs(10), |token| async move {
                    let start = Instant::now();
                    while !token.is_cancelled() {
                        if start.elapsed() > Duration::from_secs(5) {
                            return false;
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    true
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _guard = manager.priority();
    assert!(task.await.unwrap(), "token never tripped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slice_timeout_trips_token() {
    let manager = BackgroundTaskManager::new(1, Duration::from_millis(1));
    let cancelled = manager
        .invoke_background(Duration::from_millis(30), |token| async move {
            let start = Instant::now();
            while !token.is_cancelled() {
                if start.elapsed() > Duration::from_secs(5) {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            true
        })
        .await;
    assert!(cancelled, "timeout never tripped the token");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_background_tasks_are_bounded() {
    let manager = BackgroundTaskManager::new(2, Duration::from_millis(1));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let manager = Arc::clone(&manager);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            manager
                .invoke_background(Duration::from_secs(1), |_token| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "more than two background tasks ran concurrently"
    );
}

/// Repeated priority activity starves background work for as long as the
/// activity continues: forward progress happens only in quiet windows.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_progresses_only_during_quiet_windows() {
    let quiet = Duration::from_millis(40);
    let manager = BackgroundTaskManager::new(1, quiet);
    let overlap = Arc::new(AtomicBool::new(false));
    let priority_active = Arc::new(AtomicBool::new(false));

    let background = {
        let manager = Arc::clone(&manager);
        let overlap = Arc::clone(&overlap);
        let priority_active = Arc::clone(&priority_active);
        tokio::spawn(async move {
            // Several slices, each checking it never runs while a priority
            // task is active.
            for _ in 0..3 {
                manager
                    .invoke_background(Duration::from_secs(1), |_token| {
                        let overlap = Arc::clone(&overlap);
                        let priority_active = Arc::clone(&priority_active);
                        async move {
                            if priority_active.load(Ordering::SeqCst) {
                                overlap.store(true, Ordering::SeqCst);
                            }
                        }
                    })
                    .await;
            }
        })
    };

    for _ in 0..5 {
        let guard = manager.priority();
        priority_active.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        priority_active.store(false, Ordering::SeqCst);
        drop(guard);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    background.await.unwrap();
    assert!(
        !overlap.load(Ordering::SeqCst),
        "a background slice ran concurrently with a priority task"
    );
}
