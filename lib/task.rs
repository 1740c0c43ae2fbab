//! Arbitration between user-visible work and bulk background work.
//!
//! Foreground reads must never wait behind prefetching. Two counters back
//! that guarantee: starting a priority task is non-blocking and immediately
//! signals cancellation to running background tasks; a background task only
//! begins once no priority work is in flight and a quiet window has elapsed
//! since the last one finished.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore, watch};

/// Default window of inactivity required before background work resumes.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(5);

/// Default bound on concurrently running background tasks.
pub const DEFAULT_MAX_BACKGROUND: usize = 2;

#[derive(Debug)]
struct State {
    priority_in_flight: usize,
    last_priority_done: Option<Instant>,
}

/// The arbiter. Shared behind an `Arc` by everything that issues reads.
#[derive(Debug)]
pub struct BackgroundTaskManager {
    quiet_window: Duration,
    state: Mutex<State>,
    idle: Notify,
    background_slots: Semaphore,
    /// Bumped whenever a priority task begins; running background tasks
    /// compare generations to observe cancellation.
    cancel_generation: watch::Sender<u64>,
}

impl BackgroundTaskManager {
    #[must_use]
    pub fn new(max_background: usize, quiet_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            quiet_window,
            state: Mutex::new(State {
                priority_in_flight: 0,
                last_priority_done: None,
            }),
            idle: Notify::new(),
            background_slots: Semaphore::new(max_background.max(1)),
            cancel_generation: watch::Sender::new(0),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a priority task. Never blocks. Running background tasks see
    /// their cancellation token trip before this returns.
    pub fn priority(self: &Arc<Self>) -> PriorityGuard {
        {
            // The generation bump happens under the state lock so that a
            // background task deciding to run (which reads both under the
            // same lock) can never miss a priority task that begins
            // concurrently.
            let mut state = self.lock_state();
            state.priority_in_flight += 1;
            self.cancel_generation.send_modify(|generation| *generation += 1);
        }
        PriorityGuard {
            manager: Arc::clone(self),
        }
    }

    /// Run `task` once the arbiter is quiet: no priority work in flight, the
    /// quiet window elapsed since the last one finished, and a background
    /// slot free. The task receives a token that trips as soon as any
    /// priority task starts or `timeout` expires, and must observe it at its
    /// I/O boundaries.
    pub async fn invoke_background<T, F, Fut>(&self, timeout: Duration, task: F) -> T
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = match self.background_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("background slot semaphore is never closed"),
        };

        let started_at = loop {
            // Register interest before checking state so a notification
            // between the check and the await cannot be lost.
            let notified = self.idle.notified();
            // Ok(generation) means runnable; the generation is read under
            // the same lock as the idleness check so a concurrent priority
            // start is guaranteed to trip the token.
            let decision: Result<u64, Option<Duration>> = {
                let state = self.lock_state();
                if state.priority_in_flight > 0 {
                    Err(None)
                } else {
                    match state.last_priority_done {
                        None => Ok(*self.cancel_generation.borrow()),
                        Some(done) => {
                            let elapsed = done.elapsed();
                            if elapsed >= self.quiet_window {
                                Ok(*self.cancel_generation.borrow())
                            } else {
                                Err(Some(self.quiet_window - elapsed))
                            }
                        }
                    }
                }
            };
            match decision {
                Ok(generation) => break generation,
                Err(None) => notified.await,
                Err(Some(remaining)) => {
                    let _ = tokio::time::timeout(remaining, notified).await;
                }
            }
        };

        let token = CancelToken {
            generations: self.cancel_generation.subscribe(),
            started_at,
            deadline: Instant::now() + timeout,
        };
        task(token).await
    }
}

/// RAII handle for a priority task; finishing is signalled on drop.
#[derive(Debug)]
pub struct PriorityGuard {
    manager: Arc<BackgroundTaskManager>,
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        {
            let mut state = self.manager.lock_state();
            state.priority_in_flight = state.priority_in_flight.saturating_sub(1);
            state.last_priority_done = Some(Instant::now());
        }
        self.manager.idle.notify_waiters();
    }
}

/// Cooperative cancellation handle given to background tasks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    generations: watch::Receiver<u64>,
    started_at: u64,
    deadline: Instant,
}

impl CancelToken {
    /// True once any priority task has started since this background slice
    /// began, or the slice's timeout has expired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.generations.borrow() != self.started_at || Instant::now() >= self.deadline
    }
}
