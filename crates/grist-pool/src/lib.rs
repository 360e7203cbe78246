//! Bounded worker pool for build tasks.
//!
//! The pool runs queued jobs on at most `capacity` threads, with one twist
//! the scheduler depends on: a worker about to block on something outside
//! the pool (a dependency barrier) calls [`Pool::blocking`], which lends its
//! concurrency slot to a replacement worker for the duration. Without that,
//! a build where every worker waits on its own dependencies deadlocks with
//! all slots occupied by blocked threads.
//!
//! Panics inside jobs are captured and surfaced once, at [`Pool::drain`];
//! rules report expected failures through their own result channel, so a
//! panic here is always a bug worth stopping the build for.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job panicked; carries the panic payload rendered as text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("worker panicked: {message}")]
pub struct PoolPanic {
    pub message: String,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    /// Threads currently alive, idle or running.
    workers: usize,
    /// Threads currently executing a job.
    running: usize,
    /// Concurrency credits lent out by [`Pool::blocking`] callers.
    blocked: usize,
    shutdown: bool,
    first_panic: Option<PoolPanic>,
    handles: Vec<JoinHandle<()>>,
}

struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
    /// Wakes idle workers when jobs arrive or the shape of the pool changes.
    work_cv: Condvar,
    /// Wakes [`Pool::drain`] when the pool goes quiet.
    idle_cv: Condvar,
}

impl PoolShared {
    fn effective_capacity(&self, state: &PoolState) -> usize {
        self.capacity + state.blocked
    }
}

/// A bounded FIFO worker pool.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool running at most `capacity` jobs concurrently.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pool needs at least one worker");
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                state: Mutex::new(PoolState::default()),
                work_cv: Condvar::new(),
                idle_cv: Condvar::new(),
            }),
        }
    }

    /// The configured concurrency bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Queue a job. Spawns a worker thread if none is idle and the
    /// effective capacity allows another.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        assert!(!state.shutdown, "spawn on a shut-down pool");
        state.queue.push_back(Box::new(job));
        self.ensure_worker(&mut state);
        drop(state);
        self.shared.work_cv.notify_one();
    }

    /// Run `f` on the calling thread while lending this caller's
    /// concurrency slot back to the pool.
    ///
    /// Must wrap any wait on state produced by other pool jobs. The pool
    /// may admit a replacement worker while `f` runs.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.shared.state.lock();
            state.blocked += 1;
            self.ensure_worker(&mut state);
            drop(state);
            self.shared.work_cv.notify_one();
        }
        let result = f();
        {
            let mut state = self.shared.state.lock();
            state.blocked -= 1;
            // Surplus idle workers notice the shrunk capacity and retire.
            drop(state);
            self.shared.work_cv.notify_all();
        }
        result
    }

    /// Block until the queue is empty and no job is running, then report
    /// the first captured panic, if any.
    pub fn drain(&self) -> Result<(), PoolPanic> {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.running > 0 {
            self.shared.idle_cv.wait(&mut state);
        }
        match &state.first_panic {
            Some(panic) => Err(panic.clone()),
            None => Ok(()),
        }
    }

    fn ensure_worker(&self, state: &mut PoolState) {
        let idle = state.workers - state.running;
        if state.queue.len() > idle && state.workers < self.shared.effective_capacity(state) {
            state.workers += 1;
            let shared = Arc::clone(&self.shared);
            let worker_no = state.workers;
            let handle = std::thread::Builder::new()
                .name(format!("grist-pool-{worker_no}"))
                .spawn(move || worker_loop(&shared))
                .expect("worker thread spawns");
            state.handles.push(handle);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let handles = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.handles)
        };
        self.shared.work_cv.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = shared.state.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            state.running += 1;
            drop(state);
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            state = shared.state.lock();
            state.running -= 1;
            if let Err(payload) = outcome {
                let message = panic_message(&payload);
                debug!(message, "captured worker panic");
                state.first_panic.get_or_insert(PoolPanic { message });
            }
            if state.queue.is_empty() && state.running == 0 {
                shared.idle_cv.notify_all();
            }
            continue;
        }
        if state.shutdown {
            state.workers -= 1;
            return;
        }
        if state.workers > shared.effective_capacity(&state) {
            // A blocking credit was returned while we sat idle; retire.
            state.workers -= 1;
            return;
        }
        shared.work_cv.wait(&mut state);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(inner) = payload.downcast_ref::<Box<dyn std::any::Any + Send>>() {
        return panic_message(inner.as_ref());
    }
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
