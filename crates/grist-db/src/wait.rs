//! One-shot wait primitives fired under the database lock.
//!
//! A [`Pending`] is the continuation list hanging off a `Waiting` status:
//! callbacks append under the lock and drain exactly once, in registration
//! order, when the id terminalizes. [`wait_for`] builds the many-subjects
//! bookkeeping on top, and [`Barrier`] carries the final hand-off to a
//! thread blocked outside the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use grist_error::SharedError;
use grist_types::{Id, Value};
use parking_lot::{Condvar, Mutex};

use crate::map::Core;

/// A callback run under the database lock when a waiting id terminalizes.
pub(crate) type Continuation = Box<dyn FnOnce(&mut Core) + Send>;

/// The mutable continuation slot owned by a `Waiting` status.
#[derive(Default)]
pub(crate) struct Pending {
    actions: Vec<Continuation>,
}

impl Pending {
    /// Compose `action` after the actions already registered.
    pub(crate) fn after(&mut self, action: Continuation) {
        self.actions.push(action);
    }

    /// Take the registered actions for a single drain.
    pub(crate) fn take(&mut self) -> Vec<Continuation> {
        std::mem::take(&mut self.actions)
    }
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("actions", &self.actions.len()).finish()
    }
}

/// Observer invoked once per completed subject: `(core, is_last, id)`.
/// Returning `true` means "done, skip the remaining subjects".
pub(crate) type WaitObserver = Arc<dyn Fn(&mut Core, bool, Id) -> bool + Send + Sync>;

/// Register `observer` on every currently-waiting `subject`.
///
/// Remaining-count bookkeeping guarantees exactly one invocation sees
/// `is_last = true`, unless an earlier invocation returned `true` and
/// short-circuited the rest. Must be called under the database lock; every
/// subject must currently be `Waiting`.
pub(crate) fn wait_for(core: &mut Core, subjects: Vec<Id>, observer: WaitObserver) {
    debug_assert!(!subjects.is_empty(), "wait_for needs at least one subject");
    let remaining = Arc::new(AtomicUsize::new(subjects.len()));
    let done = Arc::new(AtomicBool::new(false));
    for subject in subjects {
        let observer = Arc::clone(&observer);
        let remaining = Arc::clone(&remaining);
        let done = Arc::clone(&done);
        core.after_waiting(
            subject,
            Box::new(move |core| {
                // Both flags are only ever touched under the database lock;
                // the atomics are for Send, not for synchronization.
                if done.load(Ordering::Relaxed) {
                    return;
                }
                let left = remaining.fetch_sub(1, Ordering::Relaxed) - 1;
                if observer(core, left == 0, subject) {
                    done.store(true, Ordering::Relaxed);
                }
            }),
        );
    }
}

/// What a finished multi-key build hands back to the blocked requester.
pub(crate) type BuildWaitOutcome = Result<Vec<Value>, SharedError>;

/// A one-shot hand-off from a continuation (under the lock) to a requester
/// blocked in the pool's external-blocking slot.
pub(crate) struct Barrier {
    slot: Mutex<Option<BuildWaitOutcome>>,
    cv: Condvar,
}

impl Barrier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Publish the outcome. Later signals lose; the first one wins, which
    /// is what the short-circuiting observer contract produces anyway.
    pub(crate) fn signal(&self, outcome: BuildWaitOutcome) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cv.notify_all();
        }
    }

    /// Block until signalled.
    pub(crate) fn wait(&self) -> BuildWaitOutcome {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            self.cv.wait(&mut slot);
        }
    }
}
