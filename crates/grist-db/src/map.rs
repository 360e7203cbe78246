//! The in-memory status map: `Id -> (Key, Status)` plus the intern table,
//! guarded as one unit by the database mutex in [`crate::database`].

use grist_error::SharedError;
use grist_types::{BuildResult, Id, Key, Status, Step};
use tracing::debug;

use crate::intern::Intern;
use crate::wait::{Continuation, Pending};

/// The scheduler's view of one key's status.
pub(crate) type KeyStatus = Status<Pending>;

#[derive(Debug)]
struct Entry {
    key: Key,
    status: KeyStatus,
}

/// Everything the database mutex protects.
pub(crate) struct Core {
    /// Constant for the lifetime of the process; `built` of every result
    /// produced this run.
    pub(crate) step: Step,
    intern: Intern,
    entries: Vec<Entry>,
}

impl Core {
    pub(crate) fn new(step: Step) -> Self {
        Self {
            step,
            intern: Intern::default(),
            entries: Vec::new(),
        }
    }

    /// Intern `key`, inserting a `Missing` placeholder on first mention.
    pub(crate) fn intern(&mut self, key: &Key) -> Id {
        let entries = &mut self.entries;
        self.intern.intern(key, |id| {
            debug_assert_eq!(id.index(), entries.len());
            entries.push(Entry {
                key: key.clone(),
                status: Status::Missing,
            });
        })
    }

    /// Insert a key restored from the journal; ids arrive dense and in order.
    pub(crate) fn insert_loaded(&mut self, id: Id, key: Key, result: Option<BuildResult>) {
        let interned = self.intern(&key);
        debug_assert_eq!(interned, id, "journal entries arrive in dense id order");
        self.entries[id.index()].status = match result {
            Some(result) => Status::Loaded(result),
            None => Status::Missing,
        };
    }

    pub(crate) fn key(&self, id: Id) -> &Key {
        &self.entries[id.index()].key
    }

    pub(crate) fn lookup(&self, key: &Key) -> Option<Id> {
        self.intern.get(key)
    }

    pub(crate) fn status(&self, id: Id) -> &KeyStatus {
        &self.entries[id.index()].status
    }

    pub(crate) fn set_status(&mut self, id: Id, status: KeyStatus) {
        self.entries[id.index()].status = status;
    }

    /// Make `id` waiting, preserving any prior result and any continuations
    /// already registered. Idempotent on an already-waiting id.
    pub(crate) fn ensure_waiting(&mut self, id: Id, prior: Option<BuildResult>) {
        let entry = &mut self.entries[id.index()];
        match std::mem::replace(&mut entry.status, Status::Missing) {
            Status::Waiting(pending, existing) => {
                entry.status = Status::Waiting(pending, existing.or(prior));
            }
            Status::Loaded(r) => {
                entry.status = Status::Waiting(Pending::default(), prior.or(Some(r)));
            }
            Status::Missing => {
                entry.status = Status::Waiting(Pending::default(), prior);
            }
            terminal => {
                // Ready/Error never regress within a run.
                entry.status = terminal;
            }
        }
    }

    /// Register `action` to fire when the waiting `id` terminalizes.
    pub(crate) fn after_waiting(&mut self, id: Id, action: Continuation) {
        match &mut self.entries[id.index()].status {
            Status::Waiting(pending, _) => pending.after(action),
            other => {
                // The contract is "call on a Waiting id under the lock";
                // anything else is a scheduler bug.
                unreachable!("after_waiting on {} status for {}", other.kind(), id)
            }
        }
    }

    /// Commit a terminal status and drain the old waiting list, firing each
    /// continuation in registration order under the still-held lock.
    pub(crate) fn terminalize(&mut self, id: Id, status: KeyStatus) {
        debug_assert!(
            matches!(status, Status::Ready(_) | Status::Error(_)),
            "terminalize takes a terminal status"
        );
        let entry = &mut self.entries[id.index()];
        let old = std::mem::replace(&mut entry.status, status);
        let actions = match old {
            Status::Waiting(mut pending, _) => {
                let actions = pending.take();
                debug!(
                    id = %id,
                    continuations = actions.len(),
                    status = self.entries[id.index()].status.kind(),
                    "id terminalized"
                );
                actions
            }
            _ => Vec::new(),
        };
        for action in actions {
            action(self);
        }
    }

    /// Shared error of `id`, if it failed.
    pub(crate) fn error(&self, id: Id) -> Option<SharedError> {
        match self.status(id) {
            Status::Error(e) => Some(std::sync::Arc::clone(e)),
            _ => None,
        }
    }

    /// Result of `id`, if its status carries one.
    pub(crate) fn result(&self, id: Id) -> Option<&BuildResult> {
        self.status(id).result()
    }

    /// Iterate `(id, key, status)` over the whole map.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Id, &Key, &KeyStatus)> {
        self.entries.iter().enumerate().map(|(index, entry)| {
            (
                Id::new(u32::try_from(index).expect("id space fits u32")),
                &entry.key,
                &entry.status,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grist_types::{TypeTag, Value};

    fn key(payload: &str) -> Key {
        Key::new(TypeTag::new(1), payload.as_bytes().to_vec(), payload)
    }

    fn result(step: u32) -> BuildResult {
        BuildResult {
            value: Value::new(TypeTag::new(1), b"v".to_vec()),
            built: Step::new(step),
            changed: Step::new(step),
            depends: Vec::new(),
            execution: 0.0,
            traces: Vec::new(),
        }
    }

    #[test]
    fn intern_inserts_missing_placeholder() {
        let mut core = Core::new(Step::new(1));
        let id = core.intern(&key("a"));
        assert!(matches!(core.status(id), Status::Missing));
        assert_eq!(core.intern(&key("a")), id);
        assert_eq!(core.iter().count(), 1);
    }

    #[test]
    fn terminalize_fires_continuations_in_order() {
        let mut core = Core::new(Step::new(1));
        let id = core.intern(&key("a"));
        core.ensure_waiting(id, None);

        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        for n in 0..3 {
            let log = std::sync::Arc::clone(&log);
            core.after_waiting(id, Box::new(move |_| log.lock().push(n)));
        }
        core.terminalize(id, Status::Ready(result(1)));
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(core.status(id).is_ready());
    }

    #[test]
    fn waiting_replacement_preserves_prior_result() {
        let mut core = Core::new(Step::new(2));
        let id = core.intern(&key("a"));
        core.set_status(id, Status::Loaded(result(1)));
        core.ensure_waiting(id, None);
        assert!(core.status(id).result().is_some(), "prior survives Loaded -> Waiting");
        core.ensure_waiting(id, None);
        assert!(core.status(id).result().is_some(), "prior survives Waiting -> Waiting");
    }

    #[test]
    fn continuation_can_mutate_other_ids() {
        let mut core = Core::new(Step::new(1));
        let a = core.intern(&key("a"));
        let b = core.intern(&key("b"));
        core.ensure_waiting(a, None);
        core.ensure_waiting(b, None);
        // a's completion terminalizes b, the shape check's chaining takes.
        core.after_waiting(
            a,
            Box::new(move |core| core.terminalize(b, Status::Ready(result(1)))),
        );
        core.terminalize(a, Status::Ready(result(1)));
        assert!(core.status(b).is_ready());
    }
}
