//! Database lifecycle: open, replay, step bump, scoped teardown.

use std::path::PathBuf;
use std::sync::Arc;

use grist_error::Result;
use grist_journal::Journal;
use grist_journal::format::PersistedStatus;
use grist_types::{Assume, BuildResult, Id, Key, Status, Step, TypeTag, WitnessTable};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::map::Core;
use crate::progress::Progress;
use crate::scheduler::BuildOps;

/// How to open a build database.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Path of the journal file.
    pub journal_path: PathBuf,
    /// Validity override; `None` runs the full check.
    pub assume: Option<Assume>,
}

impl DatabaseOptions {
    pub fn new(journal_path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: journal_path.into(),
            assume: None,
        }
    }

    #[must_use]
    pub fn with_assume(mut self, assume: Assume) -> Self {
        self.assume = Some(assume);
        self
    }
}

pub(crate) struct DatabaseInner {
    core: Mutex<Core>,
    journal: Mutex<Journal>,
    witness: WitnessTable,
    assume: Option<Assume>,
    step: Step,
}

/// Shared handle to an open build database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// The step of this run.
    #[must_use]
    pub fn step(&self) -> Step {
        self.inner.step
    }

    /// Snapshot of running counts over the status map.
    #[must_use]
    pub fn progress(&self) -> Progress {
        crate::progress::progress(&self.lock_core())
    }

    /// The memoized result for `key`, if its current status carries one.
    #[must_use]
    pub fn result(&self, key: &Key) -> Option<BuildResult> {
        let core = self.lock_core();
        let id = core.lookup(key)?;
        core.status(id).result().cloned()
    }

    /// JSON dump of every result in dependency order.
    pub fn show_json(&self) -> Result<String> {
        crate::dump::show_json(self)
    }

    /// Post-run audit that stored values still match built results.
    pub fn check_valid(&self, ops: &dyn BuildOps) -> Result<()> {
        crate::lint::check_valid(self, ops)
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock()
    }

    pub(crate) fn assume(&self) -> Option<Assume> {
        self.inner.assume
    }

    pub(crate) fn witness(&self) -> &WitnessTable {
        &self.inner.witness
    }

    pub(crate) fn type_name(&self, tag: TypeTag) -> String {
        self.inner
            .witness
            .name_of(tag)
            .unwrap_or("<unregistered>")
            .to_owned()
    }

    /// Append one record outside the database lock. An append failure costs
    /// only incrementality on the next run, so it is reported, not raised.
    pub(crate) fn journal_append(&self, id: Id, key: &Key, status: PersistedStatus<'_>) {
        if let Err(error) = self.inner.journal.lock().append(id, key, status) {
            warn!(id = %id, key = %key, %error, "journal append failed");
        }
    }
}

/// Open the database at `options.journal_path`, replay and compact the
/// journal, bump and journal the step, run `body`, and release everything
/// on all exit paths.
///
/// `witness` must already carry every type the run will mention; journaled
/// records of unregistered types are dropped during replay.
pub fn with_database<R>(
    options: &DatabaseOptions,
    witness: WitnessTable,
    body: impl FnOnce(&Database) -> Result<R>,
) -> Result<R> {
    let opened = Journal::open(&options.journal_path, &witness)?;
    let step = opened.step;
    debug!(step = %step, loaded = opened.entries.len(), "database opened");

    let mut core = Core::new(step);
    for entry in opened.entries {
        core.insert_loaded(entry.id, entry.key, entry.result);
    }

    // The step lives in the map as an ordinary loaded entry under a
    // constant key; its value carries the counter the next process bumps.
    // The journal already persisted it during compaction under the id the
    // intern table hands out here.
    let step_id = core.intern(&witness.step_key());
    core.set_status(step_id, Status::Loaded(witness.step_result(step)));

    let db = Database {
        inner: Arc::new(DatabaseInner {
            core: Mutex::new(core),
            journal: Mutex::new(opened.journal),
            witness,
            assume: options.assume,
            step,
        }),
    };

    let outcome = body(&db);

    // Make appended records durable whether or not the body succeeded; the
    // file handle itself closes when the last database clone drops.
    if let Err(error) = db.inner.journal.lock().sync() {
        warn!(%error, "journal sync failed on close");
    }
    outcome
}
