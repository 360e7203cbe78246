//! Append-only persistence for the build database.
//!
//! The journal is the crash-safety story: every key that finishes a run is
//! appended as a whole checksummed record, and the next process replays the
//! file to reconstruct its status map. A torn tail (crash mid-append) is
//! discarded at the first invalid record; everything before it is kept.
//!
//! Opening the journal also compacts it: surviving entries are renumbered
//! densely, re-encoded against the current witness table, and rewritten to a
//! fresh file that atomically replaces the old one. Compaction is where
//! cross-process id and tag remapping happens, so the in-memory layer only
//! ever sees dense ids in the current process's tag space.

pub mod format;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use grist_error::{GristError, Result};
use grist_types::{BuildResult, Id, Key, Step, TypeTag, WitnessTable};
use tracing::{debug, warn};

use crate::format::{
    FramedRecord, PersistedStatus, check_header, decode_entry, decode_witness_names, encode_entry,
    encode_header, encode_witness_names, frame_record, next_record,
};

#[inline]
fn log_replay_decision(replay_cursor: &'static str, record_no: usize, decision_reason: &'static str) {
    debug!(replay_cursor, record_no, decision_reason, "journal replay decision");
}

/// One entry reconstructed from the journal, already renumbered into the
/// dense id space of this process.
#[derive(Debug)]
pub struct LoadedEntry {
    pub id: Id,
    pub key: Key,
    /// `Some` for `Loaded` records, `None` for `Missing` ones.
    pub result: Option<BuildResult>,
}

/// Outcome of [`Journal::open`].
#[derive(Debug)]
pub struct OpenedJournal {
    pub journal: Journal,
    /// This run's step, already bumped past the previous run's and
    /// persisted in the compacted file under the step key, with id
    /// `entries.len()`.
    pub step: Step,
    /// Surviving entries in dense id order: `entries[n].id == n`.
    pub entries: Vec<LoadedEntry>,
}

/// An open journal file positioned for appends.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Open (or create) the journal at `path`: replay the old file, compact
    /// it against `witness`, and leave the handle positioned for appends.
    ///
    /// A journal whose header is unusable is abandoned with a warning and
    /// rebuilt from scratch; losing the cache only costs a full rebuild.
    pub fn open(path: &Path, witness: &WitnessTable) -> Result<OpenedJournal> {
        let replayed = match replay_file(path, witness) {
            Ok(replayed) => replayed,
            Err(GristError::JournalCorrupt { detail }) => {
                warn!(path = %path.display(), detail, "journal unusable, rebuilding from scratch");
                Replayed::default()
            }
            Err(other) => return Err(other),
        };

        let (entries, prior_step) = (replayed.entries, replayed.prior_step);
        let step = prior_step.bump();

        // Compact: rewrite the surviving entries, plus the bumped step
        // record, to a temporary file and atomically swap it in. A crash
        // during compaction leaves the old journal intact; a crash right
        // after it still finds the new step on disk.
        let tmp_path = path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&encode_header())?;
        tmp.write_all(&frame_record(&encode_witness_names(witness.names())))?;
        for entry in &entries {
            let status = match &entry.result {
                Some(result) => PersistedStatus::Loaded(result),
                None => PersistedStatus::Missing,
            };
            tmp.write_all(&frame_record(&encode_entry(entry.id, &entry.key, status)))?;
        }
        let step_id = Id::new(u32::try_from(entries.len()).expect("id space fits u32"));
        let step_result = witness.step_result(step);
        tmp.write_all(&frame_record(&encode_entry(
            step_id,
            &witness.step_key(),
            PersistedStatus::Loaded(&step_result),
        )))?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, path)?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|_| GristError::CannotOpen {
                path: path.to_path_buf(),
            })?;

        debug!(
            path = %path.display(),
            entries = entries.len(),
            step = %step,
            "journal opened"
        );

        Ok(OpenedJournal {
            journal: Self {
                file,
                path: path.to_path_buf(),
            },
            step,
            entries,
        })
    }

    /// Append one `(id, key, status)` record and flush it to the OS.
    ///
    /// Callers hold no engine lock here; the journal serializes appends
    /// through its own exclusive reference.
    pub fn append(&mut self, id: Id, key: &Key, status: PersistedStatus<'_>) -> Result<()> {
        self.file
            .write_all(&frame_record(&encode_entry(id, key, status)))?;
        self.file.flush()?;
        Ok(())
    }

    /// Durably sync all appended records to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// The path this journal lives at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Default)]
struct Replayed {
    entries: Vec<LoadedEntry>,
    prior_step: Step,
}

/// Replay `path` into dense, tag-remapped entries.
///
/// Id remapping, unknown-witness drops, dangling-dependency drops, and step
/// extraction all happen here, in the file's id space, before renumbering.
fn replay_file(path: &Path, witness: &WitnessTable) -> Result<Replayed> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Replayed::default()),
        Err(err) => return Err(err.into()),
    };
    check_header(&bytes)?;

    let mut cursor = format::JOURNAL_HEADER_SIZE;
    let mut record_no = 0usize;

    // The first record is the witness table of the writing process; map its
    // file-local tag indices onto this process's registrations by name.
    let tag_map: Vec<Option<TypeTag>> = match next_record(&bytes, &mut cursor) {
        Some(FramedRecord::Complete(payload)) => decode_witness_names(payload)?
            .iter()
            .map(|name| {
                let tag = witness.tag_of(name);
                if tag.is_none() {
                    warn!(name, "type no longer registered, dropping its records");
                }
                tag
            })
            .collect(),
        Some(FramedRecord::Torn(reason)) => {
            log_replay_decision("witness", 0, reason);
            return Ok(Replayed::default());
        }
        None => return Ok(Replayed::default()),
    };

    // Later records for the same id supersede earlier ones; first-seen
    // order is kept so renumbering is deterministic.
    let mut order: Vec<u32> = Vec::new();
    let mut by_id: HashMap<u32, (Key, Option<format::RawResult>, Option<TypeTag>)> = HashMap::new();

    while let Some(framed) = next_record(&bytes, &mut cursor) {
        record_no += 1;
        let payload = match framed {
            FramedRecord::Complete(payload) => payload,
            FramedRecord::Torn(reason) => {
                log_replay_decision("entries", record_no, reason);
                break;
            }
        };
        let raw = decode_entry(payload)?;
        let Some(key_tag) = tag_map.get(raw.key_tag as usize).copied().flatten() else {
            log_replay_decision("entries", record_no, "unknown_key_witness_drop");
            continue;
        };
        let value_tag = match &raw.result {
            Some(result) => match tag_map.get(result.value_tag as usize).copied().flatten() {
                Some(tag) => Some(tag),
                None => {
                    log_replay_decision("entries", record_no, "unknown_value_witness_drop");
                    continue;
                }
            },
            None => None,
        };
        let key = Key::new(key_tag, raw.key_payload, raw.key_display);
        if by_id.insert(raw.id, (key, raw.result, value_tag)).is_none() {
            order.push(raw.id);
        } else {
            log_replay_decision("entries", record_no, "superseded_earlier_record");
        }
    }

    // Extract the step entry; it is bookkeeping, not a user key.
    let step_tag = witness.step_tag();
    let mut prior_step = Step::ZERO;
    order.retain(|old_id| {
        let (key, result, _) = &by_id[old_id];
        if key.tag() != step_tag {
            return true;
        }
        if let Some(raw) = result {
            if let Ok(bytes) = <[u8; 4]>::try_from(raw.value_payload.as_slice()) {
                prior_step = prior_step.max(Step::new(u32::from_le_bytes(bytes)));
            }
        }
        by_id.remove(old_id);
        false
    });

    // An entry whose dependency record was dropped cannot be validated, so
    // drop it too, transitively, until the survivor set is closed.
    loop {
        let surviving: std::collections::HashSet<u32> = order.iter().copied().collect();
        let before = order.len();
        order.retain(|old_id| {
            let dangling = by_id[old_id].1.as_ref().is_some_and(|raw| {
                raw.depends
                    .iter()
                    .flatten()
                    .any(|dep| !surviving.contains(dep))
            });
            if dangling {
                log_replay_decision("closure", *old_id as usize, "dangling_dependency_drop");
                by_id.remove(old_id);
            }
            !dangling
        });
        if order.len() == before {
            break;
        }
    }

    // Renumber densely in first-seen order.
    let renumber: HashMap<u32, Id> = order
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, Id::new(u32::try_from(new).expect("id space fits u32"))))
        .collect();

    let entries = order
        .iter()
        .map(|old_id| {
            let (key, raw_result, value_tag) = by_id.remove(old_id).expect("entry survives");
            LoadedEntry {
                id: renumber[old_id],
                key,
                result: raw_result.map(|raw| {
                    let tag = value_tag.expect("loaded entries carry a value tag");
                    raw.into_result(tag, |old| renumber[&old])
                }),
            }
        })
        .collect();

    Ok(Replayed {
        entries,
        prior_step,
    })
}
