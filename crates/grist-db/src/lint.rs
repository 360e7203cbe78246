//! Post-run audit that stored values still match what was built.

use grist_error::{GristError, LintMismatch, Result};
use grist_types::{Key, Status, Value};
use tracing::debug;

use crate::database::Database;
use crate::scheduler::BuildOps;

/// Audit every `Ready` result against a fresh `stored` probe.
///
/// Runs after all rules finish, so the snapshot under the lock and the
/// probes outside it see the same world unless something external is
/// mutating outputs, which is exactly what this catches. Values the ops
/// mark always-rebuilds are exempt.
pub(crate) fn check_valid(db: &Database, ops: &dyn BuildOps) -> Result<()> {
    let audit: Vec<(Key, Value)> = {
        let core = db.lock_core();
        core.iter()
            .filter_map(|(_, key, status)| match status {
                Status::Ready(result) => Some((key.clone(), result.value.clone())),
                _ => None,
            })
            .collect()
    };

    let mut mismatches = Vec::new();
    for (key, value) in audit {
        if ops.always_rebuilds(&value) {
            continue;
        }
        let current = ops.stored(&key);
        if current.as_ref() != Some(&value) {
            mismatches.push(LintMismatch {
                key: key.display().to_owned(),
                old: value.to_string(),
                new: current.map_or_else(|| "<missing>".to_owned(), |v| v.to_string()),
            });
        }
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        debug!(mismatches = mismatches.len(), "lint check failed");
        Err(GristError::lint(mismatches))
    }
}
