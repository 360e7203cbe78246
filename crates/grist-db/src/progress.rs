//! Running counts folded from the status map.

use grist_types::Status;
use serde::Serialize;

use crate::map::Core;

/// A snapshot of how far the run has come, suitable for progress UIs.
///
/// `time_todo` only sums the executions of outstanding keys whose prior
/// result is known; `unknown_todo` counts the rest, whose cost cannot be
/// estimated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Progress {
    /// Executed this step.
    pub count_built: usize,
    /// Validated and reused from an earlier step.
    pub count_skipped: usize,
    /// Loaded but not yet demanded, plus outstanding keys of unknown cost.
    pub count_unknown: usize,
    /// Currently being validated or executed.
    pub count_todo: usize,
    pub time_built: f64,
    pub time_skipped: f64,
    pub time_unknown: f64,
    /// Estimated seconds of outstanding work, from prior executions.
    pub time_todo: f64,
    /// Outstanding keys with no prior execution to estimate from.
    pub unknown_todo: usize,
}

pub(crate) fn progress(core: &Core) -> Progress {
    let step = core.step;
    let mut snapshot = Progress::default();
    for (_, _, status) in core.iter() {
        match status {
            Status::Ready(result) if result.built == step => {
                snapshot.count_built += 1;
                snapshot.time_built += result.execution;
            }
            Status::Ready(result) => {
                snapshot.count_skipped += 1;
                snapshot.time_skipped += result.execution;
            }
            Status::Loaded(result) => {
                snapshot.count_unknown += 1;
                snapshot.time_unknown += result.execution;
            }
            Status::Waiting(_, prior) => {
                snapshot.count_todo += 1;
                match prior {
                    Some(result) => snapshot.time_todo += result.execution,
                    None => snapshot.unknown_todo += 1,
                }
            }
            // Missing and Error fall through uncounted.
            _ => {}
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::Pending;
    use grist_types::{BuildResult, Key, Step, TypeTag, Value};

    fn key(name: &str) -> Key {
        Key::new(TypeTag::new(1), name.as_bytes().to_vec(), name)
    }

    fn result(built: u32, execution: f64) -> BuildResult {
        BuildResult {
            value: Value::new(TypeTag::new(1), b"v".to_vec()),
            built: Step::new(built),
            changed: Step::new(built),
            depends: Vec::new(),
            execution,
            traces: Vec::new(),
        }
    }

    #[test]
    fn fold_partitions_the_map() {
        let mut core = Core::new(Step::new(2));
        let fresh = core.intern(&key("fresh"));
        core.set_status(fresh, Status::Ready(result(2, 1.0)));
        let reused = core.intern(&key("reused"));
        core.set_status(reused, Status::Ready(result(1, 2.0)));
        let loaded = core.intern(&key("loaded"));
        core.set_status(loaded, Status::Loaded(result(1, 4.0)));
        let estimated = core.intern(&key("estimated"));
        core.set_status(
            estimated,
            Status::Waiting(Pending::default(), Some(result(1, 8.0))),
        );
        let unestimated = core.intern(&key("unestimated"));
        core.set_status(unestimated, Status::Waiting(Pending::default(), None));
        core.intern(&key("placeholder")); // stays Missing, uncounted

        let snapshot = progress(&core);
        assert_eq!(snapshot.count_built, 1);
        assert_eq!(snapshot.count_skipped, 1);
        assert_eq!(snapshot.count_unknown, 1);
        assert_eq!(snapshot.count_todo, 2);
        assert!((snapshot.time_built - 1.0).abs() < 1e-9);
        assert!((snapshot.time_skipped - 2.0).abs() < 1e-9);
        assert!((snapshot.time_unknown - 4.0).abs() < 1e-9);
        assert!((snapshot.time_todo - 8.0).abs() < 1e-9);
        assert_eq!(snapshot.unknown_todo, 1);
    }

    #[test]
    fn serializes_for_front_ends() {
        let json = serde_json::to_value(Progress::default()).unwrap();
        assert_eq!(json["count_built"], 0);
        assert_eq!(json["unknown_todo"], 0);
    }
}
