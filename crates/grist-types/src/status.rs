use grist_error::SharedError;

use crate::BuildResult;

/// Lifecycle of one interned key within a run.
///
/// Generic over `W`, the waiting payload, so the scheduler can hang its
/// continuation list off the `Waiting` variant without this crate knowing
/// what a continuation is. Only `Missing` and `Loaded` are ever persisted.
#[derive(Debug)]
pub enum Status<W> {
    /// Interned but never built or loaded; a placeholder.
    Missing,
    /// Restored from the journal this process; not yet validated.
    Loaded(BuildResult),
    /// Being validated or executed. Holds the prior result, if any, so
    /// progress estimates and reports can still see it.
    Waiting(W, Option<BuildResult>),
    /// Produced this step; terminal for the run.
    Ready(BuildResult),
    /// Execution failed; terminal for the run.
    Error(SharedError),
}

impl<W> Status<W> {
    /// The result carried by this status, if any.
    #[must_use]
    pub fn result(&self) -> Option<&BuildResult> {
        match self {
            Self::Loaded(r) | Self::Ready(r) | Self::Waiting(_, Some(r)) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting(..))
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Short name for decision-reason logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Loaded(_) => "loaded",
            Self::Waiting(..) => "waiting",
            Self::Ready(_) => "ready",
            Self::Error(_) => "error",
        }
    }
}

/// A user directive overriding the default validity decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assume {
    /// Prior values are never trusted; always re-execute.
    Dirty,
    /// Prior values are trusted without consulting `stored`.
    Skip,
    /// Prior values are trusted; if `stored` has a value use it as the
    /// current one, otherwise re-execute.
    Clean,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Step, TypeTag, Value};

    fn result() -> BuildResult {
        BuildResult {
            value: Value::new(TypeTag::new(0), b"v".to_vec()),
            built: Step::new(1),
            changed: Step::new(1),
            depends: Vec::new(),
            execution: 0.0,
            traces: Vec::new(),
        }
    }

    #[test]
    fn result_accessor_sees_waiting_prior() {
        let s: Status<()> = Status::Waiting((), Some(result()));
        assert!(s.result().is_some());
        let s: Status<()> = Status::Waiting((), None);
        assert!(s.result().is_none());
        let s: Status<()> = Status::Missing;
        assert!(s.result().is_none());
    }

    #[test]
    fn kind_names() {
        assert_eq!(Status::<()>::Missing.kind(), "missing");
        assert_eq!(Status::<()>::Ready(result()).kind(), "ready");
    }
}
