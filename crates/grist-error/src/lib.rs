use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for Grist build-database operations.
///
/// Structured variants for the scheduler-visible failure modes, ambient
/// variants for storage I/O. Errors that can be observed by more than one
/// requester are shared behind [`SharedError`] rather than cloned.
#[derive(Error, Debug)]
pub enum GristError {
    // === Scheduler errors ===
    /// A rule demanded a key that is already on the call stack.
    #[error("recursion detected building {key}")]
    RuleRecursion {
        /// Type name of the offending key.
        type_name: String,
        /// Display form of the offending key.
        key: String,
    },

    /// A rule's `execute` failed; carries the demand chain at the failure.
    #[error("rule failed for {key}: {cause}")]
    RuleExecution {
        /// Display form of the key whose rule failed.
        key: String,
        /// Display forms of the keys that demanded it, outermost first.
        stack: Vec<String>,
        #[source]
        cause: Box<GristError>,
    },

    /// The dependency-order emitter found a cycle at report time.
    #[error("dependency cycle involving {} key(s)", keys.len() + overflow)]
    DatabaseCyclic {
        /// Display forms of offending keys, at most [`CYCLIC_KEY_LIMIT`].
        keys: Vec<String>,
        /// How many further offenders were elided.
        overflow: usize,
    },

    /// Post-run audit found stored values diverging from built results.
    #[error("lint failed: {} stored value(s) changed after being built", mismatches.len())]
    LintFailure {
        /// One entry per diverging key.
        mismatches: Vec<LintMismatch>,
    },

    /// An internal invariant was violated (missing interned id, attempt to
    /// persist a transient status, and the like).
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    // === Rule-domain errors ===
    /// A rule-reported failure with a free-form message.
    #[error("{0}")]
    Failure(String),

    /// A failure first produced by another key and shared to this
    /// requester. Wrapping keeps the root cause reference-counted instead
    /// of cloned once per transitive demander.
    #[error("{0}")]
    Propagated(SharedError),

    // === Storage errors ===
    /// Journal file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal header or a non-tail record failed validation.
    #[error("journal is corrupt: {detail}")]
    JournalCorrupt { detail: String },

    /// The journal path could not be opened.
    #[error("unable to open journal: '{path}'")]
    CannotOpen { path: PathBuf },
}

/// Maximum offending keys named by a [`GristError::DatabaseCyclic`] error.
pub const CYCLIC_KEY_LIMIT: usize = 10;

/// One stored-value divergence reported by the validity checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintMismatch {
    /// Display form of the key.
    pub key: String,
    /// Display form of the value the rule produced.
    pub old: String,
    /// Display form of the value `stored` now reports.
    pub new: String,
}

/// A user-visible message as `(heading, rows, body)` so every presentation
/// layer renders errors the same way. Rows with a `None` value are omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredMessage {
    pub heading: String,
    pub rows: Vec<(String, Option<String>)>,
    pub body: String,
}

impl fmt::Display for StructuredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.heading)?;
        let width = self
            .rows
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.len())
            .max()
            .unwrap_or(0);
        for (name, value) in &self.rows {
            if let Some(value) = value {
                writeln!(f, "  {name:width$} {value}")?;
            }
        }
        if !self.body.is_empty() {
            write!(f, "{}", self.body)?;
        }
        Ok(())
    }
}

impl GristError {
    /// Create a recursion error for a key.
    pub fn recursion(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::RuleRecursion {
            type_name: type_name.into(),
            key: key.into(),
        }
    }

    /// Wrap a rule failure with its demand chain.
    pub fn execution(key: impl Into<String>, stack: Vec<String>, cause: GristError) -> Self {
        Self::RuleExecution {
            key: key.into(),
            stack,
            cause: Box::new(cause),
        }
    }

    /// Create a cycle error, clamping the named keys to [`CYCLIC_KEY_LIMIT`].
    pub fn cyclic(mut keys: Vec<String>) -> Self {
        let overflow = keys.len().saturating_sub(CYCLIC_KEY_LIMIT);
        keys.truncate(CYCLIC_KEY_LIMIT);
        Self::DatabaseCyclic { keys, overflow }
    }

    /// Create a lint error from the collected mismatches.
    pub fn lint(mismatches: Vec<LintMismatch>) -> Self {
        Self::LintFailure { mismatches }
    }

    /// Create an internal-invariant error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalInvariant(msg.into())
    }

    /// Create a rule-domain failure.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    /// Create a journal-corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::JournalCorrupt {
            detail: detail.into(),
        }
    }

    /// Whether this error indicates a bug in the engine rather than in the
    /// build being run.
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::InternalInvariant(_))
    }

    /// Render this error as a `(heading, rows, body)` message.
    pub fn structured(&self) -> StructuredMessage {
        match self {
            Self::RuleRecursion { type_name, key } => StructuredMessage {
                heading: "Build system error - recursion detected".to_owned(),
                rows: vec![
                    ("Key type:".to_owned(), Some(type_name.clone())),
                    ("Key:".to_owned(), Some(key.clone())),
                ],
                body: "Rules may not demand the key they are currently building.".to_owned(),
            },
            Self::RuleExecution { key, stack, cause } => StructuredMessage {
                heading: "Build system error - rule failed".to_owned(),
                rows: std::iter::once(("Key:".to_owned(), Some(key.clone())))
                    .chain(
                        stack
                            .iter()
                            .map(|k| ("Demanded by:".to_owned(), Some(k.clone()))),
                    )
                    .collect(),
                body: cause.to_string(),
            },
            Self::DatabaseCyclic { keys, overflow } => StructuredMessage {
                heading: "Build system error - dependency cycle".to_owned(),
                rows: keys
                    .iter()
                    .map(|k| ("Key:".to_owned(), Some(k.clone())))
                    .chain((*overflow > 0).then(|| {
                        ("And more:".to_owned(), Some(format!("{overflow} key(s) elided")))
                    }))
                    .collect(),
                body: "Each key above participates in a dependency cycle.".to_owned(),
            },
            Self::LintFailure { mismatches } => StructuredMessage {
                heading: "Lint checking error - values changed after being built".to_owned(),
                rows: mismatches
                    .iter()
                    .flat_map(|m| {
                        vec![
                            ("Key:".to_owned(), Some(m.key.clone())),
                            ("Old:".to_owned(), Some(m.old.clone())),
                            ("New:".to_owned(), Some(m.new.clone())),
                        ]
                    })
                    .collect(),
                body: String::new(),
            },
            Self::Propagated(inner) => inner.structured(),
            other => StructuredMessage {
                heading: "Build system error".to_owned(),
                rows: Vec::new(),
                body: other.to_string(),
            },
        }
    }
}

/// Result type alias using `GristError`.
pub type Result<T> = std::result::Result<T, GristError>;

/// A reference-counted error, used where one failure must be surfaced to
/// every transitive requester without cloning the underlying cause.
pub type SharedError = std::sync::Arc<GristError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_recursion() {
        let err = GristError::recursion("File", "File \"out.o\"");
        assert_eq!(err.to_string(), "recursion detected building File \"out.o\"");
    }

    #[test]
    fn error_display_execution_chains_cause() {
        let err = GristError::execution(
            "File \"out.o\"",
            vec!["File \"app\"".to_owned()],
            GristError::failure("compiler exited with code 1"),
        );
        assert_eq!(
            err.to_string(),
            "rule failed for File \"out.o\": compiler exited with code 1"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn cyclic_clamps_to_limit() {
        let keys: Vec<String> = (0..25).map(|i| format!("key{i}")).collect();
        let err = GristError::cyclic(keys);
        let GristError::DatabaseCyclic { keys, overflow } = &err else {
            panic!("expected DatabaseCyclic");
        };
        assert_eq!(keys.len(), CYCLIC_KEY_LIMIT);
        assert_eq!(*overflow, 15);
        assert_eq!(err.to_string(), "dependency cycle involving 25 key(s)");
    }

    #[test]
    fn structured_recursion_renders_rows() {
        let msg = GristError::recursion("File", "File \"a.c\"").structured();
        let text = msg.to_string();
        assert!(text.starts_with("Build system error - recursion detected:"));
        assert!(text.contains("Key type:"));
        assert!(text.contains("File \"a.c\""));
    }

    #[test]
    fn structured_omits_none_rows() {
        let msg = StructuredMessage {
            heading: "h".to_owned(),
            rows: vec![
                ("shown:".to_owned(), Some("v".to_owned())),
                ("hidden:".to_owned(), None),
            ],
            body: String::new(),
        };
        let text = msg.to_string();
        assert!(text.contains("shown:"));
        assert!(!text.contains("hidden:"));
    }

    #[test]
    fn structured_cyclic_reports_overflow() {
        let keys: Vec<String> = (0..12).map(|i| format!("key{i}")).collect();
        let msg = GristError::cyclic(keys).structured();
        assert!(msg.to_string().contains("2 key(s) elided"));
    }

    #[test]
    fn lint_counts_mismatches() {
        let err = GristError::lint(vec![
            LintMismatch {
                key: "File \"a\"".to_owned(),
                old: "1".to_owned(),
                new: "2".to_owned(),
            },
            LintMismatch {
                key: "File \"b\"".to_owned(),
                old: "x".to_owned(),
                new: "y".to_owned(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "lint failed: 2 stored value(s) changed after being built"
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "journal missing");
        let err: GristError = io_err.into();
        assert!(matches!(err, GristError::Io(_)));
    }

    #[test]
    fn propagated_renders_the_root_cause() {
        let root: SharedError =
            std::sync::Arc::new(GristError::failure("compiler exited with code 1"));
        let err = GristError::Propagated(std::sync::Arc::clone(&root));
        assert_eq!(err.to_string(), "compiler exited with code 1");
        assert_eq!(err.structured(), root.structured());
    }

    #[test]
    fn internal_flag() {
        assert!(GristError::internal("bad id").is_internal());
        assert!(!GristError::failure("rule says no").is_internal());
    }
}
