//! The incremental build database and scheduler.
//!
//! This crate is the memoization engine of a dependency-directed build
//! system: it interns opaque keys, persists their results across runs
//! through `grist-journal`, decides per key whether to reuse, recheck, or
//! re-execute, and coordinates concurrent evaluation over a `grist-pool`
//! worker pool under a single database mutex.
//!
//! The flow: [`with_database`] replays the journal and hands the body a
//! [`Database`]; [`build`] demands keys on behalf of a [`Stack`]; rules run
//! as pool tasks and demand their own dependencies re-entrantly through
//! [`RuleContext::build`]. After the run, [`Database::check_valid`] audits
//! the results, [`Database::progress`] and [`Database::show_json`] report.

mod database;
mod dump;
mod intern;
mod lint;
mod map;
mod order;
mod progress;
mod scheduler;
mod stack;
mod wait;

pub use database::{Database, DatabaseOptions, with_database};
pub use progress::Progress;
pub use scheduler::{BuildOps, BuildOutcome, RuleContext, RuleOutput, build};
pub use stack::Stack;
