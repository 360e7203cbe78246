pub mod key;
pub mod result;
pub mod status;
pub mod witness;

pub use key::{Key, Value};
pub use result::{BuildResult, Depends, Trace};
pub use status::{Assume, Status};
pub use witness::{STEP_TYPE_NAME, WitnessTable};

use std::fmt;

/// A build step: one value per database open, monotonically increasing.
///
/// The step of the very first run is 1; [`Step::ZERO`] exists only as the
/// predecessor loaded from an empty journal.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Step(u32);

impl Step {
    /// The step before any run has happened.
    pub const ZERO: Self = Self(0);

    /// Create a step from its raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// The raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The next step. Saturates rather than wrapping; a journal that has
    /// survived four billion runs has earned a stuck counter.
    #[inline]
    #[must_use]
    pub const fn bump(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dense internal handle for a [`Key`], assigned by the intern table.
///
/// Stable within a process; remapped on load, so never persist an `Id`
/// across runs except inside the journal that defines the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Id(u32);

impl Id {
    /// Create an id from its raw index.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// The raw index value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The raw index as a `usize`, for dense-table addressing.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A dense tag identifying a registered key/value type.
///
/// Assigned by [`WitnessTable`] registration order, so only meaningful
/// within a process; the journal stores type names and remaps on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TypeTag(u32);

impl TypeTag {
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_bump_is_monotone() {
        assert_eq!(Step::ZERO.bump(), Step::new(1));
        assert_eq!(Step::new(41).bump(), Step::new(42));
        assert!(Step::new(2) > Step::new(1));
    }

    #[test]
    fn step_bump_saturates() {
        assert_eq!(Step::new(u32::MAX).bump(), Step::new(u32::MAX));
    }

    #[test]
    fn id_display() {
        assert_eq!(Id::new(7).to_string(), "#7");
        assert_eq!(Id::new(7).index(), 7);
    }
}
