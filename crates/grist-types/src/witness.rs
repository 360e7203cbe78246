use std::collections::HashMap;

use crate::{BuildResult, Key, Step, TypeTag, Value};

/// Type name of the distinguished step key.
///
/// The step key is journaled like any other key but filtered from reports;
/// user registrations must not collide with it.
pub const STEP_TYPE_NAME: &str = "grist.step";

/// Runtime registry mapping type names to dense [`TypeTag`]s.
///
/// Heterogeneous key and value types share one persisted map because every
/// payload is stored next to its tag, and the journal embeds the name table
/// so tags can be remapped when the next process registers types in a
/// different order. Registration happens before the database opens; the
/// table is immutable afterwards.
#[derive(Debug, Default)]
pub struct WitnessTable {
    names: Vec<String>,
    by_name: HashMap<String, TypeTag>,
}

impl WitnessTable {
    /// Create an empty table with the step type pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self::default();
        table.register(STEP_TYPE_NAME);
        table
    }

    /// Register a type name, returning its tag. Idempotent.
    pub fn register(&mut self, name: impl AsRef<str>) -> TypeTag {
        let name = name.as_ref();
        if let Some(&tag) = self.by_name.get(name) {
            return tag;
        }
        let tag = TypeTag::new(u32::try_from(self.names.len()).expect("witness table fits u32"));
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), tag);
        tag
    }

    /// Look up the tag for a registered name.
    #[must_use]
    pub fn tag_of(&self, name: &str) -> Option<TypeTag> {
        self.by_name.get(name).copied()
    }

    /// Look up the name for a tag.
    #[must_use]
    pub fn name_of(&self, tag: TypeTag) -> Option<&str> {
        self.names.get(tag.get() as usize).map(String::as_str)
    }

    /// The tag of the distinguished step type.
    #[must_use]
    pub fn step_tag(&self) -> TypeTag {
        self.tag_of(STEP_TYPE_NAME)
            .expect("step type is registered at construction")
    }

    /// The constant key the step counter is persisted under.
    #[must_use]
    pub fn step_key(&self) -> Key {
        Key::new(self.step_tag(), Vec::new(), STEP_TYPE_NAME)
    }

    /// The result recording `step`; its value payload is the raw counter.
    #[must_use]
    pub fn step_result(&self, step: Step) -> BuildResult {
        BuildResult {
            value: Value::new(self.step_tag(), step.get().to_le_bytes().to_vec()),
            built: step,
            changed: step,
            depends: Vec::new(),
            execution: 0.0,
            traces: Vec::new(),
        }
    }

    /// All registered names in tag order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
