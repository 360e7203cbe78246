use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::TypeTag;

/// An externally-supplied identifier for something the build can produce.
///
/// A key is a type tag plus an opaque payload; two keys are equal when both
/// match, so distinct types with identical payloads are distinct keys. The
/// display form rides along for error messages and reports but takes no
/// part in equality or hashing.
#[derive(Debug, Clone)]
pub struct Key {
    tag: TypeTag,
    payload: Arc<[u8]>,
    display: Arc<str>,
}

impl Key {
    /// Create a key from its tag, encoded payload, and display form.
    pub fn new(tag: TypeTag, payload: impl Into<Arc<[u8]>>, display: impl Into<Arc<str>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
            display: display.into(),
        }
    }

    /// The key's type tag.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> TypeTag {
        self.tag
    }

    /// The encoded payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The display form, as shown in error messages and reports.
    #[inline]
    #[must_use]
    pub fn display(&self) -> &str {
        &self.display
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.payload == other.payload
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.payload.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// An opaque user-produced payload with equality and binary encoding.
///
/// Decoding a value back into its concrete type goes through the witness
/// registry; the engine itself only ever compares and persists the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value {
    tag: TypeTag,
    payload: Arc<[u8]>,
}

impl Value {
    /// Create a value from its tag and encoded payload.
    pub fn new(tag: TypeTag, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// The value's type tag.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> TypeTag {
        self.tag
    }

    /// The encoded payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} bytes", self.tag, self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn key(tag: u32, payload: &[u8], display: &str) -> Key {
        Key::new(TypeTag::new(tag), payload.to_vec(), display)
    }

    #[test]
    fn equality_ignores_display() {
        let a = key(0, b"main.c", "File \"main.c\"");
        let b = key(0, b"main.c", "completely different rendering");
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn distinct_tags_are_distinct_keys() {
        let a = key(0, b"main.c", "File \"main.c\"");
        let b = key(1, b"main.c", "Phony \"main.c\"");
        assert_ne!(a, b);
    }

    #[test]
    fn value_equality_covers_tag_and_payload() {
        let a = Value::new(TypeTag::new(0), b"abc".to_vec());
        let b = Value::new(TypeTag::new(0), b"abc".to_vec());
        let c = Value::new(TypeTag::new(1), b"abc".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
