use std::collections::HashMap;

use grist_types::{Id, Key};

/// Bijection between keys and dense ids. Purely additive within a process.
#[derive(Debug, Default)]
pub(crate) struct Intern {
    by_key: HashMap<Key, Id>,
}

impl Intern {
    /// Look up `key`, or allocate the next dense id via `alloc`.
    ///
    /// `alloc` receives the id it must back with a fresh map entry, keeping
    /// the intern table and the status map in lockstep.
    pub(crate) fn intern(&mut self, key: &Key, alloc: impl FnOnce(Id)) -> Id {
        if let Some(&id) = self.by_key.get(key) {
            return id;
        }
        let id = Id::new(u32::try_from(self.by_key.len()).expect("id space fits u32"));
        self.by_key.insert(key.clone(), id);
        alloc(id);
        id
    }

    /// Look up an already-interned key.
    pub(crate) fn get(&self, key: &Key) -> Option<Id> {
        self.by_key.get(key).copied()
    }
}
