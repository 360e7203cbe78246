use crate::{Id, Step, Value};

/// One batch of ids a rule demanded together.
///
/// Group order across a result's `depends` preserves the order in which the
/// rule requested batches; within a group order carries no meaning, since
/// all members were demanded at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Depends(pub Vec<Id>);

impl Depends {
    #[inline]
    #[must_use]
    pub fn ids(&self) -> &[Id] {
        &self.0
    }
}

/// A message captured while a rule ran, with start/end offsets in seconds
/// from the beginning of the current run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Trace {
    pub message: String,
    pub start: f64,
    pub end: f64,
}

impl Trace {
    pub fn new(message: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            message: message.into(),
            start,
            end,
        }
    }
}

/// The memoized output of executing a rule, together with the dependency
/// metadata that drives the validity decision on later runs.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    /// The produced value.
    pub value: Value,
    /// The step at which `execute` last ran for this key.
    pub built: Step,
    /// The step at which `value` last differed from the previous one.
    /// Invariant: `changed <= built`.
    pub changed: Step,
    /// Dependency groups in demand order.
    pub depends: Vec<Depends>,
    /// Wall duration of the last run, in seconds.
    pub execution: f64,
    /// Traces captured during the last run.
    pub traces: Vec<Trace>,
}

impl BuildResult {
    /// Iterate every dependency id across all groups.
    pub fn dependency_ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.depends.iter().flat_map(|group| group.0.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TypeTag;

    fn result_with_deps(groups: Vec<Vec<u32>>) -> BuildResult {
        BuildResult {
            value: Value::new(TypeTag::new(0), b"v".to_vec()),
            built: Step::new(1),
            changed: Step::new(1),
            depends: groups
                .into_iter()
                .map(|g| Depends(g.into_iter().map(Id::new).collect()))
                .collect(),
            execution: 0.0,
            traces: Vec::new(),
        }
    }

    #[test]
    fn dependency_ids_flattens_groups_in_order() {
        let r = result_with_deps(vec![vec![3, 1], vec![2]]);
        let ids: Vec<u32> = r.dependency_ids().map(Id::get).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn changed_not_after_built() {
        let r = result_with_deps(vec![]);
        assert!(r.changed <= r.built);
    }
}
