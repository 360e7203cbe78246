//! Dependency-respecting linear order for reports.

use std::collections::{HashMap, HashSet, VecDeque};

use grist_error::{GristError, Result};
use grist_types::Id;

/// Order `entries` so that every dependency precedes its dependent.
///
/// Each keyed entry is registered as waiting on the head of its remaining
/// dependencies; emitting an id releases its waiters, which re-register
/// under the next unmet dependency or join the queue. Dependencies outside
/// `entries` are treated as already satisfied. Linear in total edges.
///
/// Entries never released when the queue runs dry are on a cycle, reported
/// as a structured error naming the offenders.
pub(crate) fn dependency_order(
    display: impl Fn(Id) -> String,
    entries: &[(Id, Vec<Id>)],
) -> Result<Vec<Id>> {
    let known: HashSet<Id> = entries.iter().map(|(id, _)| *id).collect();
    let mut emitted: HashSet<Id> = HashSet::with_capacity(entries.len());
    let mut queue: VecDeque<Id> = VecDeque::new();
    let mut waiters: HashMap<Id, Vec<(Id, VecDeque<Id>)>> = HashMap::new();

    fn register(
        id: Id,
        mut remaining: VecDeque<Id>,
        known: &HashSet<Id>,
        emitted: &HashSet<Id>,
        queue: &mut VecDeque<Id>,
        waiters: &mut HashMap<Id, Vec<(Id, VecDeque<Id>)>>,
    ) {
        loop {
            match remaining.pop_front() {
                None => {
                    queue.push_back(id);
                    return;
                }
                Some(dep) if !known.contains(&dep) || emitted.contains(&dep) => {}
                Some(dep) => {
                    waiters.entry(dep).or_default().push((id, remaining));
                    return;
                }
            }
        }
    }

    for (id, deps) in entries {
        register(
            *id,
            deps.iter().copied().collect(),
            &known,
            &emitted,
            &mut queue,
            &mut waiters,
        );
    }

    let mut out = Vec::with_capacity(entries.len());
    while let Some(id) = queue.pop_front() {
        emitted.insert(id);
        out.push(id);
        for (waiter, remaining) in waiters.remove(&id).unwrap_or_default() {
            register(waiter, remaining, &known, &emitted, &mut queue, &mut waiters);
        }
    }

    if out.len() < entries.len() {
        let stuck: Vec<String> = entries
            .iter()
            .filter(|(id, _)| !emitted.contains(id))
            .map(|(id, _)| display(*id))
            .collect();
        return Err(GristError::cyclic(stuck));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grist_error::CYCLIC_KEY_LIMIT;

    fn entries(spec: &[(u32, &[u32])]) -> Vec<(Id, Vec<Id>)> {
        spec.iter()
            .map(|(id, deps)| (Id::new(*id), deps.iter().copied().map(Id::new).collect()))
            .collect()
    }

    fn order(spec: &[(u32, &[u32])]) -> Result<Vec<Id>> {
        dependency_order(|id| format!("key{}", id.get()), &entries(spec))
    }

    fn position(out: &[Id], id: u32) -> usize {
        out.iter().position(|&x| x == Id::new(id)).unwrap()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let out = order(&[(0, &[1, 2]), (1, &[2]), (2, &[]), (3, &[0])]).unwrap();
        assert_eq!(out.len(), 4);
        assert!(position(&out, 2) < position(&out, 1));
        assert!(position(&out, 1) < position(&out, 0));
        assert!(position(&out, 0) < position(&out, 3));
    }

    #[test]
    fn unknown_dependencies_are_satisfied() {
        let out = order(&[(0, &[99]), (1, &[0])]).unwrap();
        assert_eq!(out, vec![Id::new(0), Id::new(1)]);
    }

    #[test]
    fn diamond_orders_once_each() {
        let out = order(&[(0, &[]), (1, &[0]), (2, &[0]), (3, &[1, 2])]).unwrap();
        assert_eq!(out.len(), 4);
        assert!(position(&out, 0) < position(&out, 1));
        assert!(position(&out, 0) < position(&out, 2));
        assert!(position(&out, 3) == 3);
    }

    #[test]
    fn cycle_is_reported_with_offenders() {
        let err = order(&[(0, &[1]), (1, &[0]), (2, &[])]).unwrap_err();
        let GristError::DatabaseCyclic { keys, overflow } = err else {
            panic!("expected DatabaseCyclic");
        };
        assert_eq!(keys, vec!["key0".to_owned(), "key1".to_owned()]);
        assert_eq!(overflow, 0);
    }

    #[test]
    fn big_cycle_clamps_named_keys() {
        // 14 keys in one ring.
        let spec: Vec<(u32, Vec<u32>)> = (0..14).map(|i| (i, vec![(i + 1) % 14])).collect();
        let borrowed: Vec<(u32, &[u32])> = spec.iter().map(|(i, d)| (*i, d.as_slice())).collect();
        let err = order(&borrowed).unwrap_err();
        let GristError::DatabaseCyclic { keys, overflow } = err else {
            panic!("expected DatabaseCyclic");
        };
        assert_eq!(keys.len(), CYCLIC_KEY_LIMIT);
        assert_eq!(overflow, 4);
    }

    #[test]
    fn empty_input_is_empty_order() {
        assert_eq!(order(&[]).unwrap(), Vec::<Id>::new());
    }
}
