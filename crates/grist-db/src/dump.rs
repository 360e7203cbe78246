//! JSON dump of the database for profiling and report tooling.

use std::collections::{BTreeSet, HashMap, HashSet};

use grist_error::Result;
use grist_types::{Id, Step, Trace};
use serde::Serialize;

use crate::database::Database;
use crate::order::dependency_order;

/// One emitted result row. `built` and `changed` are compact step ranks
/// (most recent step = 0); `depends` holds groups of row indices.
#[derive(Serialize)]
struct Row<'a> {
    name: &'a str,
    built: usize,
    changed: usize,
    depends: Vec<Vec<usize>>,
    execution: f64,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    traces: &'a [Trace],
}

/// Render every surviving result, topologically ordered, as a JSON array.
///
/// Survivors are the statuses carrying a result (ready, loaded, or waiting
/// on a prior), minus the step entry; dependency groups are filtered to
/// surviving ids and re-expressed as dense row indices.
pub(crate) fn show_json(db: &Database) -> Result<String> {
    let core = db.lock_core();
    let step_tag = db.witness().step_tag();

    let survivors: Vec<_> = core
        .iter()
        .filter(|(_, key, _)| key.tag() != step_tag)
        .filter_map(|(id, key, status)| status.result().map(|result| (id, key, result)))
        .collect();
    let present: HashSet<Id> = survivors.iter().map(|(id, _, _)| *id).collect();

    let filtered_groups: HashMap<Id, Vec<Vec<Id>>> = survivors
        .iter()
        .map(|(id, _, result)| {
            let groups: Vec<Vec<Id>> = result
                .depends
                .iter()
                .map(|group| {
                    group
                        .ids()
                        .iter()
                        .copied()
                        .filter(|dep| present.contains(dep))
                        .collect::<Vec<Id>>()
                })
                .filter(|group| !group.is_empty())
                .collect();
            (*id, groups)
        })
        .collect();

    let edges: Vec<(Id, Vec<Id>)> = survivors
        .iter()
        .map(|(id, _, _)| (*id, filtered_groups[id].iter().flatten().copied().collect()))
        .collect();
    let topo = dependency_order(|id| core.key(id).display().to_owned(), &edges)?;
    let index: HashMap<Id, usize> = topo.iter().enumerate().map(|(n, id)| (*id, n)).collect();

    // Rank the distinct steps, newest first.
    let steps: BTreeSet<Step> = survivors
        .iter()
        .flat_map(|(_, _, result)| [result.built, result.changed])
        .collect();
    let rank: HashMap<Step, usize> = steps.iter().rev().enumerate().map(|(n, s)| (*s, n)).collect();

    let by_id: HashMap<Id, _> = survivors.iter().map(|(id, key, result)| (*id, (*key, *result))).collect();
    let rows: Vec<Row<'_>> = topo
        .iter()
        .map(|id| {
            let (key, result) = by_id[id];
            Row {
                name: key.display(),
                built: rank[&result.built],
                changed: rank[&result.changed],
                depends: filtered_groups[id]
                    .iter()
                    .map(|group| group.iter().map(|dep| index[dep]).collect())
                    .collect(),
                execution: result.execution,
                traces: &result.traces,
            }
        })
        .collect();

    Ok(serde_json::to_string(&rows).expect("rows serialize"))
}
