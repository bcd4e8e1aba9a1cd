//! Plan engine
//!
//! Computes the ordered change set between a resource graph and a state
//! snapshot. Planning is pure: it reads its inputs and never touches the
//! live system or persisted state.
//!
//! Ordering:
//! - creates and updates first, dependencies before dependents
//! - deletes afterwards, dependents before dependencies (using the
//!   dependency lists recorded in the snapshot)
//! - ties broken by ascending address

use crate::action::{ActionType, AttributeChange, ChangeSet, ChangeSetEntry};
use crate::error::PlanError;
use dataiku_iac_core::{Attributes, ResourceAddress, ResourceGraph};
use dataiku_iac_state::{ResourceRecord, StateSnapshot};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Emit no-op entries for unchanged resources
    pub include_noop: bool,
}

/// Diff `graph` against `snapshot` with default options
pub fn diff(graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<ChangeSet, PlanError> {
    diff_with_options(graph, snapshot, &PlanOptions::default())
}

#[instrument(skip_all, fields(environment = %snapshot.environment, version = snapshot.version))]
pub fn diff_with_options(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    options: &PlanOptions,
) -> Result<ChangeSet, PlanError> {
    let mut entries: Vec<ChangeSetEntry> = Vec::new();
    // address -> entry index, for wiring prerequisites
    let mut entry_of: HashMap<ResourceAddress, usize> = HashMap::new();

    // Phase 1: creates and updates
    let (order, depth) = topological_order(graph.len(), |i| graph.dependencies(i).to_vec())
        .map_err(|cycle| PlanError::CyclicDependency {
            path: cycle
                .into_iter()
                .filter_map(|i| graph.node_at(i).map(|n| n.address.clone()))
                .collect(),
        })?;

    for node_index in order {
        let Some(node) = graph.node_at(node_index) else {
            continue;
        };
        let (action, changes) = match snapshot.get(&node.address) {
            None => (ActionType::Create, attribute_diff(&Attributes::new(), &node.attributes)),
            Some(record) => {
                let changes = attribute_diff(&record.attributes, &node.attributes);
                if !changes.is_empty() || !same_dependencies(&record.depends_on, &node.depends_on) {
                    // An empty diff means only the recorded dependencies change
                    (ActionType::Update, changes)
                } else {
                    (ActionType::NoOp, changes)
                }
            }
        };
        if action == ActionType::NoOp && !options.include_noop {
            continue;
        }

        let mut depends_on: Vec<usize> = node
            .depends_on
            .iter()
            .filter_map(|dep| entry_of.get(dep).copied())
            .collect();
        depends_on.sort_unstable();

        let index = entries.len();
        entry_of.insert(node.address.clone(), index);
        entries.push(ChangeSetEntry {
            index,
            address: node.address.clone(),
            action,
            diff: changes,
            rank: depth[node_index],
            depends_on,
            attributes: node.attributes.clone(),
            dependencies: node.depends_on.clone(),
        });
    }

    // Phase 2: deletes of records no longer declared
    let mut doomed: Vec<&ResourceRecord> = snapshot
        .records()
        .filter(|r| !graph.contains(&r.address))
        .collect();
    doomed.sort_by(|a, b| a.address.cmp(&b.address));

    let doomed_index: HashMap<&ResourceAddress, usize> = doomed
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.address, i))
        .collect();

    // Reverse edges: a doomed record must wait for the doomed records that depend on it
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); doomed.len()];
    for (i, record) in doomed.iter().enumerate() {
        for dep in &record.depends_on {
            if let Some(&target) = doomed_index.get(dep)
                && target != i
            {
                dependents[target].push(i);
            }
        }
    }

    let (delete_order, delete_depth) =
        topological_order(doomed.len(), |i| dependents[i].clone()).map_err(|cycle| {
            PlanError::CyclicDependency {
                path: cycle
                    .into_iter()
                    .map(|i| doomed[i].address.clone())
                    .collect(),
            }
        })?;

    for doomed_position in delete_order {
        let record = doomed[doomed_position];

        // Every record still depending on this one must be handled first,
        // whether it is being deleted or rewritten by phase 1
        let mut depends_on: Vec<usize> = snapshot
            .records()
            .filter(|other| other.depends_on.contains(&record.address))
            .filter_map(|other| entry_of.get(&other.address).copied())
            .collect();
        depends_on.sort_unstable();
        depends_on.dedup();

        let index = entries.len();
        entry_of.insert(record.address.clone(), index);
        entries.push(ChangeSetEntry {
            index,
            address: record.address.clone(),
            action: ActionType::Delete,
            diff: attribute_diff(&record.attributes, &Attributes::new()),
            rank: delete_depth[doomed_position],
            depends_on,
            attributes: record.attributes.clone(),
            dependencies: record.depends_on.clone(),
        });
    }

    let change_set = ChangeSet {
        environment: snapshot.environment.clone(),
        base_version: snapshot.version,
        entries,
    };
    info!(summary = %change_set.summary(), "Plan computed");
    Ok(change_set)
}

fn same_dependencies(recorded: &[ResourceAddress], desired: &[ResourceAddress]) -> bool {
    recorded.iter().collect::<BTreeSet<_>>() == desired.iter().collect::<BTreeSet<_>>()
}

/// Changed keys between two attribute maps, in key order
///
/// Keys missing on one side are reported as `Null`.
pub fn attribute_diff(before: &Attributes, after: &Attributes) -> Vec<AttributeChange> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old = before.get(key).cloned().unwrap_or(serde_json::Value::Null);
            let new = after.get(key).cloned().unwrap_or(serde_json::Value::Null);
            (old != new).then(|| AttributeChange {
                key: key.clone(),
                before: old,
                after: new,
            })
        })
        .collect()
}

/// Kahn's algorithm over `count` nodes, `prerequisites(i)` listing the
/// nodes that must precede `i`
///
/// The ready queue is ordered by node index, so callers that index nodes
/// in address order get address tie-breaking. Returns the order and the
/// depth of every node, or the nodes of one cycle.
fn topological_order<F>(count: usize, prerequisites: F) -> Result<(Vec<usize>, Vec<usize>), Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    let prereqs: Vec<Vec<usize>> = (0..count).map(&prerequisites).collect();
    let mut indegree: Vec<usize> = prereqs.iter().map(Vec::len).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (node, list) in prereqs.iter().enumerate() {
        for &p in list {
            successors[p].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);
    let mut depth = vec![0usize; count];

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &successors[node] {
            depth[next] = depth[next].max(depth[node] + 1);
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == count {
        return Ok((order, depth));
    }

    let remaining: BTreeSet<usize> = (0..count).filter(|&i| indegree[i] > 0).collect();
    let cycle = find_cycle(&remaining, &prereqs);
    debug!(nodes = remaining.len(), "Dependency cycle detected");
    Err(cycle)
}

// Every node left over by Kahn's algorithm has a prerequisite that was
// also left over, so walking prerequisites must revisit a node.
fn find_cycle(remaining: &BTreeSet<usize>, prereqs: &[Vec<usize>]) -> Vec<usize> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = prereqs[current].iter().find(|p| remaining.contains(p)) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&n| n == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            // Walking prerequisites yields dependents first; report dependencies first
            cycle.reverse();
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
