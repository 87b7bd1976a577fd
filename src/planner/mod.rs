//! Orders the pending part of a deployment graph into concurrent batches.

use crate::error::PlanningError;
use crate::graph::DeploymentGraph;
use crate::module::{AccountRef, FutureId};
use crate::reconciler::{FutureStatus, ReconciledState};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Futures that may run concurrently: no edges between them and at most
/// one future per sending account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub futures: Vec<FutureId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    pub fn contains(&self, id: &FutureId) -> bool {
        self.futures.contains(id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn future_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Batch concatenation.
    pub fn order(&self) -> impl Iterator<Item = &FutureId> {
        self.batches.iter().flat_map(|batch| batch.futures.iter())
    }
}

/// Kahn layering over the pending futures, partitioned by sender.
///
/// Succeeded and abandoned futures are elided, failed ones excluded. A
/// pending future that depends on a failed or abandoned one cannot be
/// planned at all.
pub fn plan(graph: &DeploymentGraph, state: &ReconciledState) -> Result<ExecutionPlan, PlanningError> {
    let futures = graph.futures();
    let pending: Vec<bool> = futures
        .iter()
        .map(|future| state.status(&future.id).is_pending())
        .collect();

    let mut in_degree = vec![0_usize; futures.len()];
    for (position, future) in futures.iter().enumerate() {
        if !pending[position] {
            continue;
        }
        for dependency in graph.dependencies(&future.id) {
            match state.status(&dependency.id) {
                FutureStatus::Pending { .. } => in_degree[position] += 1,
                FutureStatus::Success(_) => {}
                blocked @ (FutureStatus::Failed(_) | FutureStatus::Abandoned) => {
                    return Err(PlanningError::BlockedDependency {
                        future: future.id.to_string(),
                        dependency: dependency.id.to_string(),
                        state: blocked.label().to_string(),
                    });
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..futures.len())
        .filter(|&position| pending[position] && in_degree[position] == 0)
        .collect();
    let mut remaining = pending.iter().filter(|&&is_pending| is_pending).count();
    let mut batches = Vec::new();

    while remaining > 0 {
        let mut senders: HashSet<AccountRef> = HashSet::new();
        let mut selected = Vec::new();
        for &position in &ready {
            match futures[position].sender() {
                Some(sender) if !senders.insert(sender) => {}
                _ => selected.push(position),
            }
        }
        if selected.is_empty() {
            return Err(PlanningError::Stalled(remaining));
        }

        for &position in &selected {
            ready.remove(&position);
            for dependent in graph.dependents(&futures[position].id) {
                let Some(target) = graph.position(&dependent.id) else {
                    continue;
                };
                if pending[target] {
                    in_degree[target] -= 1;
                    if in_degree[target] == 0 {
                        ready.insert(target);
                    }
                }
            }
        }

        remaining -= selected.len();
        let batch = Batch {
            futures: selected
                .into_iter()
                .map(|position| futures[position].id.clone())
                .collect(),
        };
        debug!(batch = batches.len(), size = batch.len(), "plan.batch");
        batches.push(batch);
    }

    Ok(ExecutionPlan { batches })
}
