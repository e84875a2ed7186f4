//! Dependency derivation and stable topological ordering.
//!
//! Uses `petgraph` to model explicit and implicit predecessor edges as a
//! directed graph. Topological sort detects cycles; the execution order is
//! then recomputed with Kahn's algorithm so that ties break by declaration
//! order, making runs deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::builder::GraphError;
use super::step::StepDescriptor;

/// The frozen execution plan of a workflow.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionPlan {
    /// Step indices in stable topological order.
    pub order: Vec<usize>,
    /// Effective predecessors per step, implicit sequential edges included.
    pub predecessors: HashMap<String, Vec<String>>,
}

/// Derive edges and compute the execution plan for `steps`.
///
/// A step that declares no predecessors inherits a single implicit edge
/// from the immediately prior declared step (sequential default). Fails on
/// duplicate names, unknown predecessors, and cycles.
pub(crate) fn plan(steps: &[Arc<StepDescriptor>]) -> Result<ExecutionPlan, GraphError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if index.insert(step.name.as_str(), i).is_some() {
            return Err(GraphError::DuplicateStep(step.name.clone()));
        }
    }

    // Effective predecessor lists, with the implicit sequential fallback.
    let mut preds: Vec<Vec<String>> = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if step.after.is_empty() {
            if i == 0 {
                preds.push(Vec::new());
            } else {
                preds.push(vec![steps[i - 1].name.clone()]);
            }
        } else {
            preds.push(step.after.clone());
        }
    }

    // Validate references and detect cycles with petgraph.
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
    for (i, deps) in preds.iter().enumerate() {
        for dep in deps {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(GraphError::UnknownDependency {
                    step: steps[i].name.clone(),
                    dependency: dep.clone(),
                });
            };
            graph.add_edge(nodes[j], nodes[i], ());
        }
    }
    toposort(&graph, None).map_err(|cycle| {
        let step_index = graph[cycle.node_id()];
        GraphError::CycleDetected(steps[step_index].name.clone())
    })?;

    // Stable order: Kahn's algorithm with a declaration-index min-heap.
    let mut indegree = vec![0usize; steps.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, deps) in preds.iter().enumerate() {
        for dep in deps {
            let j = index[dep.as_str()];
            successors[j].push(i);
            indegree[i] += 1;
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &succ in &successors[i] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.push(Reverse(succ));
            }
        }
    }

    let predecessors = steps
        .iter()
        .zip(preds)
        .map(|(step, deps)| (step.name.clone(), deps))
        .collect();

    Ok(ExecutionPlan {
        order,
        predecessors,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
