use std::collections::{HashMap, HashSet};

use weft_core::types::NodeStatus;
use weft_core::workflow::{Edge, Node, NodeKind};

use super::validator::WorkflowGraph;

/// Decide whether `node` runs, given what has happened so far.
///
/// `live` is the trigger plan (`WorkflowGraph::plan`). Active triggers
/// always run. Any other node runs when at least one incoming edge is
/// taken: its source succeeded (or failed with `continueOnError`) and, for
/// condition sources, the edge's handle matches the branch chosen. A node
/// whose every inbound edge is dead is skipped, which in turn kills its own
/// outgoing edges.
pub fn should_run(
    graph: &WorkflowGraph,
    node: &Node,
    live: &HashSet<String>,
    states: &HashMap<String, NodeStatus>,
    branches: &HashMap<String, bool>,
) -> bool {
    if !live.contains(&node.id) {
        return false;
    }
    if matches!(node.kind, NodeKind::Trigger(_)) {
        return true;
    }
    graph
        .incoming(&node.id)
        .into_iter()
        .any(|edge| edge_taken(graph, edge, states, branches))
}

fn edge_taken(
    graph: &WorkflowGraph,
    edge: &Edge,
    states: &HashMap<String, NodeStatus>,
    branches: &HashMap<String, bool>,
) -> bool {
    let Some(source) = graph.node(&edge.source_node_id) else {
        return false;
    };
    let status = states
        .get(&source.id)
        .copied()
        .unwrap_or(NodeStatus::Pending);

    match &source.kind {
        NodeKind::Condition(c) => {
            if status != NodeStatus::Success {
                return false;
            }
            let chosen = match branches.get(&source.id) {
                Some(true) => &c.true_handle,
                Some(false) => &c.false_handle,
                None => return false,
            };
            edge.source_handle.as_deref() == Some(chosen.as_str())
        }
        _ => match status {
            NodeStatus::Success => true,
            NodeStatus::Error => source.settings().continue_on_error,
            _ => false,
        },
    }
}
