use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use weft_core::error::{Result, WeftError};
use weft_core::types::TriggerType;
use weft_core::workflow::{Edge, Node, NodeKind, Variable, VariableSource, WorkflowDefinition};

/// A validated workflow with a fixed execution order.
///
/// Construction is the only place structural problems are reported; once
/// built, every edge endpoint exists, every condition edge names one of its
/// source's handles, and the graph is acyclic.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    def: Arc<WorkflowDefinition>,
    index: HashMap<String, usize>,
    /// Edge positions leaving each node, by node position.
    outgoing: Vec<Vec<usize>>,
    /// Edge positions entering each node, by node position.
    incoming: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl WorkflowGraph {
    /// Validate a definition and compute its topological order.
    ///
    /// Structural problems are collected into one `Validation` error. A
    /// cycle is reported separately as `GraphCycle`, naming one cycle.
    pub fn build(def: WorkflowDefinition) -> Result<Self> {
        let mut errors = Vec::new();

        let mut index = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                errors.push(format!("duplicate node id '{}'", node.id));
            }
        }

        if !def.nodes.iter().any(|n| matches!(n.kind, NodeKind::Trigger(_))) {
            errors.push("workflow has no trigger node".to_string());
        }

        let mut outgoing = vec![Vec::new(); def.nodes.len()];
        let mut incoming = vec![Vec::new(); def.nodes.len()];
        for (e, edge) in def.edges.iter().enumerate() {
            let source = index.get(&edge.source_node_id).copied();
            let target = index.get(&edge.target_node_id).copied();
            if source.is_none() {
                errors.push(format!(
                    "edge {} references unknown source node '{}'",
                    edge_label(e, edge),
                    edge.source_node_id
                ));
            }
            if target.is_none() {
                errors.push(format!(
                    "edge {} references unknown target node '{}'",
                    edge_label(e, edge),
                    edge.target_node_id
                ));
            }
            if let (Some(s), Some(t)) = (source, target) {
                check_handle(&def.nodes[s], e, edge, &mut errors);
                outgoing[s].push(e);
                incoming[t].push(e);
            }
        }

        check_variables(&def, &index, &mut errors);

        if !errors.is_empty() {
            return Err(WeftError::Validation(errors));
        }

        let order = topological_order(&def.nodes, &def.edges, &index, &outgoing, &incoming)?;

        Ok(Self {
            def: Arc::new(def),
            index,
            outgoing,
            incoming,
            order,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.def
    }

    pub fn shared_definition(&self) -> Arc<WorkflowDefinition> {
        self.def.clone()
    }

    pub fn len(&self) -> usize {
        self.def.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.def.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.def.nodes[i])
    }

    /// Nodes in execution order.
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().map(|&i| &self.def.nodes[i])
    }

    /// Node ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.ordered_nodes().map(|n| n.id.as_str()).collect()
    }

    /// Edges leaving `node_id`, in definition order.
    pub fn successors(&self, node_id: &str) -> Vec<&Edge> {
        self.index
            .get(node_id)
            .map(|&i| self.outgoing[i].iter().map(|&e| &self.def.edges[e]).collect())
            .unwrap_or_default()
    }

    /// Edges entering `node_id`, in definition order.
    pub fn incoming(&self, node_id: &str) -> Vec<&Edge> {
        self.index
            .get(node_id)
            .map(|&i| self.incoming[i].iter().map(|&e| &self.def.edges[e]).collect())
            .unwrap_or_default()
    }

    /// Ids of nodes reachable from a trigger activated by `trigger_type`,
    /// including the triggers themselves.
    pub fn plan(&self, trigger_type: TriggerType) -> HashSet<String> {
        let mut live = HashSet::new();
        let mut queue: VecDeque<usize> = self
            .def
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(&n.kind, NodeKind::Trigger(t) if t.is_active_for(trigger_type)))
            .map(|(i, _)| i)
            .collect();

        while let Some(i) = queue.pop_front() {
            if !live.insert(self.def.nodes[i].id.clone()) {
                continue;
            }
            for &e in &self.outgoing[i] {
                if let Some(&t) = self.index.get(&self.def.edges[e].target_node_id) {
                    queue.push_back(t);
                }
            }
        }
        live
    }
}

fn edge_label(position: usize, edge: &Edge) -> String {
    match &edge.id {
        Some(id) => format!("'{}'", id),
        None => format!("#{}", position),
    }
}

/// Condition edges must pick a branch; other nodes have no handles.
fn check_handle(source: &Node, position: usize, edge: &Edge, errors: &mut Vec<String>) {
    match (&source.kind, &edge.source_handle) {
        (NodeKind::Condition(c), Some(handle)) => {
            if handle != &c.true_handle && handle != &c.false_handle {
                errors.push(format!(
                    "edge {} uses handle '{}' but condition '{}' only has '{}' and '{}'",
                    edge_label(position, edge),
                    handle,
                    source.id,
                    c.true_handle,
                    c.false_handle
                ));
            }
        }
        (NodeKind::Condition(_), None) => errors.push(format!(
            "edge {} leaves condition '{}' without a sourceHandle",
            edge_label(position, edge),
            source.id
        )),
        (_, Some(handle)) => errors.push(format!(
            "edge {} uses handle '{}' but '{}' is not a condition node",
            edge_label(position, edge),
            handle,
            source.id
        )),
        (_, None) => {}
    }
}

/// Step sources must name real nodes, node variable references must name
/// workflow variables, and a name declared twice must mean the same thing
/// (the resolution cache is keyed by name).
fn check_variables(
    def: &WorkflowDefinition,
    index: &HashMap<String, usize>,
    errors: &mut Vec<String>,
) {
    let mut declared: HashMap<&str, &Variable> = HashMap::new();

    for var in &def.variables {
        check_step_source("workflow", var, index, errors);
        if declared.insert(var.name.as_str(), var).is_some() {
            errors.push(format!("duplicate workflow variable '{}'", var.name));
        }
    }

    for node in &def.nodes {
        let settings = node.settings();
        let owner = format!("node '{}'", node.id);
        for var in &settings.inputs {
            check_step_source(&owner, var, index, errors);
            match declared.get(var.name.as_str()) {
                Some(existing) if *existing != var => errors.push(format!(
                    "{} input '{}' conflicts with another declaration of the same name",
                    owner, var.name
                )),
                Some(_) => {}
                None => {
                    declared.insert(var.name.as_str(), var);
                }
            }
        }
        for name in &settings.variables {
            if def.variable(name).is_none() {
                errors.push(format!("{} uses unknown workflow variable '{}'", owner, name));
            }
        }
    }
}

fn check_step_source(
    owner: &str,
    var: &Variable,
    index: &HashMap<String, usize>,
    errors: &mut Vec<String>,
) {
    if let VariableSource::Step { step_id, .. } = &var.source {
        if !index.contains_key(step_id) {
            errors.push(format!(
                "{} variable '{}' reads from unknown step '{}'",
                owner, var.name, step_id
            ));
        }
    }
}

/// Kahn's algorithm; among ready nodes the earliest in the definition wins.
fn topological_order(
    nodes: &[Node],
    edges: &[Edge],
    index: &HashMap<String, usize>,
    outgoing: &[Vec<usize>],
    incoming: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &e in &outgoing[i] {
            let t = index[&edges[e].target_node_id];
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.insert(t);
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let cycle = find_cycle(nodes, edges, index, incoming, &in_degree);
    Err(WeftError::GraphCycle { cycle })
}

/// Walk backwards through unprocessed predecessors until a node repeats.
///
/// Every node left with a positive in-degree has at least one unprocessed
/// predecessor, so the walk always closes a loop.
fn find_cycle(
    nodes: &[Node],
    edges: &[Edge],
    index: &HashMap<String, usize>,
    incoming: &[Vec<usize>],
    in_degree: &[usize],
) -> Vec<String> {
    let Some(start) = (0..nodes.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen_at = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(prev) = incoming[current]
            .iter()
            .map(|&e| index[&edges[e].source_node_id])
            .filter(|&p| in_degree[p] > 0)
            .min()
        else {
            return Vec::new();
        };
        if let Some(&at) = seen_at.get(&prev) {
            // path[at..] followed backwards from `prev` back to itself.
            let mut cycle: Vec<String> = path[at..]
                .iter()
                .rev()
                .map(|&i| nodes[i].id.clone())
                .collect();
            cycle.push(cycle[0].clone());
            return cycle;
        }
        seen_at.insert(prev, path.len());
        path.push(prev);
        current = prev;
    }
}
