//! Fixture workflows, built from their JSON wire form.

use serde_json::{json, Value};

use weft_core::workflow::WorkflowDefinition;

fn parse(raw: Value) -> WorkflowDefinition {
    WorkflowDefinition::parse(raw).expect("fixture workflow must parse")
}

fn input(name: &str, path: &str) -> Value {
    json!({"name": name, "source": {"kind": "input", "path": path}})
}

fn step(name: &str, step_id: &str, path: &str) -> Value {
    json!({"name": name, "source": {"kind": "step", "stepId": step_id, "path": path}})
}

/// `trigger -> action_a -> action_b -> output`.
///
/// `action_a` receives `name` from the payload, `action_b` receives
/// `greeting` from `action_a.name`, and the output emits
/// `result = action_b.greeting`. With echoing actions the output is
/// `{"result": <payload.name>}`.
pub fn linear_workflow() -> WorkflowDefinition {
    parse(linear_workflow_json())
}

/// Raw JSON of [`linear_workflow`].
pub fn linear_workflow_json() -> Value {
    json!({
        "id": "linear",
        "name": "Linear greeting",
        "tags": ["fixtures"],
        "nodes": [
            {"id": "trigger", "type": "trigger"},
            {"id": "action_a", "type": "action", "config": {
                "action": "echo",
                "inputs": [input("name", "name")]
            }},
            {"id": "action_b", "type": "action", "config": {
                "action": "echo",
                "inputs": [step("greeting", "action_a", "name")]
            }},
            {"id": "output", "type": "output", "config": {
                "inputs": [step("result", "action_b", "greeting")]
            }}
        ],
        "edges": [
            {"sourceNodeId": "trigger", "targetNodeId": "action_a"},
            {"sourceNodeId": "action_a", "targetNodeId": "action_b"},
            {"sourceNodeId": "action_b", "targetNodeId": "output"}
        ]
    })
}

/// `trigger -> check -> {on_true | on_false}`, where `check` tests
/// `score > 5` on the payload's `score`.
pub fn branching_workflow() -> WorkflowDefinition {
    parse(json!({
        "id": "branching",
        "name": "Score router",
        "nodes": [
            {"id": "trigger", "type": "trigger"},
            {"id": "check", "type": "condition", "config": {
                "inputs": [input("score", "score")],
                "rule": {"left": "score", "operator": "gt", "right": 5}
            }},
            {"id": "on_true", "type": "action", "config": {"action": "notify.high"}},
            {"id": "on_false", "type": "action", "config": {"action": "notify.low"}}
        ],
        "edges": [
            {"sourceNodeId": "trigger", "targetNodeId": "check"},
            {"sourceNodeId": "check", "targetNodeId": "on_true", "sourceHandle": "true"},
            {"sourceNodeId": "check", "targetNodeId": "on_false", "sourceHandle": "false"}
        ]
    }))
}

/// `trigger -> send`, where `send` requires `email` from `user.email`.
pub fn required_input_workflow() -> WorkflowDefinition {
    parse(json!({
        "id": "required",
        "name": "Send email",
        "nodes": [
            {"id": "trigger", "type": "trigger"},
            {"id": "send", "type": "action", "config": {
                "action": "email.send",
                "inputs": [{
                    "name": "email",
                    "source": {"kind": "input", "path": "user.email"},
                    "required": true
                }]
            }}
        ],
        "edges": [
            {"sourceNodeId": "trigger", "targetNodeId": "send"}
        ]
    }))
}

/// `trigger -> a -> b -> a`. Parses, but never builds into a graph.
pub fn cyclic_workflow() -> WorkflowDefinition {
    parse(json!({
        "id": "cyclic",
        "nodes": [
            {"id": "trigger", "type": "trigger"},
            {"id": "a", "type": "action", "config": {"action": "echo"}},
            {"id": "b", "type": "action", "config": {"action": "echo"}}
        ],
        "edges": [
            {"sourceNodeId": "trigger", "targetNodeId": "a"},
            {"sourceNodeId": "a", "targetNodeId": "b"},
            {"sourceNodeId": "b", "targetNodeId": "a"}
        ]
    }))
}
