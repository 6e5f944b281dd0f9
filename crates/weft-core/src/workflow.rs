//! Workflow definitions: typed nodes, edges, and variable declarations.
//!
//! Definitions arrive as JSON authored elsewhere. `WorkflowDefinition::parse`
//! is the single load-time entry point: it converts every loosely-typed node
//! config into its typed struct and reports all problems at once.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::types::TriggerType;

/// An immutable workflow graph supplied per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Workflow-level variables, resolvable by name from any node.
    #[serde(default)]
    pub variables: Vec<Variable>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    variables: Vec<Variable>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl WorkflowDefinition {
    /// Parse a raw JSON definition, typing every node config.
    ///
    /// Unlike plain deserialization this does not stop at the first bad
    /// node: every config error is collected into a single
    /// `WeftError::Validation`.
    pub fn parse(raw: Value) -> Result<Self> {
        let raw: RawDefinition = serde_json::from_value(raw)
            .map_err(|e| WeftError::Validation(vec![format!("malformed definition: {}", e)]))?;

        let mut errors = Vec::new();
        let mut nodes = Vec::with_capacity(raw.nodes.len());
        for raw_node in raw.nodes {
            let id = raw_node.id.clone();
            match Node::try_from(raw_node) {
                Ok(node) => {
                    errors.extend(
                        node.kind
                            .validate()
                            .into_iter()
                            .map(|e| format!("node '{}': {}", id, e)),
                    );
                    nodes.push(node);
                }
                Err(e) => errors.push(e),
            }
        }

        for var in &raw.variables {
            errors.extend(
                var.validate()
                    .into_iter()
                    .map(|e| format!("variable '{}': {}", var.name, e)),
            );
        }

        if !errors.is_empty() {
            return Err(WeftError::Validation(errors));
        }

        Ok(Self {
            id: raw.id,
            name: raw.name,
            workspace_id: raw.workspace_id,
            tags: raw.tags,
            variables: raw.variables,
            nodes,
            edges: raw.edges,
        })
    }

    /// Parse a definition from JSON text.
    pub fn parse_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| WeftError::Validation(vec![format!("malformed definition: {}", e)]))?;
        Self::parse(value)
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a workflow-level variable by name.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Action,
    Agent,
    Condition,
    Output,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Agent => "agent",
            Self::Condition => "condition",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "trigger" => Ok(Self::Trigger),
            "action" => Ok(Self::Action),
            "agent" => Ok(Self::Agent),
            "condition" => Ok(Self::Condition),
            "output" => Ok(Self::Output),
            other => Err(format!("unknown node type '{}'", other)),
        }
    }
}

/// A typed unit of work in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn settings(&self) -> &NodeSettings {
        self.kind.settings()
    }

    /// The typed config re-serialized as JSON, as handed to handlers.
    pub fn config_value(&self) -> Value {
        self.kind.config_value()
    }
}

/// Wire form of a node: `{id, name?, type, config}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    config: Value,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        let node_type: NodeType = raw
            .node_type
            .parse()
            .map_err(|e| format!("node '{}': {}", raw.id, e))?;
        let config = if raw.config.is_null() {
            Value::Object(Default::default())
        } else {
            raw.config
        };

        fn typed<T: serde::de::DeserializeOwned>(
            id: &str,
            config: Value,
        ) -> std::result::Result<T, String> {
            serde_json::from_value(config).map_err(|e| format!("node '{}': invalid config: {}", id, e))
        }

        let kind = match node_type {
            NodeType::Trigger => NodeKind::Trigger(typed(&raw.id, config)?),
            NodeType::Action => NodeKind::Action(typed(&raw.id, config)?),
            NodeType::Agent => NodeKind::Agent(typed(&raw.id, config)?),
            NodeType::Condition => NodeKind::Condition(typed(&raw.id, config)?),
            NodeType::Output => NodeKind::Output(typed(&raw.id, config)?),
        };

        Ok(Self {
            id: raw.id,
            name: raw.name,
            kind,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        Self {
            node_type: node.node_type().as_str().to_string(),
            config: node.config_value(),
            id: node.id,
            name: node.name,
        }
    }
}

/// Node variant with its typed configuration.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Action(ActionConfig),
    Agent(AgentConfig),
    Condition(ConditionConfig),
    Output(OutputConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Trigger(_) => NodeType::Trigger,
            Self::Action(_) => NodeType::Action,
            Self::Agent(_) => NodeType::Agent,
            Self::Condition(_) => NodeType::Condition,
            Self::Output(_) => NodeType::Output,
        }
    }

    pub fn settings(&self) -> &NodeSettings {
        match self {
            Self::Trigger(c) => &c.settings,
            Self::Action(c) => &c.settings,
            Self::Agent(c) => &c.settings,
            Self::Condition(c) => &c.settings,
            Self::Output(c) => &c.settings,
        }
    }

    pub fn config_value(&self) -> Value {
        let result = match self {
            Self::Trigger(c) => serde_json::to_value(c),
            Self::Action(c) => serde_json::to_value(c),
            Self::Agent(c) => serde_json::to_value(c),
            Self::Condition(c) => serde_json::to_value(c),
            Self::Output(c) => serde_json::to_value(c),
        };
        result.unwrap_or(Value::Null)
    }

    /// Semantic checks serde cannot express.
    fn validate(&self) -> Vec<String> {
        let settings = self.settings();
        let mut errors = Vec::new();

        if settings.timeout_ms == Some(0) {
            errors.push("timeoutMs must be greater than zero".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for input in &settings.inputs {
            if !seen.insert(input.name.as_str()) {
                errors.push(format!("duplicate input '{}'", input.name));
            }
            errors.extend(
                input
                    .validate()
                    .into_iter()
                    .map(|e| format!("input '{}': {}", input.name, e)),
            );
        }

        match self {
            Self::Action(c) if c.action.trim().is_empty() => {
                errors.push("action must not be empty".to_string());
            }
            Self::Agent(c) if c.agent_id.trim().is_empty() => {
                errors.push("agentId must not be empty".to_string());
            }
            Self::Condition(c) => {
                if c.true_handle == c.false_handle {
                    errors.push("trueHandle and falseHandle must differ".to_string());
                }
                if let Some(rule) = &c.rule {
                    if rule.left.trim().is_empty() {
                        errors.push("rule.left must name an input".to_string());
                    }
                }
            }
            _ => {}
        }

        errors
    }
}

/// Settings shared by every node type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Variables resolved into the handler's input object.
    #[serde(default)]
    pub inputs: Vec<Variable>,
    /// Workflow-level variables, by name, added to the input object.
    #[serde(default)]
    pub variables: Vec<String>,
    /// Record failures and keep going instead of aborting the execution.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Per-node handler deadline; falls back to the engine default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(flatten)]
    pub settings: NodeSettings,
    /// Job trigger types that activate this trigger (empty = any).
    #[serde(default)]
    pub trigger_types: Vec<TriggerType>,
}

impl TriggerConfig {
    pub fn is_active_for(&self, trigger_type: TriggerType) -> bool {
        self.trigger_types.is_empty() || self.trigger_types.contains(&trigger_type)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfig {
    #[serde(flatten)]
    pub settings: NodeSettings,
    /// Handler-specific action name (e.g. "email.send").
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(flatten)]
    pub settings: NodeSettings,
    pub agent_id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    #[serde(flatten)]
    pub settings: NodeSettings,
    #[serde(default)]
    pub rule: Option<ConditionRule>,
    #[serde(default = "default_true_handle")]
    pub true_handle: String,
    #[serde(default = "default_false_handle")]
    pub false_handle: String,
}

impl Default for ConditionConfig {
    fn default() -> Self {
        Self {
            settings: NodeSettings::default(),
            rule: None,
            true_handle: default_true_handle(),
            false_handle: default_false_handle(),
        }
    }
}

fn default_true_handle() -> String {
    "true".to_string()
}

fn default_false_handle() -> String {
    "false".to_string()
}

/// `left op right`, where `left` names one of the node's resolved inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRule {
    pub left: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub right: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
    Truthy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    #[serde(flatten)]
    pub settings: NodeSettings,
}

/// A directed edge. `source_handle` picks a condition node's branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// A named value materialized from the execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    pub source: VariableSource,
    #[serde(default)]
    pub transform: Vec<Transform>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, source: VariableSource) -> Self {
        Self {
            name: name.into(),
            var_type: VariableType::Any,
            source,
            transform: vec![],
            default_value: None,
            required: false,
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<Transform>) -> Self {
        self.transform = transforms;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if let VariableSource::Env { key } = &self.source {
            if key.trim().is_empty() {
                errors.push("env source needs a key".to_string());
            }
        }
        if let VariableSource::Step { step_id, .. } = &self.source {
            if step_id.trim().is_empty() {
                errors.push("step source needs a stepId".to_string());
            }
        }
        for t in &self.transform {
            if let Transform::Truncate { max_length: 0, .. } = t {
                errors.push("truncate maxLength must be greater than zero".to_string());
            }
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

/// Where a variable's raw value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VariableSource {
    /// Dot path into the trigger payload.
    Input {
        #[serde(default)]
        path: String,
    },
    /// Dot path into a prior node's recorded output.
    Step {
        #[serde(rename = "stepId")]
        step_id: String,
        #[serde(default)]
        path: String,
    },
    /// Key in the sandboxed environment map.
    Env { key: String },
    Constant { value: Value },
    System { field: SystemField },
}

impl VariableSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Step { .. } => "step",
            Self::Env { .. } => "env",
            Self::Constant { .. } => "constant",
            Self::System { .. } => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemField {
    Timestamp,
    UserId,
    WorkflowId,
    ExecutionId,
}

/// A pure value-to-value step applied after fetching a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Transform {
    Uppercase,
    Lowercase,
    Capitalize,
    Trim,
    Truncate {
        #[serde(rename = "maxLength")]
        max_length: usize,
        #[serde(default)]
        suffix: String,
    },
    Replace {
        pattern: String,
        #[serde(default)]
        value: String,
    },
    Split {
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
    Join {
        #[serde(default = "default_delimiter")]
        separator: String,
    },
    #[serde(rename = "parseJSON")]
    ParseJson,
    Stringify,
}

fn default_delimiter() -> String {
    ",".to_string()
}
