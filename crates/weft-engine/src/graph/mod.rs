//! Workflow graph validation, ordering, and branch routing.
//!
//! A workflow is a directed acyclic graph of typed `Node`s connected by
//! `Edge`s. `WorkflowGraph::build` validates the structure once at load
//! time and fixes a deterministic topological order (Kahn's algorithm,
//! ties broken by the node's position in the definition).
//!
//! At runtime the executor walks that order; `routing` decides which nodes
//! are live given trigger activation and the branches condition nodes took.

pub mod condition;
pub mod routing;
pub mod validator;

pub use condition::{branch_taken, evaluate_rule, is_truthy};
pub use routing::should_run;
pub use validator::WorkflowGraph;
