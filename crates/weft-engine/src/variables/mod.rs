//! Variable resolution: source lookup, dot-path traversal, and the
//! transform pipeline, cached per execution.

pub mod path;
pub mod store;
pub mod transform;

pub use path::get_path;
pub use store::{ResolvedVariable, VariableStore};
pub use transform::{apply_transform, apply_transforms};
