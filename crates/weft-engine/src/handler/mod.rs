pub mod builtin;
pub mod registry;

pub use builtin::{ConditionHandler, OutputHandler, TriggerHandler};
pub use registry::HandlerRegistry;
