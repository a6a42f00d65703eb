pub mod builtin;
pub mod handler;
pub mod registry;

pub use builtin::register_builtin_tools;
pub use handler::{ExpectedOutput, Tool, ToolContext, ToolDefinition};
pub use registry::ToolRegistry;
