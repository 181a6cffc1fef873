//! Built-in tools that come with the agent.

mod comment;
mod file;
mod limitation;
mod validation;

pub use comment::PostCommentTool;
pub use file::{DeleteFileTool, EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use limitation::ReportLimitationTool;
pub use validation::TriggerValidationTool;
