//! Tool system.
//!
//! Tools are the model's only way to act on a task. They can:
//! - Read and stage files in the task's workspace
//! - Run the validation pipeline against staged changes
//! - Comment on the task's issue
//! - Report that the task cannot be completed

pub mod builtin;

mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{Limitation, Tool, ToolContext, ToolError, ToolOutput, ToolSignal};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::fs::MemoryFs;
    use crate::platform::{InMemoryPlatform, RepoRef};
    use crate::task::Task;
    use crate::tools::ToolContext;
    use crate::workspace::{MemoryWorkspace, ValidationOutcome};

    /// Owns everything a [`ToolContext`] borrows.
    pub struct Harness {
        pub workspace: MemoryWorkspace,
        pub platform: Arc<InMemoryPlatform>,
        pub task: Task,
        pub cancel: CancellationToken,
    }

    impl Harness {
        pub fn with_files(files: &[(&str, &str)]) -> Self {
            let repo = RepoRef::new("acme", "widgets");
            let platform = Arc::new(InMemoryPlatform::new("issuebot"));
            platform.add_repo(&repo, "main", files);
            let number = platform.add_issue(&repo, "Crash on empty input", "", "alice");

            let mut task = crate::task::test_support::task(None);
            task.key.number = number;
            task.issue.number = number;

            Self {
                workspace: MemoryWorkspace::new(Arc::new(MemoryFs::from_files(files)), "issuebot/issue-7"),
                platform,
                task,
                cancel: CancellationToken::new(),
            }
        }

        pub fn with_validation(mut self, verdicts: Vec<ValidationOutcome>) -> Self {
            self.workspace = self.workspace.with_validation(verdicts);
            self
        }

        pub fn ctx(&mut self) -> ToolContext<'_> {
            ToolContext {
                workspace: &mut self.workspace,
                platform: self.platform.as_ref(),
                task: &self.task,
                cancel: &self.cancel,
            }
        }
    }
}
