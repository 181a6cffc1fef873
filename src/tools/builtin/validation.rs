//! Remote validation of the staged changes.

use async_trait::async_trait;

use crate::error::WorkspaceError;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, ToolSignal};
use crate::workspace::ValidationOutcome;

/// Push the staged changes to the validation branch, run the pipeline and
/// wait for its verdict.
///
/// A pass ends the conversation; a failure is an ordinary result carrying the
/// diagnostic so the model can attempt a fix.
#[derive(Debug, Default)]
pub struct TriggerValidationTool;

#[async_trait]
impl Tool for TriggerValidationTool {
    fn name(&self) -> &str {
        "trigger_validation"
    }

    fn description(&self) -> &str {
        "Run the repository's validation pipeline (build and tests) against your staged \
         changes and wait for the result. Call this when you believe the change is complete. \
         If validation passes, the change is proposed for review and the conversation ends. \
         If it fails, you receive the failure diagnostic."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();

        if ctx.workspace.changelist().is_empty() {
            return Err(ToolError::Workspace(WorkspaceError::NothingStaged));
        }

        let handle = ctx.workspace.trigger_validation().await?;
        tracing::info!(
            "Validation dispatched on {} at {}",
            handle.branch,
            handle.head_sha
        );

        let outcome = ctx.workspace.await_validation(&handle, ctx.cancel).await?;
        match outcome {
            ValidationOutcome::Pass => {
                tracing::info!("Validation passed");
                Ok(ToolOutput::success(
                    serde_json::json!({ "passed": true }),
                    start.elapsed(),
                )
                .with_signal(ToolSignal::ValidationPassed))
            }
            ValidationOutcome::Fail { diagnostic } => {
                tracing::info!("Validation failed");
                Ok(ToolOutput::success(
                    serde_json::json!({ "passed": false, "diagnostic": diagnostic }),
                    start.elapsed(),
                ))
            }
        }
    }
}
