use async_trait::async_trait;

use crate::tools::tool::{Limitation, Tool, ToolContext, ToolError, ToolOutput, ToolSignal, require_str};

/// Lets the model stop and hand the task to a human when it lacks a
/// capability it needs.
#[derive(Debug, Default)]
pub struct ReportLimitationTool;

#[async_trait]
impl Tool for ReportLimitationTool {
    fn name(&self) -> &str {
        "report_limitation"
    }

    fn description(&self) -> &str {
        "Stop working on this task because you cannot complete it with the tools you have. \
         Explain why, and name the capability you are missing. A human will pick it up. \
         Any other tool calls in the same response are not executed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why the task cannot be completed"
                },
                "missing_capability": {
                    "type": "string",
                    "description": "The capability that would be needed, e.g. 'database access'"
                }
            },
            "required": ["reason", "missing_capability"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let limitation = Limitation {
            reason: require_str(&params, "reason")?.to_string(),
            missing_capability: require_str(&params, "missing_capability")?.to_string(),
        };

        Ok(ToolOutput::text("Limitation recorded.", std::time::Duration::ZERO)
            .with_signal(ToolSignal::Blocked(limitation)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::Harness;

    #[tokio::test]
    async fn test_report_limitation_blocks() {
        let mut h = Harness::with_files(&[]);
        let output = ReportLimitationTool
            .execute(
                serde_json::json!({
                    "reason": "the failing query needs a live schema",
                    "missing_capability": "no database access"
                }),
                &mut h.ctx(),
            )
            .await
            .unwrap();

        match output.signal {
            Some(ToolSignal::Blocked(l)) => assert_eq!(l.missing_capability, "no database access"),
            other => panic!("expected blocked signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requires_capability() {
        let mut h = Harness::with_files(&[]);
        let err = ReportLimitationTool
            .execute(serde_json::json!({"reason": "stuck"}), &mut h.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
