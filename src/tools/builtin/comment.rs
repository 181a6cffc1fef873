use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum comment length accepted by the platform.
const MAX_COMMENT_LEN: usize = 65_536;

/// Post a comment on the task's issue, e.g. to ask a clarifying question
/// or report progress.
#[derive(Debug, Default)]
pub struct PostCommentTool;

#[async_trait]
impl Tool for PostCommentTool {
    fn name(&self) -> &str {
        "post_comment"
    }

    fn description(&self) -> &str {
        "Post a comment on the issue you are working on. Use it to ask a clarifying \
         question or share progress. Comments are posted immediately."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "body": {
                    "type": "string",
                    "description": "Markdown body of the comment"
                }
            },
            "required": ["body"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let body = require_str(&params, "body")?;
        if body.trim().is_empty() {
            return Err(ToolError::InvalidParameters("'body' must not be empty".into()));
        }
        if body.len() > MAX_COMMENT_LEN {
            return Err(ToolError::InvalidParameters(format!(
                "Comment too long ({} bytes). Maximum is {} bytes.",
                body.len(),
                MAX_COMMENT_LEN
            )));
        }

        let start = std::time::Instant::now();
        let key = &ctx.task.key;
        let comment = ctx.platform.post_comment(&key.repo, key.number, body).await?;

        Ok(ToolOutput::success(
            serde_json::json!({ "comment_id": comment.id, "posted": true }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::Harness;

    #[tokio::test]
    async fn test_post_comment_on_task_issue() {
        let mut h = Harness::with_files(&[]);
        PostCommentTool
            .execute(serde_json::json!({"body": "Which parser do you mean?"}), &mut h.ctx())
            .await
            .unwrap();

        let key = h.task.key.clone();
        let comments = h.platform.comments(&key.repo, key.number);
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "issuebot");
    }

    #[tokio::test]
    async fn test_empty_body_rejected() {
        let mut h = Harness::with_files(&[]);
        let err = PostCommentTool
            .execute(serde_json::json!({"body": "  "}), &mut h.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
