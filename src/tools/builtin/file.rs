//! File tools over the staged view of the repository.
//!
//! Reads see staged edits; writes, edits and deletes only change the staging
//! overlay. Nothing reaches the platform until the workspace commits.

use async_trait::async_trait;

use crate::fs::{FileSystem, normalize_path};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: usize = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

fn decode(path: &str, bytes: Vec<u8>) -> Result<String, ToolError> {
    String::from_utf8(bytes)
        .map_err(|_| ToolError::ExecutionFailed(format!("{} is not a UTF-8 text file", path)))
}

/// Read file contents tool.
#[derive(Debug, Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the repository, including any changes you have staged. \
         Returns numbered lines. For large files, specify offset and limit to read a portion."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Repository-relative path of the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed, optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (optional)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let path = normalize_path(require_str(&params, "path")?)?;
        let offset = params
            .get("offset")
            .and_then(|v| v.as_u64())
            .map_or(0, |v| usize::try_from(v).unwrap_or(usize::MAX));
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| usize::try_from(v).unwrap_or(usize::MAX));

        let start = std::time::Instant::now();

        let bytes = ctx.workspace.fs().read(&path).await?;
        if bytes.len() > MAX_READ_SIZE && limit.is_none() {
            return Err(ToolError::ExecutionFailed(format!(
                "File too large ({} bytes). Maximum is {} bytes. Use offset/limit for partial reads.",
                bytes.len(),
                MAX_READ_SIZE
            )));
        }
        let content = decode(&path, bytes)?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let start_line = offset.saturating_sub(1).min(total_lines);
        let end_line = match limit {
            Some(lim) => start_line.saturating_add(lim).min(total_lines),
            None => total_lines,
        };

        let selected_lines: Vec<String> = lines[start_line..end_line]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}│ {}", start_line + i + 1, line))
            .collect();

        let result = serde_json::json!({
            "content": selected_lines.join("\n"),
            "total_lines": total_lines,
            "lines_shown": end_line - start_line,
            "path": path
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

/// Write file contents tool.
#[derive(Debug, Default)]
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Stage a file with the given content. Creates the file if it doesn't exist, \
         overwrites it if it does. Parent directories are implied by the path. \
         Use edit_file for targeted edits."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Repository-relative path of the file"
                },
                "content": {
                    "type": "string",
                    "description": "Full new content of the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let path = normalize_path(require_str(&params, "path")?)?;
        let content = require_str(&params, "content")?;

        let start = std::time::Instant::now();

        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "Content too large ({} bytes). Maximum is {} bytes.",
                content.len(),
                MAX_WRITE_SIZE
            )));
        }

        let existed = ctx.workspace.fs().file_exists(&path).await?;
        ctx.workspace
            .stage(&path, content.as_bytes().to_vec())
            .await?;

        let result = serde_json::json!({
            "path": path,
            "bytes_written": content.len(),
            "created": !existed,
            "success": true
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }

    fn mutates_workspace(&self) -> bool {
        true
    }
}

/// Search/replace edit of a staged file.
#[derive(Debug, Default)]
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Apply a targeted edit to a file using search/replace. Finds 'old_string', which must \
         occur exactly once in the file, and replaces it with 'new_string'. The old_string must \
         match exactly (including whitespace and indentation); include surrounding lines to \
         make it unique."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Repository-relative path of the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact string to find and replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The string to replace it with"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let path = normalize_path(require_str(&params, "path")?)?;
        let old_string = require_str(&params, "old_string")?;
        let new_string = require_str(&params, "new_string")?;

        if old_string.is_empty() {
            return Err(ToolError::InvalidParameters(
                "'old_string' must not be empty".into(),
            ));
        }

        let start = std::time::Instant::now();

        let content = decode(&path, ctx.workspace.fs().read(&path).await?)?;

        match content.matches(old_string).count() {
            0 => {
                return Err(ToolError::ExecutionFailed(format!(
                    "Could not find old_string in {}. It must match the file exactly.",
                    path
                )));
            }
            1 => {}
            n => {
                return Err(ToolError::ExecutionFailed(format!(
                    "old_string occurs {} times in {}. Include more context so it is unique.",
                    n, path
                )));
            }
        }

        let new_content = content.replacen(old_string, new_string, 1);
        ctx.workspace.stage(&path, new_content.into_bytes()).await?;

        let result = serde_json::json!({
            "path": path,
            "replacements": 1,
            "success": true
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }

    fn mutates_workspace(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Stage the removal of a file. Directories cannot be deleted directly; \
         delete the files inside them instead."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Repository-relative path of the file to delete"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let path = normalize_path(require_str(&params, "path")?)?;
        let start = std::time::Instant::now();

        ctx.workspace.delete(&path).await?;

        Ok(ToolOutput::success(
            serde_json::json!({ "path": path, "deleted": true }),
            start.elapsed(),
        ))
    }

    fn mutates_workspace(&self) -> bool {
        true
    }
}

/// List directory contents tool.
#[derive(Debug, Default)]
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a repository directory, including staged changes. \
         Use an empty path for the repository root."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Repository-relative directory path (default: root)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let raw = params.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let path = normalize_path(raw)?;

        let start = std::time::Instant::now();

        let mut entries = ctx.workspace.fs().list_dir(&path).await?;
        let total = entries.len();
        let truncated = total > MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);

        let result = serde_json::json!({
            "path": path,
            "entries": entries,
            "count": total,
            "truncated": truncated
        });

        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::FsError;
    use crate::tools::test_support::Harness;
    use crate::workspace::Workspace;

    fn harness() -> Harness {
        Harness::with_files(&[
            ("README.md", "# widgets\n"),
            ("src/lib.rs", "fn parse() {\n    todo!()\n}\n"),
            ("src/main.rs", "fn main() {}\n"),
        ])
    }

    // ==================== read_file ====================

    #[tokio::test]
    async fn test_read_file_numbers_lines() {
        let mut h = harness();
        let result = ReadFileTool
            .execute(serde_json::json!({"path": "src/lib.rs"}), &mut h.ctx())
            .await
            .unwrap();

        let content = result.result["content"].as_str().unwrap();
        assert!(content.starts_with("     1│ fn parse() {"));
        assert_eq!(result.result["total_lines"], 3);
    }

    #[tokio::test]
    async fn test_read_file_offset_limit() {
        let mut h = harness();
        let result = ReadFileTool
            .execute(
                serde_json::json!({"path": "src/lib.rs", "offset": 2, "limit": 1}),
                &mut h.ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.result["content"], "     2│     todo!()");
        assert_eq!(result.result["lines_shown"], 1);
    }

    #[tokio::test]
    async fn test_read_file_huge_limit_reads_to_end() {
        let mut h = harness();
        let result = ReadFileTool
            .execute(
                serde_json::json!({"path": "src/lib.rs", "offset": 2, "limit": u64::MAX}),
                &mut h.ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.result["lines_shown"], 2);
        assert!(result.result["content"].as_str().unwrap().starts_with("     2│"));
    }

    #[tokio::test]
    async fn test_read_file_sees_staged_write() {
        let mut h = harness();
        WriteFileTool
            .execute(
                serde_json::json!({"path": "NOTES.md", "content": "hello"}),
                &mut h.ctx(),
            )
            .await
            .unwrap();

        let result = ReadFileTool
            .execute(serde_json::json!({"path": "./NOTES.md"}), &mut h.ctx())
            .await
            .unwrap();
        assert_eq!(result.result["content"], "     1│ hello");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let mut h = harness();
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "nope.rs"}), &mut h.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Fs(FsError::FileNotFound(_))));
        assert!(!err.is_fatal());
    }

    // ==================== write_file ====================

    #[tokio::test]
    async fn test_write_file_stages_only() {
        let mut h = harness();
        let result = WriteFileTool
            .execute(
                serde_json::json!({"path": "src/lib.rs", "content": "fn parse() {}\n"}),
                &mut h.ctx(),
            )
            .await
            .unwrap();

        assert_eq!(result.result["created"], false);
        let changelist = h.workspace.changelist();
        assert_eq!(changelist.paths(), vec!["src/lib.rs"]);
        assert!(h.workspace.commits().is_empty());
    }

    #[tokio::test]
    async fn test_write_rejects_escaping_path() {
        let mut h = harness();
        let err = WriteFileTool
            .execute(
                serde_json::json!({"path": "../etc/passwd", "content": "x"}),
                &mut h.ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Fs(FsError::InvalidPath { .. })));
        assert!(h.workspace.changelist().is_empty());
    }

    #[tokio::test]
    async fn test_write_missing_content() {
        let mut h = harness();
        let err = WriteFileTool
            .execute(serde_json::json!({"path": "a.txt"}), &mut h.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    // ==================== edit_file ====================

    #[tokio::test]
    async fn test_edit_file_single_occurrence() {
        let mut h = harness();
        EditFileTool
            .execute(
                serde_json::json!({
                    "path": "src/lib.rs",
                    "old_string": "todo!()",
                    "new_string": "Ok(())"
                }),
                &mut h.ctx(),
            )
            .await
            .unwrap();

        let staged = h.workspace.fs().read("src/lib.rs").await.unwrap();
        assert_eq!(String::from_utf8(staged).unwrap(), "fn parse() {\n    Ok(())\n}\n");
    }

    #[tokio::test]
    async fn test_edit_file_ambiguous_match() {
        let mut h = harness();
        let err = EditFileTool
            .execute(
                serde_json::json!({"path": "src/lib.rs", "old_string": "(", "new_string": "["}),
                &mut h.ctx(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("occurs 2 times"));
        assert!(h.workspace.changelist().is_empty());
    }

    #[tokio::test]
    async fn test_edit_file_no_match() {
        let mut h = harness();
        let err = EditFileTool
            .execute(
                serde_json::json!({"path": "src/main.rs", "old_string": "xyz", "new_string": "abc"}),
                &mut h.ctx(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not find"));
    }

    // ==================== delete_file / list_dir ====================

    #[tokio::test]
    async fn test_delete_then_list() {
        let mut h = harness();
        DeleteFileTool
            .execute(serde_json::json!({"path": "src/main.rs"}), &mut h.ctx())
            .await
            .unwrap();

        let result = ListDirTool
            .execute(serde_json::json!({"path": "src"}), &mut h.ctx())
            .await
            .unwrap();
        assert_eq!(
            result.result["entries"],
            serde_json::json!([{"name": "lib.rs", "type": "file"}])
        );

        let changelist = h.workspace.changelist();
        assert!(changelist.deletes.contains("src/main.rs"));
    }

    #[tokio::test]
    async fn test_delete_directory_fails() {
        let mut h = harness();
        let err = DeleteFileTool
            .execute(serde_json::json!({"path": "src"}), &mut h.ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Is a directory"));
    }

    #[tokio::test]
    async fn test_list_root_default() {
        let mut h = harness();
        let result = ListDirTool
            .execute(serde_json::json!({}), &mut h.ctx())
            .await
            .unwrap();
        assert_eq!(result.result["count"], 2);
        assert_eq!(result.result["truncated"], false);
    }
}
