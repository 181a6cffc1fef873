//! Registry of the tools offered to the model.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::builtin::{
    DeleteFileTool, EditFileTool, ListDirTool, PostCommentTool, ReadFileTool,
    ReportLimitationTool, TriggerValidationTool, WriteFileTool,
};
use crate::tools::tool::Tool;

/// Tools keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tool set. The validation tool is only offered when a
    /// validation pipeline exists.
    pub fn builtin(validation: bool) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(ListDirTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(EditFileTool));
        registry.register(Arc::new(DeleteFileTool));
        registry.register(Arc::new(PostCommentTool));
        registry.register(Arc::new(ReportLimitationTool));
        if validation {
            registry.register(Arc::new(TriggerValidationTool));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!("Tool {} registered twice, keeping the latest", name);
        } else {
            tracing::debug!("Registered tool: {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions for the model request, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
