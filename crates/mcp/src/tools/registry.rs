// Tool registry and schema helpers

use crate::protocol::{CallToolResult, ToolSchema};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema for MCP
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments
    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult>;
}

/// Tool registry for managing available tools
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        self.tools.insert(schema.name.clone(), tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all tool schemas, ordered by name
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run a tool. Execution errors come back as an error result, not `Err`.
    /// Returns `None` for unknown tools.
    pub async fn call(&self, name: &str, arguments: serde_json::Value) -> Option<CallToolResult> {
        let tool = self.get(name)?;
        let result = match tool.execute(arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Tool {} failed: {:#}", name, e);
                CallToolResult::error(format!("{:#}", e))
            }
        };
        Some(result)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_boolean(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "boolean",
        "description": description
    })
}
