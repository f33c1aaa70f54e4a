//! Tool registry: `tools/list` and `tools/call` (spec.md §4.6).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::content::CallToolResult;
use crate::dispatcher::BoxFuture;
use crate::error::McpError;
use crate::registry::{paginate, DEFAULT_PAGE_SIZE};

pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<CallToolResult, String>> + Send + Sync>;

#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub annotations: Option<Value>,
    pub handler: ToolHandler,
}

/// What `tools/list` returns per tool: everything but the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "outputSchema")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl From<&Tool> for ToolDescriptor {
    fn from(tool: &Tool) -> Self {
        ToolDescriptor {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            output_schema: tool.output_schema.clone(),
            annotations: tool.annotations.clone(),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, failing if one with the same name already exists.
    pub async fn register(&self, tool: Tool) -> Result<(), McpError> {
        let mut tools = self.tools.write().await;
        if tools.contains_key(&tool.name) {
            return Err(McpError::DuplicateHandler(format!("tool `{}`", tool.name)));
        }
        tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn list(&self, cursor: Option<&str>) -> Result<(Vec<ToolDescriptor>, Option<String>), McpError> {
        let tools = self.tools.read().await;
        let descriptors: Vec<ToolDescriptor> = tools.values().map(ToolDescriptor::from).collect();
        paginate(&descriptors, cursor, DEFAULT_PAGE_SIZE)
    }

    /// Validates arguments against the tool's input schema, invokes its
    /// callback, and validates structured output against the tool's output
    /// schema if one was declared. Tool-callback failures become
    /// `CallToolResult::error`, never a protocol error; only lookup and
    /// schema mismatches are (spec.md §4.6, §7).
    pub async fn call(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult, McpError> {
        let tool = {
            let tools = self.tools.read().await;
            tools
                .get(name)
                .cloned()
                .ok_or_else(|| McpError::InvalidParams(format!("unknown tool `{name}`")))
        }?;

        let arguments = arguments.unwrap_or_else(|| Value::Object(Map::new()));
        validate_schema(&tool.input_schema, &arguments)
            .map_err(|e| McpError::InvalidParams(format!("tool `{name}` arguments: {e}")))?;

        let result = match (tool.handler)(arguments).await {
            Ok(result) => result,
            Err(message) => CallToolResult::error(message),
        };

        if let Some(schema) = &tool.output_schema {
            if let Some(structured) = &result.structured_content {
                validate_schema(schema, structured)
                    .map_err(|e| McpError::InvalidParams(format!("tool `{name}` output: {e}")))?;
            }
        }

        Ok(result)
    }
}

#[cfg(feature = "schema-validation")]
fn validate_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| e.to_string())?;
    compiled
        .validate(instance)
        .map_err(|errors| errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; "))
}

#[cfg(not(feature = "schema-validation"))]
fn validate_schema(_schema: &Value, _instance: &Value) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> Tool {
        Tool {
            name: "echo".into(),
            description: Some("echoes input".into()),
            input_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
            output_schema: None,
            annotations: None,
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                    Ok(CallToolResult::ok(vec![crate::content::Content::text(text)]))
                })
            }),
        }
    }

    #[tokio::test]
    async fn registers_and_calls_tool() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool()).await.unwrap();
        let result = registry
            .call("echo", Some(json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(result.is_error, None);
    }

    #[tokio::test]
    async fn rejects_invalid_arguments() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool()).await.unwrap();
        let err = registry.call("echo", Some(json!({}))).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let registry = ToolRegistry::new();
        let err = registry.call("missing", None).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool()).await.unwrap();
        let err = registry.register(echo_tool()).await.unwrap_err();
        assert!(matches!(err, McpError::DuplicateHandler(_)));
    }
}
