//! Prompt registry: `prompts/list` and `prompts/get` (spec.md §4.6).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::content::PromptMessage;
use crate::dispatcher::BoxFuture;
use crate::error::McpError;
use crate::registry::{paginate, DEFAULT_PAGE_SIZE};

pub type PromptHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Vec<PromptMessage>, String>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Clone)]
pub struct Prompt {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    pub handler: PromptHandler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

impl From<&Prompt> for PromptDescriptor {
    fn from(prompt: &Prompt) -> Self {
        PromptDescriptor {
            name: prompt.name.clone(),
            description: prompt.description.clone(),
            arguments: prompt.arguments.clone(),
        }
    }
}

#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<BTreeMap<String, Prompt>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, prompt: Prompt) -> Result<(), McpError> {
        let mut prompts = self.prompts.write().await;
        if prompts.contains_key(&prompt.name) {
            return Err(McpError::DuplicateHandler(format!("prompt `{}`", prompt.name)));
        }
        prompts.insert(prompt.name.clone(), prompt);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.prompts.write().await.remove(name).is_some()
    }

    pub async fn list(&self, cursor: Option<&str>) -> Result<(Vec<PromptDescriptor>, Option<String>), McpError> {
        let prompts = self.prompts.read().await;
        let descriptors: Vec<PromptDescriptor> = prompts.values().map(PromptDescriptor::from).collect();
        paginate(&descriptors, cursor, DEFAULT_PAGE_SIZE)
    }

    pub async fn get(&self, name: &str, arguments: Option<Value>) -> Result<Vec<PromptMessage>, McpError> {
        let prompt = {
            let prompts = self.prompts.read().await;
            prompts
                .get(name)
                .cloned()
                .ok_or_else(|| McpError::InvalidParams(format!("unknown prompt `{name}`")))
        }?;

        let arguments = arguments.unwrap_or_else(|| Value::Object(Map::new()));
        for arg in &prompt.arguments {
            if arg.required.unwrap_or(false) && arguments.get(&arg.name).is_none() {
                return Err(McpError::InvalidParams(format!(
                    "prompt `{name}` missing required argument `{}`",
                    arg.name
                )));
            }
        }

        (prompt.handler)(arguments)
            .await
            .map_err(|e| McpError::InvalidParams(format!("prompt `{name}`: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_prompt() -> Prompt {
        Prompt {
            name: "greeting".into(),
            description: None,
            arguments: vec![PromptArgument {
                name: "name".into(),
                description: None,
                required: Some(true),
            }],
            handler: Arc::new(|args| {
                Box::pin(async move {
                    let name = args.get("name").and_then(Value::as_str).unwrap_or("world");
                    Ok(vec![PromptMessage {
                        role: crate::content::Role::User,
                        content: crate::content::Content::text(format!("Hello, {name}!")),
                    }])
                })
            }),
        }
    }

    #[tokio::test]
    async fn gets_prompt_with_arguments() {
        let registry = PromptRegistry::new();
        registry.register(greeting_prompt()).await.unwrap();
        let messages = registry
            .get("greeting", Some(serde_json::json!({"name": "Ada"})))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn missing_required_argument_is_invalid_params() {
        let registry = PromptRegistry::new();
        registry.register(greeting_prompt()).await.unwrap();
        let err = registry.get("greeting", None).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidParams(_)));
    }
}
