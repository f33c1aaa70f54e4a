//! Root registry: client-side list of filesystem roots a server may query
//! via `roots/list` (spec.md §4.6).

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::McpError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Root {
    pub fn new(uri: impl Into<String>) -> Result<Self, McpError> {
        let uri = uri.into();
        if !uri.starts_with("file://") {
            return Err(McpError::InvalidParams(format!(
                "root uri must start with file://, got `{uri}`"
            )));
        }
        Ok(Self { uri, name: None })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Default)]
pub struct RootRegistry {
    roots: RwLock<Vec<Root>>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, roots: Vec<Root>) {
        *self.roots.write().await = roots;
    }

    pub async fn add(&self, root: Root) {
        self.roots.write().await.push(root);
    }

    pub async fn list(&self) -> Vec<Root> {
        self.roots.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_file_scheme() {
        assert!(Root::new("https://example.com").is_err());
        assert!(Root::new("file:///home/user/project").is_ok());
    }

    #[tokio::test]
    async fn lists_registered_roots() {
        let registry = RootRegistry::new();
        registry
            .add(Root::new("file:///home/user/project").unwrap().with_name("project"))
            .await;
        let roots = registry.list().await;
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name.as_deref(), Some("project"));
    }
}
