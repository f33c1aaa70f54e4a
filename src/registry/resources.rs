//! Resource registry: fixed and templated resources, `resources/read`,
//! subscription bookkeeping for `resources/updated` (spec.md §4.6).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::content::ResourceContents;
use crate::dispatcher::BoxFuture;
use crate::error::McpError;
use crate::registry::{paginate, DEFAULT_PAGE_SIZE};
use crate::uri_template::UriTemplate;

pub type ResourceReader =
    Arc<dyn Fn(std::collections::BTreeMap<String, String>) -> BoxFuture<'static, Result<ResourceContents, String>> + Send + Sync>;

#[derive(Clone)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub reader: ResourceReader,
}

#[derive(Clone)]
pub struct ResourceTemplate {
    pub name: String,
    pub template: UriTemplate,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub reader: ResourceReader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl From<&Resource> for ResourceDescriptor {
    fn from(resource: &Resource) -> Self {
        ResourceDescriptor {
            uri: resource.uri.clone(),
            name: resource.name.clone(),
            description: resource.description.clone(),
            mime_type: resource.mime_type.clone(),
            size: resource.size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTemplateDescriptor {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
}

impl From<&ResourceTemplate> for ResourceTemplateDescriptor {
    fn from(t: &ResourceTemplate) -> Self {
        ResourceTemplateDescriptor {
            uri_template: t.template.as_str().to_string(),
            name: t.name.clone(),
            description: t.description.clone(),
            mime_type: t.mime_type.clone(),
        }
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    fixed: RwLock<BTreeMap<String, Resource>>,
    templates: RwLock<Vec<ResourceTemplate>>,
    subscriptions: RwLock<BTreeSet<String>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_fixed(&self, resource: Resource) -> Result<(), McpError> {
        let mut fixed = self.fixed.write().await;
        if fixed.contains_key(&resource.uri) {
            return Err(McpError::DuplicateHandler(format!("resource `{}`", resource.uri)));
        }
        fixed.insert(resource.uri.clone(), resource);
        Ok(())
    }

    pub async fn register_template(&self, template: ResourceTemplate) -> Result<(), McpError> {
        let mut templates = self.templates.write().await;
        if templates.iter().any(|t| t.name == template.name) {
            return Err(McpError::DuplicateHandler(format!(
                "resource template `{}`",
                template.name
            )));
        }
        templates.push(template);
        Ok(())
    }

    pub async fn list(&self, cursor: Option<&str>) -> Result<(Vec<ResourceDescriptor>, Option<String>), McpError> {
        let fixed = self.fixed.read().await;
        let descriptors: Vec<ResourceDescriptor> = fixed.values().map(ResourceDescriptor::from).collect();
        paginate(&descriptors, cursor, DEFAULT_PAGE_SIZE)
    }

    pub async fn list_templates(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<ResourceTemplateDescriptor>, Option<String>), McpError> {
        let templates = self.templates.read().await;
        let descriptors: Vec<ResourceTemplateDescriptor> =
            templates.iter().map(ResourceTemplateDescriptor::from).collect();
        paginate(&descriptors, cursor, DEFAULT_PAGE_SIZE)
    }

    /// Fixed-match first, then the first matching template, per spec.md §4.6.
    pub async fn read(&self, uri: &str) -> Result<ResourceContents, McpError> {
        if let Some(resource) = self.fixed.read().await.get(uri).cloned() {
            return (resource.reader)(Default::default())
                .await
                .map_err(|e| McpError::Internal(format!("resource `{uri}`: {e}")));
        }

        let templates = self.templates.read().await;
        for template in templates.iter() {
            if let Some(bindings) = template.template.matches(uri) {
                return (template.reader)(bindings)
                    .await
                    .map_err(|e| McpError::Internal(format!("resource `{uri}`: {e}")));
            }
        }

        Err(McpError::InvalidParams(format!("unknown resource `{uri}`")))
    }

    /// Capability-gating happens one layer up, in the session's built-in
    /// handler, which only calls this once it has confirmed
    /// `resources.subscribe` was advertised.
    pub async fn subscribe(&self, uri: &str) -> Result<(), McpError> {
        self.subscriptions.write().await.insert(uri.to_string());
        Ok(())
    }

    pub async fn unsubscribe(&self, uri: &str) -> Result<(), McpError> {
        self.subscriptions.write().await.remove(uri);
        Ok(())
    }

    pub async fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.read().await.contains(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_resource() -> Resource {
        Resource {
            uri: "file:///readme.md".into(),
            name: "readme".into(),
            description: None,
            mime_type: Some("text/markdown".into()),
            size: None,
            reader: Arc::new(|_| {
                Box::pin(async move {
                    Ok(ResourceContents::Text {
                        uri: "file:///readme.md".into(),
                        mime_type: Some("text/markdown".into()),
                        text: "# hi".into(),
                    })
                })
            }),
        }
    }

    fn project_template() -> ResourceTemplate {
        ResourceTemplate {
            name: "project-file".into(),
            template: UriTemplate::parse("file:///projects/{project}/{file}").unwrap(),
            description: None,
            mime_type: None,
            reader: Arc::new(|vars| {
                Box::pin(async move {
                    let project = vars.get("project").cloned().unwrap_or_default();
                    let file = vars.get("file").cloned().unwrap_or_default();
                    Ok(ResourceContents::Text {
                        uri: format!("file:///projects/{project}/{file}"),
                        mime_type: None,
                        text: format!("contents of {file} in {project}"),
                    })
                })
            }),
        }
    }

    #[tokio::test]
    async fn reads_fixed_resource() {
        let registry = ResourceRegistry::new();
        registry.register_fixed(static_resource()).await.unwrap();
        let contents = registry.read("file:///readme.md").await.unwrap();
        assert!(matches!(contents, ResourceContents::Text { .. }));
    }

    #[tokio::test]
    async fn reads_templated_resource_with_bindings() {
        let registry = ResourceRegistry::new();
        registry.register_template(project_template()).await.unwrap();
        let contents = registry.read("file:///projects/acme/readme.md").await.unwrap();
        match contents {
            ResourceContents::Text { text, .. } => assert!(text.contains("acme")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn fixed_match_wins_over_template() {
        let registry = ResourceRegistry::new();
        registry.register_fixed(static_resource()).await.unwrap();
        registry
            .register_template(ResourceTemplate {
                name: "any".into(),
                template: UriTemplate::parse("file:///{+path}").unwrap(),
                description: None,
                mime_type: None,
                reader: Arc::new(|_| Box::pin(async move {
                    Ok(ResourceContents::Text {
                        uri: "file:///readme.md".into(),
                        mime_type: None,
                        text: "from template".into(),
                    })
                })),
            })
            .await
            .unwrap();
        let contents = registry.read("file:///readme.md").await.unwrap();
        match contents {
            ResourceContents::Text { text, .. } => assert_eq!(text, "# hi"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_uri_is_invalid_params() {
        let registry = ResourceRegistry::new();
        let err = registry.read("file:///missing").await.unwrap_err();
        assert!(matches!(err, McpError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn subscription_lifecycle() {
        let registry = ResourceRegistry::new();
        registry.subscribe("file:///readme.md").await.unwrap();
        assert!(registry.is_subscribed("file:///readme.md").await);
        registry.unsubscribe("file:///readme.md").await.unwrap();
        assert!(!registry.is_subscribed("file:///readme.md").await);
    }
}
