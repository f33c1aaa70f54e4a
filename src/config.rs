//! TOML-based server launch configuration, grounded in the teacher's
//! `mcp/config.rs`: a `[servers.<name>]` table under a config file, each
//! entry naming a transport to connect with. Generalized from Codex's
//! product-specific `McpConfigManager` (which also tracked tool
//! allow/deny lists and app runtimes) down to what a generic MCP embedder
//! needs: enough to resolve a name to a `Transport`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::value::Table as TomlTable;
use toml::Value as TomlValue;

use crate::error::McpError;
use crate::transport::Transport;

pub const DEFAULT_CONFIG_FILE: &str = "mcp.toml";
const SERVERS_KEY: &str = "servers";

/// One entry under `[servers]`, keyed by name when read out of the table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub definition: ServerDefinition,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerDefinition {
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    HttpSse(HttpSseConfig),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StdioConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpSseConfig {
    pub base_url: String,
    #[serde(default = "default_sse_path")]
    pub path: String,
    /// Name of an environment variable holding a bearer token to attach as
    /// `Authorization: Bearer <token>`. The engine passes this through
    /// unexamined; validating it is out of scope here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_env_var: Option<String>,
}

fn default_sse_path() -> String {
    "/mcp".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("config root at {path} must be a table")]
    InvalidRoot { path: PathBuf },

    #[error("`servers` must be a table in {path}")]
    InvalidServers { path: PathBuf },

    #[error("failed to decode servers: {0}")]
    DecodeServers(toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("server `{0}` already exists")]
    AlreadyExists(String),

    #[error("server `{0}` not found")]
    NotFound(String),

    #[error("server name may not be empty")]
    InvalidName,

    #[error("stdio/http transport support was compiled out of this build: {0}")]
    TransportDisabled(&'static str),

    #[error(transparent)]
    Transport(#[from] McpError),
}

/// Loads and mutates server launch definitions stored under `[servers]` in a
/// TOML file.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn list_servers(&self) -> Result<Vec<ServerEntry>, ConfigError> {
        let servers = self.read_servers()?;
        Ok(servers
            .into_iter()
            .map(|(name, definition)| ServerEntry { name, definition })
            .collect())
    }

    pub fn get_server(&self, name: &str) -> Result<ServerEntry, ConfigError> {
        let servers = self.read_servers()?;
        let definition = servers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        Ok(ServerEntry {
            name: name.to_string(),
            definition,
        })
    }

    pub fn add_server(&self, name: impl Into<String>, definition: ServerDefinition, overwrite: bool) -> Result<ServerEntry, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidName);
        }

        let (table, mut servers) = self.read_table_and_servers()?;
        if !overwrite && servers.contains_key(&name) {
            return Err(ConfigError::AlreadyExists(name));
        }
        servers.insert(name.clone(), definition.clone());
        self.persist_servers(table, &servers)?;

        Ok(ServerEntry { name, definition })
    }

    pub fn remove_server(&self, name: &str) -> Result<Option<ServerEntry>, ConfigError> {
        let (table, mut servers) = self.read_table_and_servers()?;
        let removed = servers.remove(name).map(|definition| ServerEntry {
            name: name.to_string(),
            definition,
        });
        if removed.is_some() {
            self.persist_servers(table, &servers)?;
        }
        Ok(removed)
    }

    /// Connects to a named server, building whichever `Transport`
    /// implementation its definition calls for.
    pub async fn connect(&self, name: &str) -> Result<Arc<dyn Transport>, ConfigError> {
        let entry = self.get_server(name)?;
        build_transport(&entry.definition.transport).await
    }

    fn read_servers(&self) -> Result<BTreeMap<String, ServerDefinition>, ConfigError> {
        let table = self.load_table()?;
        self.parse_servers(table.get(SERVERS_KEY))
    }

    fn read_table_and_servers(&self) -> Result<(TomlTable, BTreeMap<String, ServerDefinition>), ConfigError> {
        let table = self.load_table()?;
        let servers = self.parse_servers(table.get(SERVERS_KEY))?;
        Ok((table, servers))
    }

    fn parse_servers(&self, value: Option<&TomlValue>) -> Result<BTreeMap<String, ServerDefinition>, ConfigError> {
        let Some(value) = value else {
            return Ok(BTreeMap::new());
        };
        let table = value.as_table().ok_or_else(|| ConfigError::InvalidServers {
            path: self.config_path.clone(),
        })?;
        TomlValue::Table(table.clone())
            .try_into()
            .map_err(ConfigError::DecodeServers)
    }

    fn persist_servers(&self, mut table: TomlTable, servers: &BTreeMap<String, ServerDefinition>) -> Result<(), ConfigError> {
        if servers.is_empty() {
            table.remove(SERVERS_KEY);
        } else {
            let value = TomlValue::try_from(servers.clone()).map_err(ConfigError::Serialize)?;
            table.insert(SERVERS_KEY.to_string(), value);
        }
        self.write_table(table)
    }

    fn load_table(&self) -> Result<TomlTable, ConfigError> {
        if !self.config_path.exists() {
            return Ok(TomlTable::new());
        }
        let contents = fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Read {
            path: self.config_path.clone(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(TomlTable::new());
        }
        let value: TomlValue = contents.parse().map_err(|source| ConfigError::Parse {
            path: self.config_path.clone(),
            source,
        })?;
        value.as_table().cloned().ok_or_else(|| ConfigError::InvalidRoot {
            path: self.config_path.clone(),
        })
    }

    fn write_table(&self, table: TomlTable) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized = toml::to_string_pretty(&TomlValue::Table(table)).map_err(ConfigError::Serialize)?;
        fs::write(&self.config_path, serialized).map_err(|source| ConfigError::Write {
            path: self.config_path.clone(),
            source,
        })
    }
}

#[cfg(feature = "stdio")]
async fn build_transport(transport: &TransportConfig) -> Result<Arc<dyn Transport>, ConfigError> {
    match transport {
        TransportConfig::Stdio(config) => {
            let t = crate::transport::stdio::StdioTransport::spawn_with_env(&config.command, &config.args, &config.env).await?;
            Ok(Arc::new(t))
        }
        #[cfg(feature = "http")]
        TransportConfig::HttpSse(config) => {
            let t = connect_http_sse(config).await?;
            Ok(Arc::new(t))
        }
        #[cfg(not(feature = "http"))]
        TransportConfig::HttpSse(_) => Err(ConfigError::TransportDisabled("http")),
    }
}

#[cfg(not(feature = "stdio"))]
async fn build_transport(transport: &TransportConfig) -> Result<Arc<dyn Transport>, ConfigError> {
    match transport {
        TransportConfig::Stdio(_) => Err(ConfigError::TransportDisabled("stdio")),
        #[cfg(feature = "http")]
        TransportConfig::HttpSse(config) => {
            let t = connect_http_sse(config).await?;
            Ok(Arc::new(t))
        }
        #[cfg(not(feature = "http"))]
        TransportConfig::HttpSse(_) => Err(ConfigError::TransportDisabled("http")),
    }
}

#[cfg(feature = "http")]
async fn connect_http_sse(config: &HttpSseConfig) -> Result<crate::transport::http_sse::HttpSseClientTransport, ConfigError> {
    let bearer_token = match &config.bearer_env_var {
        Some(var) => Some(std::env::var(var).map_err(|_| {
            ConfigError::Transport(McpError::InvalidParams(format!("environment variable `{var}` is not set")))
        })?),
        None => None,
    };
    Ok(crate::transport::http_sse::HttpSseClientTransport::connect(
        config.base_url.clone(),
        config.path.clone(),
        bearer_token,
    )
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_stdio_server_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("mcp.toml"));

        let definition = ServerDefinition {
            transport: TransportConfig::Stdio(StdioConfig {
                command: "my-server".into(),
                args: vec!["--flag".into()],
                env: BTreeMap::new(),
            }),
            description: Some("a test server".into()),
        };
        manager.add_server("demo", definition.clone(), false).unwrap();

        let entry = manager.get_server("demo").unwrap();
        assert_eq!(entry.definition, definition);
    }

    #[test]
    fn rejects_duplicate_names_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("mcp.toml"));
        let definition = ServerDefinition {
            transport: TransportConfig::HttpSse(HttpSseConfig {
                base_url: "http://localhost:8080".into(),
                path: default_sse_path(),
                bearer_env_var: None,
            }),
            description: None,
        };
        manager.add_server("demo", definition.clone(), false).unwrap();
        let err = manager.add_server("demo", definition, false).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyExists(_)));
    }

    #[test]
    fn removes_server() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("mcp.toml"));
        let definition = ServerDefinition {
            transport: TransportConfig::Stdio(StdioConfig {
                command: "my-server".into(),
                args: vec![],
                env: BTreeMap::new(),
            }),
            description: None,
        };
        manager.add_server("demo", definition, false).unwrap();
        assert!(manager.remove_server("demo").unwrap().is_some());
        assert!(manager.list_servers().unwrap().is_empty());
    }
}
