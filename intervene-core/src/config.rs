use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::ModelTier;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const DEFAULT_CRITICAL_MODEL: &str = "gpt-4-0613";
const DEFAULT_TRIVIAL_MODEL: &str = "gpt-3.5-turbo-0613";
const DEFAULT_SEARCH_LIMIT: usize = 5;
const DEFAULT_INDEX_PATH: &str = "intervene-index.json";
const DEFAULT_MIRROR_PATH: &str = "intervene-mirror.db";
const DEFAULT_CHROMA_HOST: &str = "http://0.0.0.0:8000";
const DEFAULT_CHROMA_COLLECTION: &str = "intervene-parser";
const DEFAULT_PINECONE_CONTROLLER: &str = "https://api.pinecone.io";
const DEFAULT_CONTEXT: &str = "{\n  \n}";

/// Shortest objective accepted by `Config::validate`.
pub const MIN_OBJECTIVE_CHARS: usize = 10;

/// Problems with the configuration. Always fatal and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to load OpenAPI document '{}': {message}", path.display())]
    OpenApi { path: PathBuf, message: String },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Config {
    /// What the user wants to accomplish, in natural language.
    #[serde(default)]
    pub objective: String,
    /// JSON object mapping context names to JSON schemas.
    #[serde(default = "default_context")]
    pub context: String,
    /// Paths to OpenAPI documents (JSON) to onboard on every run.
    #[serde(default)]
    pub openapis: Vec<PathBuf>,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_context() -> String {
    DEFAULT_CONTEXT.to_string()
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct OpenAiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_openai_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: None,
            endpoint: default_openai_endpoint(),
            embedding_model: default_embedding_model(),
        }
    }
}

impl OpenAiConfig {
    pub fn resolve_api_key(&self) -> Result<String, String> {
        resolve_secret(&self.api_key, &self.api_key_env)
    }
}

fn default_openai_endpoint() -> String {
    DEFAULT_OPENAI_ENDPOINT.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

/// Resolve a secret from an inline value, falling back to an environment variable.
fn resolve_secret(value: &Option<String>, env: &Option<String>) -> Result<String, String> {
    if let Some(key) = value {
        if !key.is_empty() {
            return Ok(key.clone());
        }
    }
    match env {
        Some(var_name) => std::env::var(var_name).map_err(|_| {
            format!("environment variable '{var_name}' is not set (required by api_key_env)")
        }),
        None => Ok(String::new()),
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub default_tier: ModelTier,
    #[serde(default = "default_critical_model")]
    pub critical_model: String,
    #[serde(default = "default_trivial_model")]
    pub trivial_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_tier: ModelTier::default(),
            critical_model: default_critical_model(),
            trivial_model: default_trivial_model(),
        }
    }
}

impl LlmConfig {
    /// Model identifier used for the given tier.
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Critical => &self.critical_model,
            ModelTier::Trivial => &self.trivial_model,
        }
    }
}

fn default_critical_model() -> String {
    DEFAULT_CRITICAL_MODEL.to_string()
}

fn default_trivial_model() -> String {
    DEFAULT_TRIVIAL_MODEL.to_string()
}

/// Which vector-store backend a run uses.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// In-process flat index persisted to a local file.
    #[default]
    Local,
    Chroma,
    Pinecone,
}

impl std::fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Chroma => write!(f, "chroma"),
            Self::Pinecone => write!(f, "pinecone"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub backend: VectorBackend,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    /// Metadata filter applied to every search, in selector syntax.
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_filter: Option<serde_json::Value>,
    #[serde(default)]
    pub local: LocalIndexConfig,
    #[serde(default)]
    pub chroma: ChromaConfig,
    #[serde(default)]
    pub pinecone: PineconeConfig,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::default(),
            search_limit: default_search_limit(),
            where_filter: None,
            local: LocalIndexConfig::default(),
            chroma: ChromaConfig::default(),
            pinecone: PineconeConfig::default(),
        }
    }
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct LocalIndexConfig {
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
}

impl Default for LocalIndexConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from(DEFAULT_INDEX_PATH)
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ChromaConfig {
    #[serde(default = "default_chroma_host")]
    pub host: String,
    #[serde(default = "default_chroma_collection")]
    pub collection: String,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            host: default_chroma_host(),
            collection: default_chroma_collection(),
        }
    }
}

fn default_chroma_host() -> String {
    DEFAULT_CHROMA_HOST.to_string()
}

fn default_chroma_collection() -> String {
    DEFAULT_CHROMA_COLLECTION.to_string()
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PineconeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Control-plane endpoint used to look up the index host.
    #[serde(default = "default_pinecone_controller")]
    pub controller: String,
    /// Data-plane host. When set, the control-plane lookup is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Default for PineconeConfig {
    fn default() -> Self {
        Self {
            index: None,
            api_key: None,
            api_key_env: None,
            controller: default_pinecone_controller(),
            host: None,
        }
    }
}

impl PineconeConfig {
    pub fn resolve_api_key(&self) -> Result<String, String> {
        resolve_secret(&self.api_key, &self.api_key_env)
    }
}

fn default_pinecone_controller() -> String {
    DEFAULT_PINECONE_CONTROLLER.to_string()
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct StorageConfig {
    /// SQLite file backing the mirror store.
    #[serde(default = "default_mirror_path")]
    pub mirror: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mirror: default_mirror_path(),
        }
    }
}

fn default_mirror_path() -> PathBuf {
    PathBuf::from(DEFAULT_MIRROR_PATH)
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// A copy with every inline secret removed, safe to hand to a client.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.openai.api_key = copy.openai.api_key.as_ref().map(|_| "********".into());
        copy.vector_store.pinecone.api_key = copy
            .vector_store
            .pinecone
            .api_key
            .as_ref()
            .map(|_| "********".into());
        copy
    }

    /// Parse `context` into a map of name to JSON schema.
    pub fn context_schemas(&self) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
        let parsed: serde_json::Value = serde_json::from_str(&self.context)
            .map_err(|e| ConfigError::Invalid(format!("context is not valid JSON: {e}")))?;
        let serde_json::Value::Object(map) = parsed else {
            return Err(ConfigError::Invalid("context must be a JSON object".into()));
        };
        for (name, schema) in &map {
            if !schema.is_object() && !schema.is_boolean() {
                return Err(ConfigError::Invalid(format!(
                    "context entry '{name}' is not a JSON schema"
                )));
            }
        }
        Ok(map)
    }

    /// Check everything a run needs before any network call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.objective.trim().chars().count() < MIN_OBJECTIVE_CHARS {
            return Err(ConfigError::Invalid(format!(
                "objective must be at least {MIN_OBJECTIVE_CHARS} characters"
            )));
        }

        let key = self.openai.resolve_api_key().map_err(ConfigError::Invalid)?;
        if key.is_empty() {
            return Err(ConfigError::Invalid(
                "openai.api_key (or openai.api_key_env) is required".into(),
            ));
        }

        self.context_schemas()?;

        if self.vector_store.search_limit == 0 {
            return Err(ConfigError::Invalid(
                "vector_store.search_limit must be greater than zero".into(),
            ));
        }
        if let Some(filter) = &self.vector_store.where_filter {
            if !filter.is_object() {
                return Err(ConfigError::Invalid(
                    "vector_store.where must be a table".into(),
                ));
            }
            crate::selector::Selector::parse(filter)
                .map_err(|e| ConfigError::Invalid(format!("vector_store.where: {e}")))?;
        }

        match self.vector_store.backend {
            VectorBackend::Local => {}
            VectorBackend::Chroma => {
                let chroma = &self.vector_store.chroma;
                url::Url::parse(&chroma.host).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "vector_store.chroma.host '{}' is not a valid URL: {e}",
                        chroma.host
                    ))
                })?;
                if chroma.collection.is_empty() {
                    return Err(ConfigError::Invalid(
                        "vector_store.chroma.collection is required".into(),
                    ));
                }
            }
            VectorBackend::Pinecone => {
                let pinecone = &self.vector_store.pinecone;
                if pinecone.index.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::Invalid(
                        "vector_store.pinecone.index is required when backend = \"pinecone\"".into(),
                    ));
                }
                let key = pinecone.resolve_api_key().map_err(ConfigError::Invalid)?;
                if key.is_empty() {
                    return Err(ConfigError::Invalid(
                        "vector_store.pinecone.api_key (or api_key_env) is required".into(),
                    ));
                }
                if let Some(host) = &pinecone.host {
                    url::Url::parse(host).map_err(|e| {
                        ConfigError::Invalid(format!(
                            "vector_store.pinecone.host '{host}' is not a valid URL: {e}"
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}
