//! OpenAPI onboarding and the structured API call a run produces.

use std::collections::BTreeMap;
use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::ConfigError;
use crate::llm::StructuredOutput;
use crate::types::{EmbeddingItem, Metadata};

/// HTTP methods onboarded from each path item, in document order.
pub const METHODS: [&str; 5] = ["get", "post", "put", "patch", "delete"];

/// One operation of an OpenAPI document, ready to embed.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationDoc {
    pub id: String,
    /// Text sent to the embedding model.
    pub text: String,
    pub metadata: Metadata,
}

impl OperationDoc {
    pub fn into_item(self, vector: Vec<f32>) -> EmbeddingItem {
        EmbeddingItem {
            id: self.id,
            vector,
            metadata: self.metadata,
        }
    }
}

/// Read and parse every document in `paths`.
pub fn load_documents(paths: &[PathBuf]) -> Result<Vec<Value>, ConfigError> {
    paths
        .iter()
        .map(|path| {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::OpenApi {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let document: Value = serde_json::from_str(&contents).map_err(|e| ConfigError::OpenApi {
                path: path.clone(),
                message: format!("invalid JSON: {e}"),
            })?;
            if !document.get("paths").is_some_and(Value::is_object) {
                return Err(ConfigError::OpenApi {
                    path: path.clone(),
                    message: "document has no `paths` object".into(),
                });
            }
            Ok(document)
        })
        .collect()
}

/// Flatten a document into one [`OperationDoc`] per path and method.
pub fn extract_operations(document: &Value) -> Vec<OperationDoc> {
    let title = document
        .pointer("/info/title")
        .and_then(Value::as_str)
        .unwrap_or("API");
    let servers = document.get("servers").cloned().unwrap_or_else(|| json!([]));

    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut operations = Vec::new();
    for (path, item) in paths {
        for method in METHODS {
            let Some(operation) = item.get(method) else {
                continue;
            };
            let method = method.to_uppercase();
            let summary = str_field(operation, "summary");
            let description = str_field(operation, "description");

            let mut metadata = Map::new();
            metadata.insert("api".into(), json!(title));
            metadata.insert("method".into(), json!(method));
            metadata.insert("path".into(), json!(path));
            metadata.insert("summary".into(), json!(summary));
            metadata.insert("description".into(), json!(description));
            metadata.insert(
                "operation_id".into(),
                operation.get("operationId").cloned().unwrap_or(Value::Null),
            );
            metadata.insert("paths".into(), json!([path]));
            metadata.insert("servers".into(), servers.clone());
            if let Some(parameters) = operation.get("parameters") {
                metadata.insert("parameters".into(), parameters.clone());
            }

            let text = [format!("{title}: {method} {path}"), summary, description]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n");

            operations.push(OperationDoc {
                id: format!("{title} {method} {path}"),
                text,
                metadata,
            });
        }
    }
    operations
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The HTTP request a run settles on.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
pub struct ApiCall {
    /// Id of the chosen operation, exactly as listed in the prompt.
    pub operation_id: String,
    /// HTTP method in upper case.
    pub method: String,
    /// Path template of the operation, starting with `/`.
    pub path: String,
    /// Values for the `{placeholders}` in `path`.
    #[serde(default)]
    pub path_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub query_params: BTreeMap<String, Value>,
    /// JSON request body, if the operation takes one.
    #[serde(default)]
    pub body: Option<Value>,
    /// Why this call fulfils the objective.
    pub explanation: String,
}

impl StructuredOutput for ApiCall {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.operation_id.trim().is_empty() {
            errors.push("operation_id must not be empty".to_string());
        }
        if !METHODS.iter().any(|m| m.eq_ignore_ascii_case(&self.method)) {
            errors.push(format!(
                "method '{}' is not one of GET, POST, PUT, PATCH, DELETE",
                self.method
            ));
        }
        if !self.path.starts_with('/') {
            errors.push(format!("path '{}' must start with '/'", self.path));
        }
        errors
    }
}
