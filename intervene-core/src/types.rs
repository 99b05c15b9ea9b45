use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered metadata attached to every stored item.
pub type Metadata = Map<String, Value>;

/// A vector plus its metadata, as written to a vector store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EmbeddingItem {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

/// The authoritative copy of an `EmbeddingItem` held by the mirror store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MirrorDocument {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl From<EmbeddingItem> for MirrorDocument {
    fn from(item: EmbeddingItem) -> Self {
        Self {
            id: item.id,
            vector: item.vector,
            metadata: item.metadata,
        }
    }
}

/// A nearest-neighbour hit. Lower distance means closer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub distance: f32,
    pub metadata: Metadata,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Cost/capability class of the chat model used for a request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Trivial,
    #[default]
    Critical,
}

/// Token accounting reported by the completion provider.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}
