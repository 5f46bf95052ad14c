use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Represents a chat message. Tagged enum with System, Human, AI, Tool and Chat variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        additional_kwargs: HashMap<String, Value>,
    },
    #[serde(rename = "human")]
    Human {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        additional_kwargs: HashMap<String, Value>,
    },
    #[serde(rename = "assistant")]
    AI {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        additional_kwargs: HashMap<String, Value>,
    },
    #[serde(rename = "tool")]
    Tool {
        content: String,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        additional_kwargs: HashMap<String, Value>,
    },
    #[serde(rename = "chat")]
    Chat {
        custom_role: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        additional_kwargs: HashMap<String, Value>,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
            id: None,
            name: None,
            additional_kwargs: HashMap::new(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Message::Human {
            content: content.into(),
            id: None,
            name: None,
            additional_kwargs: HashMap::new(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Message::AI {
            content: content.into(),
            id: None,
            name: None,
            additional_kwargs: HashMap::new(),
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            id: None,
            name: None,
            additional_kwargs: HashMap::new(),
        }
    }

    pub fn chat(role: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Chat {
            custom_role: role.into(),
            content: content.into(),
            id: None,
            name: None,
            additional_kwargs: HashMap::new(),
        }
    }

    pub fn with_id(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            Message::System { id, .. }
            | Message::Human { id, .. }
            | Message::AI { id, .. }
            | Message::Tool { id, .. }
            | Message::Chat { id, .. } => *id = Some(value.into()),
        }
        self
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content, .. }
            | Message::Human { content, .. }
            | Message::AI { content, .. }
            | Message::Tool { content, .. }
            | Message::Chat { content, .. } => content,
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Message::System { .. } => "system",
            Message::Human { .. } => "human",
            Message::AI { .. } => "assistant",
            Message::Tool { .. } => "tool",
            Message::Chat { custom_role, .. } => custom_role,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Message::System { id, .. }
            | Message::Human { id, .. }
            | Message::AI { id, .. }
            | Message::Tool { id, .. }
            | Message::Chat { id, .. } => id.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// A single candidate output produced by a language model.
///
/// `Text` is a plain completion; `Chat` additionally carries the message the
/// chat model produced. The `type` tag keeps the two distinguishable once
/// serialized, so heterogeneous lists survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Generation {
    #[serde(rename = "Generation")]
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_info: Option<HashMap<String, Value>>,
    },
    #[serde(rename = "ChatGeneration")]
    Chat {
        text: String,
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_info: Option<HashMap<String, Value>>,
    },
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Generation::Text {
            text: text.into(),
            generation_info: None,
        }
    }

    /// Build a chat generation whose text mirrors the message content.
    pub fn chat(message: Message) -> Self {
        Generation::Chat {
            text: message.content().to_string(),
            message,
            generation_info: None,
        }
    }

    pub fn with_generation_info(mut self, info: HashMap<String, Value>) -> Self {
        match &mut self {
            Generation::Text {
                generation_info, ..
            }
            | Generation::Chat {
                generation_info, ..
            } => *generation_info = Some(info),
        }
        self
    }

    pub fn as_text(&self) -> &str {
        match self {
            Generation::Text { text, .. } | Generation::Chat { text, .. } => text,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Generation::Text { .. } => None,
            Generation::Chat { message, .. } => Some(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for the Synaptic framework with variants covering the storage subsystems.
#[derive(Debug, Error)]
pub enum SynapticError {
    #[error("memory error: {0}")]
    Memory(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("parsing error: {0}")]
    Parsing(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("vector store error: {0}")]
    VectorStore(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

// ---------------------------------------------------------------------------
// Embeddings trait
// ---------------------------------------------------------------------------

/// Trait for embedding text into vectors.
#[async_trait]
pub trait Embeddings: Send + Sync {
    /// Embed multiple texts (for batch document embedding).
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SynapticError>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, SynapticError>;
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A document with content and metadata, used throughout the retrieval pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(
        id: impl Into<String>,
        content: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// VectorStore trait
// ---------------------------------------------------------------------------

/// Trait for vector storage backends.
///
/// Implementations own their embedding function; the query text is embedded
/// by the store before it is sent to the backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Add documents to the store, computing their embeddings. Empty ids are generated.
    async fn add_documents(&self, docs: Vec<Document>) -> Result<Vec<String>, SynapticError>;

    /// Search for similar documents by query string.
    async fn similarity_search(&self, query: &str, k: usize)
        -> Result<Vec<Document>, SynapticError>;

    /// Search with the backend's raw relevance scores, in backend order.
    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(Document, f32)>, SynapticError>;

    /// Search by pre-computed embedding vector instead of text query.
    async fn similarity_search_by_vector(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Document>, SynapticError>;

    /// Delete documents by ID. Returns `true` when every deletion succeeded.
    async fn delete(&self, ids: &[&str]) -> Result<bool, SynapticError>;
}

// ---------------------------------------------------------------------------
// LlmCache trait
// ---------------------------------------------------------------------------

/// Trait for caching LLM generations keyed by prompt and model configuration.
///
/// A cache is advisory: lookups may always miss and writes are best-effort,
/// so none of these methods can fail the caller.
#[async_trait]
pub trait LlmCache: Send + Sync {
    /// Look up cached generations for a prompt and serialized model configuration.
    async fn lookup(&self, prompt: &str, llm_string: &str) -> Option<Vec<Generation>>;
    /// Store generations for a prompt and serialized model configuration.
    async fn update(&self, prompt: &str, llm_string: &str, generations: &[Generation]);
    /// Clear all entries from the cache.
    async fn clear(&self);
}

// ---------------------------------------------------------------------------
// ChatMessageHistory trait
// ---------------------------------------------------------------------------

/// Append-only conversation history bound to a single session.
#[async_trait]
pub trait ChatMessageHistory: Send + Sync {
    /// All messages of the session, oldest first.
    async fn messages(&self) -> Vec<Message>;

    async fn add_message(&self, message: Message);

    async fn add_messages(&self, messages: Vec<Message>) {
        for message in messages {
            self.add_message(message).await;
        }
    }

    /// Remove every message of the session.
    async fn clear(&self);
}
