//! Couchbase integration for the Synaptic framework.
//!
//! This crate provides Couchbase-backed implementations of the core traits:
//!
//! - [`CouchbaseCache`]: exact-match [`LlmCache`](synaptic_core::LlmCache)
//!   keyed on a hash of the prompt and model configuration.
//! - [`CouchbaseSemanticCache`]: [`LlmCache`](synaptic_core::LlmCache) that
//!   returns the result of the most similar earlier prompt.
//! - [`CouchbaseChatMessageHistory`]: session-scoped
//!   [`ChatMessageHistory`](synaptic_core::ChatMessageHistory).
//! - [`CouchbaseSearchVectorStore`] and [`CouchbaseQueryVectorStore`]:
//!   [`VectorStore`](synaptic_core::VectorStore)s over the Search and Query
//!   services.
//!
//! All components talk to the database through a shared
//! [`CouchbaseCluster`] handle; [`HttpCluster`] implements it over the
//! cluster's REST services. Every component checks at construction that its
//! bucket, scope and collection exist.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use synaptic_couchbase::{
//!     CouchbaseCache, CouchbaseCacheConfig, CouchbaseCluster, CouchbaseConfig, HttpCluster,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster: Arc<dyn CouchbaseCluster> =
//!     Arc::new(HttpCluster::new(CouchbaseConfig::new("localhost", "Administrator", "password"))?);
//!
//! let config = CouchbaseCacheConfig::new("langchain", "_default", "cache")
//!     .with_ttl(Duration::from_secs(3600));
//! let cache = CouchbaseCache::new(cluster, config).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod chat_history;
pub mod cluster;
mod error;
mod generations;
mod http;
mod semantic_cache;
pub mod validation;
pub mod vector_store;

pub use cache::{CouchbaseCache, CouchbaseCacheConfig};
pub use chat_history::{ChatHistoryConfig, CouchbaseChatMessageHistory};
pub use cluster::{CouchbaseCluster, Keyspace};
pub use error::CouchbaseError;
pub use generations::{dumps_generations, loads_generations};
pub use http::{CouchbaseConfig, HttpCluster};
pub use semantic_cache::{CouchbaseSemanticCache, SemanticCacheConfig};
pub use validation::{validate_ttl, ConnectionValidator, ResolvedKeyspace};
pub use vector_store::{
    AddTextsOptions, CouchbaseQueryVectorStore, CouchbaseSearchVectorStore, CreateIndexOptions,
    DistanceStrategy, IndexType, QueryParams, QueryVectorConfig, SearchParams, SearchQuery,
    SearchVectorConfig, DEFAULT_BATCH_SIZE,
};

// Re-export core traits for convenience.
pub use synaptic_core::{
    ChatMessageHistory, Document, Embeddings, Generation, LlmCache, Message, SynapticError,
    VectorStore,
};
