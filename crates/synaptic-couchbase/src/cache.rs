use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use synaptic_core::{Generation, LlmCache};
use tracing::{Instrument, Span};

use crate::cluster::Keyspace;
use crate::generations::{dumps_generations, loads_generations};
use crate::validation::{validate_ttl, ConnectionValidator, ResolvedKeyspace};
use crate::{CouchbaseCluster, CouchbaseError};

const PROMPT_FIELD: &str = "prompt";
const LLM_FIELD: &str = "llm";
const RETURN_VAL_FIELD: &str = "return_val";

/// Configuration for [`CouchbaseCache`].
#[derive(Debug, Clone)]
pub struct CouchbaseCacheConfig {
    pub keyspace: Keyspace,
    /// Optional expiry applied to every cache entry.
    pub ttl: Option<Duration>,
}

impl CouchbaseCacheConfig {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            keyspace: Keyspace::new(bucket, scope, collection),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Exact-match LLM cache stored in a Couchbase collection.
///
/// Each entry lives under `sha256(prompt ++ llm_string)` and holds the prompt,
/// the model configuration string and the encoded generation list. Writes
/// always replace the whole entry.
pub struct CouchbaseCache {
    resolved: ResolvedKeyspace,
    ttl: Option<Duration>,
    span: Span,
}

impl CouchbaseCache {
    /// Validate the keyspace and TTL and build the cache.
    pub async fn new(
        cluster: Arc<dyn CouchbaseCluster>,
        config: CouchbaseCacheConfig,
    ) -> Result<Self, CouchbaseError> {
        let span = tracing::info_span!(
            "couchbase_cache",
            keyspace = %config.keyspace,
        );
        let resolved = ConnectionValidator::validate(cluster, config.keyspace).await?;
        let ttl = validate_ttl(config.ttl)?;
        Ok(Self {
            resolved,
            ttl,
            span,
        })
    }

    /// Replace the span that cache events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.resolved.keyspace()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// The document key for a prompt and model configuration.
    pub fn cache_key(prompt: &str, llm_string: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update(llm_string.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up an entry, distinguishing a miss (`Ok(None)`) from a failed read.
    ///
    /// An entry whose payload cannot be decoded is a miss.
    pub async fn try_lookup(
        &self,
        prompt: &str,
        llm_string: &str,
    ) -> Result<Option<Vec<Generation>>, CouchbaseError> {
        let key = Self::cache_key(prompt, llm_string);
        let doc = match self.resolved.get(&key).await {
            Ok(doc) => doc,
            Err(CouchbaseError::DocumentNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(doc
            .get(RETURN_VAL_FIELD)
            .and_then(Value::as_str)
            .and_then(loads_generations))
    }

    /// Write an entry, replacing any previous one.
    pub async fn try_update(
        &self,
        prompt: &str,
        llm_string: &str,
        generations: &[Generation],
    ) -> Result<(), CouchbaseError> {
        let doc = json!({
            PROMPT_FIELD: prompt,
            LLM_FIELD: llm_string,
            RETURN_VAL_FIELD: dumps_generations(generations)?,
        });
        let key = Self::cache_key(prompt, llm_string);
        self.resolved.upsert(&key, doc, self.ttl).await
    }

    /// Delete every entry of the collection. Requires an index on the collection.
    pub async fn try_clear(&self) -> Result<(), CouchbaseError> {
        self.resolved.delete_all().await
    }
}

#[async_trait]
impl LlmCache for CouchbaseCache {
    async fn lookup(&self, prompt: &str, llm_string: &str) -> Option<Vec<Generation>> {
        async {
            match self.try_lookup(prompt, llm_string).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "cache lookup failed");
                    None
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn update(&self, prompt: &str, llm_string: &str, generations: &[Generation]) {
        if let Err(e) = self
            .try_update(prompt, llm_string, generations)
            .instrument(self.span.clone())
            .await
        {
            self.span
                .in_scope(|| tracing::error!(error = %e, "error updating cache"));
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.try_clear().instrument(self.span.clone()).await {
            self.span.in_scope(|| {
                tracing::error!(
                    error = %e,
                    "error clearing cache; please check if you have an index"
                )
            });
        }
    }
}
