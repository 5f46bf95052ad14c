use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use synaptic_core::{Embeddings, Generation, LlmCache};
use tracing::{Instrument, Span};

use crate::generations::{dumps_generations, loads_generations};
use crate::validation::validate_ttl;
use crate::vector_store::{
    AddTextsOptions, CouchbaseSearchVectorStore, SearchParams, SearchQuery, SearchVectorConfig,
};
use crate::{CouchbaseCluster, CouchbaseError};

const LLM_FIELD: &str = "llm_string";
const RETURN_VAL_FIELD: &str = "return_val";

/// Configuration for [`CouchbaseSemanticCache`].
#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    /// Keyspace and Search index of the backing vector store.
    pub store: SearchVectorConfig,
    /// Minimum score a hit must reach to be returned. No threshold when `None`.
    pub score_threshold: Option<f64>,
    /// Optional expiry applied to every cache entry.
    pub ttl: Option<Duration>,
}

impl SemanticCacheConfig {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            store: SearchVectorConfig::new(bucket, scope, collection, index_name),
            score_threshold: None,
            ttl: None,
        }
    }

    pub fn with_score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// LLM cache that returns the generations of the most similar earlier prompt
/// produced by the same model configuration.
///
/// Prompts are stored as documents of a [`CouchbaseSearchVectorStore`] with
/// metadata `{llm_string, return_val}`; lookups are a k=1 vector query
/// pre-filtered on `metadata.llm_string`.
pub struct CouchbaseSemanticCache {
    store: CouchbaseSearchVectorStore,
    score_threshold: Option<f64>,
    ttl: Option<Duration>,
    span: Span,
}

impl CouchbaseSemanticCache {
    pub async fn new(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: SemanticCacheConfig,
    ) -> Result<Self, CouchbaseError> {
        let span = tracing::info_span!(
            "couchbase_semantic_cache",
            keyspace = %config.store.keyspace,
            index = %config.store.index_name,
        );
        let store = CouchbaseSearchVectorStore::new(cluster, embeddings, config.store).await?;
        if let Some(threshold) = config.score_threshold {
            if !threshold.is_finite() {
                return Err(CouchbaseError::InvalidArgument(format!(
                    "score_threshold must be a finite number, got {threshold}"
                )));
            }
        }
        let ttl = validate_ttl(config.ttl)?;
        Ok(Self {
            store,
            score_threshold: config.score_threshold,
            ttl,
            span,
        })
    }

    /// Replace the span that cache events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The vector store holding the cached prompts.
    pub fn store(&self) -> &CouchbaseSearchVectorStore {
        &self.store
    }

    pub fn score_threshold(&self) -> Option<f64> {
        self.score_threshold
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Look up the closest cached prompt, distinguishing a miss from a failure.
    pub async fn try_lookup(
        &self,
        prompt: &str,
        llm_string: &str,
    ) -> Result<Option<Vec<Generation>>, CouchbaseError> {
        let params = SearchParams::default()
            .with_filter(SearchQuery::matches(format!("metadata.{LLM_FIELD}"), llm_string));
        let hits = self.store.search_with_score(prompt, 1, &params).await?;
        let Some((doc, score)) = hits.into_iter().next() else {
            return Ok(None);
        };
        if let Some(threshold) = self.score_threshold {
            if score < threshold {
                tracing::debug!(score, threshold, "closest prompt below score threshold");
                return Ok(None);
            }
        }
        Ok(doc
            .metadata
            .get(RETURN_VAL_FIELD)
            .and_then(Value::as_str)
            .and_then(loads_generations))
    }

    /// Store `prompt` with its generations under a fresh id.
    pub async fn try_update(
        &self,
        prompt: &str,
        llm_string: &str,
        generations: &[Generation],
    ) -> Result<(), CouchbaseError> {
        let metadata = HashMap::from([
            (LLM_FIELD.to_string(), Value::String(llm_string.to_string())),
            (
                RETURN_VAL_FIELD.to_string(),
                Value::String(dumps_generations(generations)?),
            ),
        ]);
        let mut options = AddTextsOptions::default().with_metadatas(vec![metadata]);
        options.ttl = self.ttl;
        self.store.add_texts(&[prompt], options).await.map(|_| ())
    }

    /// Delete every entry of the collection. Requires an index on the collection.
    pub async fn try_clear(&self) -> Result<(), CouchbaseError> {
        self.store.resolved().delete_all().await
    }
}

#[async_trait]
impl LlmCache for CouchbaseSemanticCache {
    async fn lookup(&self, prompt: &str, llm_string: &str) -> Option<Vec<Generation>> {
        async {
            match self.try_lookup(prompt, llm_string).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "semantic cache lookup failed");
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
