use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use synaptic_core::{Document, Embeddings, SynapticError, VectorStore};

use super::{
    document_from_fields, requested_fields, AddTextsOptions, DocumentCollection,
    DEFAULT_EMBEDDING_KEY, DEFAULT_TEXT_KEY,
};
use crate::cluster::{IndexLocation, Keyspace, SearchRow};
use crate::validation::{require, ConnectionValidator, ResolvedKeyspace};
use crate::{CouchbaseCluster, CouchbaseError};

// ---------------------------------------------------------------------------
// SearchVectorConfig
// ---------------------------------------------------------------------------

/// Configuration for [`CouchbaseSearchVectorStore`].
#[derive(Debug, Clone)]
pub struct SearchVectorConfig {
    pub keyspace: Keyspace,
    /// Name of the Search index holding the vectors. Mandatory.
    pub index_name: String,
    /// Field storing the document text (default: `text`).
    pub text_key: String,
    /// Field storing the vector (default: `embedding`).
    pub embedding_key: String,
    /// Whether the index is defined on the scope rather than the cluster (default: `true`).
    pub scoped_index: bool,
}

impl SearchVectorConfig {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            keyspace: Keyspace::new(bucket, scope, collection),
            index_name: index_name.into(),
            text_key: DEFAULT_TEXT_KEY.to_string(),
            embedding_key: DEFAULT_EMBEDDING_KEY.to_string(),
            scoped_index: true,
        }
    }

    pub fn with_text_key(mut self, key: impl Into<String>) -> Self {
        self.text_key = key.into();
        self
    }

    pub fn with_embedding_key(mut self, key: impl Into<String>) -> Self {
        self.embedding_key = key.into();
        self
    }

    pub fn with_scoped_index(mut self, scoped: bool) -> Self {
        self.scoped_index = scoped;
        self
    }
}

// ---------------------------------------------------------------------------
// SearchQuery
// ---------------------------------------------------------------------------

/// A Search-service query used as a vector pre-filter.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Analyzed match of `text` against `field`.
    Match { field: String, text: String },
    /// Exact term match.
    Term { field: String, term: String },
    /// Numeric range; bounds are inclusive at the minimum and exclusive at the maximum.
    NumericRange {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Conjunction(Vec<SearchQuery>),
    Disjunction(Vec<SearchQuery>),
    /// A query object passed through as-is. Must be a non-empty JSON object.
    Raw(Value),
}

impl SearchQuery {
    pub fn matches(field: impl Into<String>, text: impl Into<String>) -> Self {
        SearchQuery::Match {
            field: field.into(),
            text: text.into(),
        }
    }

    pub fn term(field: impl Into<String>, term: impl Into<String>) -> Self {
        SearchQuery::Term {
            field: field.into(),
            term: term.into(),
        }
    }

    /// Render the query as the JSON object the Search service expects.
    pub fn to_json(&self) -> Result<Value, CouchbaseError> {
        Ok(match self {
            SearchQuery::Match { field, text } => json!({"match": text, "field": field}),
            SearchQuery::Term { field, term } => json!({"term": term, "field": field}),
            SearchQuery::NumericRange { field, min, max } => {
                if min.is_none() && max.is_none() {
                    return Err(CouchbaseError::InvalidFilter(format!(
                        "numeric range on {field} needs at least one bound"
                    )));
                }
                let mut obj = Map::new();
                obj.insert("field".to_string(), json!(field));
                if let Some(min) = min {
                    obj.insert("min".to_string(), json!(min));
                }
                if let Some(max) = max {
                    obj.insert("max".to_string(), json!(max));
                }
                Value::Object(obj)
            }
            SearchQuery::Conjunction(queries) => {
                json!({"conjuncts": render_all(queries)?})
            }
            SearchQuery::Disjunction(queries) => {
                json!({"disjuncts": render_all(queries)?})
            }
            SearchQuery::Raw(value) => match value {
                Value::Object(obj) if !obj.is_empty() => value.clone(),
                other => {
                    return Err(CouchbaseError::InvalidFilter(format!(
                        "expected a non-empty JSON object, got {other}"
                    )))
                }
            },
        })
    }
}

fn render_all(queries: &[SearchQuery]) -> Result<Vec<Value>, CouchbaseError> {
    if queries.is_empty() {
        return Err(CouchbaseError::InvalidFilter(
            "compound query needs at least one child".to_string(),
        ));
    }
    queries.iter().map(SearchQuery::to_json).collect()
}

// ---------------------------------------------------------------------------
// SearchParams
// ---------------------------------------------------------------------------

/// Per-call options for Search-backed similarity queries.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// Fields to return; all stored fields when `None`. The text field is always added.
    pub fields: Option<Vec<String>>,
    /// Raw request options merged over the top-level request. A `query` key
    /// here turns the request into a hybrid lexical and vector search.
    pub search_options: Option<Map<String, Value>>,
    /// Pre-filter applied to the vector candidates.
    pub filter: Option<SearchQuery>,
}

impl SearchParams {
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_search_options(mut self, options: Map<String, Value>) -> Self {
        self.search_options = Some(options);
        self
    }

    pub fn with_filter(mut self, filter: SearchQuery) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Build the Search request body for a k-nearest-neighbour query.
pub(crate) fn build_search_request(
    embedding_key: &str,
    text_key: &str,
    vector: &[f32],
    k: usize,
    params: &SearchParams,
) -> Result<Value, CouchbaseError> {
    let mut knn = Map::new();
    knn.insert("field".to_string(), json!(embedding_key));
    knn.insert("vector".to_string(), json!(vector));
    knn.insert("k".to_string(), json!(k));
    if let Some(filter) = &params.filter {
        knn.insert("filter".to_string(), filter.to_json()?);
    }

    let mut request = Map::new();
    request.insert(
        "fields".to_string(),
        json!(requested_fields(params.fields.as_deref(), text_key)),
    );
    request.insert("knn".to_string(), Value::Array(vec![Value::Object(knn)]));
    request.insert("size".to_string(), json!(k));
    request.insert("query".to_string(), json!({"match_none": {}}));

    if let Some(options) = &params.search_options {
        for (key, value) in options {
            request.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(request))
}

// ---------------------------------------------------------------------------
// CouchbaseSearchVectorStore
// ---------------------------------------------------------------------------

/// A [`VectorStore`] that answers nearest-neighbour queries through the
/// Couchbase Search service.
///
/// The index named in the config must already exist and cover the embedding
/// field. Documents are stored as `{text, metadata, embedding}`.
pub struct CouchbaseSearchVectorStore {
    documents: DocumentCollection,
    index_name: String,
    location: IndexLocation,
}

impl CouchbaseSearchVectorStore {
    /// Validate the keyspace, then the index, and build the store.
    pub async fn new(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: SearchVectorConfig,
    ) -> Result<Self, CouchbaseError> {
        let resolved = ConnectionValidator::validate(cluster, config.keyspace).await?;
        require("index_name", &config.index_name)?;

        let location = if config.scoped_index {
            IndexLocation::Scope {
                bucket: resolved.keyspace().bucket.clone(),
                scope: resolved.keyspace().scope.clone(),
            }
        } else {
            IndexLocation::Cluster
        };
        let indexes = resolved.cluster().search_indexes(&location).await?;
        if !indexes.iter().any(|name| *name == config.index_name) {
            return Err(CouchbaseError::IndexNotFound(config.index_name));
        }

        Ok(Self {
            documents: DocumentCollection {
                resolved,
                embeddings,
                text_key: config.text_key,
                embedding_key: config.embedding_key,
            },
            index_name: config.index_name,
            location,
        })
    }

    /// Build a store and add `texts` to it.
    pub async fn from_texts<S: AsRef<str>>(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: SearchVectorConfig,
        texts: &[S],
        options: AddTextsOptions,
    ) -> Result<Self, CouchbaseError> {
        let store = Self::new(cluster, embeddings, config).await?;
        store.add_texts(texts, options).await?;
        Ok(store)
    }

    /// Build a store and add `docs` to it.
    pub async fn from_documents(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: SearchVectorConfig,
        docs: Vec<Document>,
    ) -> Result<Self, CouchbaseError> {
        let store = Self::new(cluster, embeddings, config).await?;
        store.documents.add_documents(docs, None).await?;
        Ok(store)
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.documents.resolved.keyspace()
    }

    pub fn embeddings(&self) -> &Arc<dyn Embeddings> {
        &self.documents.embeddings
    }

    pub(crate) fn resolved(&self) -> &ResolvedKeyspace {
        &self.documents.resolved
    }

    /// Embed and upsert texts. See [`AddTextsOptions`].
    pub async fn add_texts<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: AddTextsOptions,
    ) -> Result<Vec<String>, CouchbaseError> {
        self.documents.add_texts(texts, options).await
    }

    /// Add documents with an optional expiry.
    pub async fn add_documents_with_ttl(
        &self,
        docs: Vec<Document>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CouchbaseError> {
        self.documents.add_documents(docs, ttl).await
    }

    /// Delete documents by id, `batch_size` ids per request.
    pub async fn delete_ids(
        &self,
        ids: &[String],
        batch_size: Option<usize>,
    ) -> Result<bool, CouchbaseError> {
        self.documents.delete(ids, batch_size).await
    }

    /// Nearest-neighbour query by vector, returning documents with the raw
    /// Search score in the order the service returned them.
    pub async fn search_by_vector_with_score(
        &self,
        vector: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(Document, f64)>, CouchbaseError> {
        let request = build_search_request(
            &self.documents.embedding_key,
            &self.documents.text_key,
            vector,
            k,
            params,
        )?;
        let rows = self
            .resolved()
            .cluster()
            .search(&self.location, &self.index_name, request)
            .await?;
        rows.into_iter().map(|row| self.row_to_document(row)).collect()
    }

    pub async fn search_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Document>, CouchbaseError> {
        let hits = self.search_by_vector_with_score(vector, k, params).await?;
        Ok(hits.into_iter().map(|(doc, _)| doc).collect())
    }

    pub async fn search_with_score(
        &self,
        query: &str,
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<(Document, f64)>, CouchbaseError> {
        let vector = self.documents.embeddings.embed_query(query).await?;
        self.search_by_vector_with_score(&vector, k, params).await
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        params: &SearchParams,
    ) -> Result<Vec<Document>, CouchbaseError> {
        let hits = self.search_with_score(query, k, params).await?;
        Ok(hits.into_iter().map(|(doc, _)| doc).collect())
    }

    fn row_to_document(&self, row: SearchRow) -> Result<(Document, f64), CouchbaseError> {
        match row.fields {
            Some(fields) if !fields.is_empty() => Ok((
                document_from_fields(row.id, fields, &self.documents.text_key),
                row.score,
            )),
            _ => Err(CouchbaseError::MissingFields(
                self.documents.text_key.clone(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// VectorStore implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl VectorStore for CouchbaseSearchVectorStore {
    async fn add_documents(&self, docs: Vec<Document>) -> Result<Vec<String>, SynapticError> {
        Ok(self.documents.add_documents(docs, None).await?)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<Document>, SynapticError> {
        Ok(self.search(query, k, &SearchParams::default()).await?)
    }

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(Document, f32)>, SynapticError> {
        let hits = self
            .search_with_score(query, k, &SearchParams::default())
            .await?;
        Ok(hits
            .into_iter()
            .map(|(doc, score)| (doc, score as f32))
            .collect())
    }

    async fn similarity_search_by_vector(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Document>, SynapticError> {
        Ok(self
            .search_by_vector(embedding, k, &SearchParams::default())
            .await?)
    }

    async fn delete(&self, ids: &[&str]) -> Result<bool, SynapticError> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        Ok(self.documents.delete(&ids, None).await?)
    }
}
