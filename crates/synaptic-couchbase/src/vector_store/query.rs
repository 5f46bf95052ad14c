use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use synaptic_core::{Document, Embeddings, SynapticError, VectorStore};

use super::{
    document_from_fields, requested_fields, AddTextsOptions, DocumentCollection,
    DEFAULT_EMBEDDING_KEY, DEFAULT_TEXT_KEY, METADATA_KEY,
};
use crate::cluster::{field_path, ident, Keyspace};
use crate::validation::ConnectionValidator;
use crate::{CouchbaseCluster, CouchbaseError};

const ID_ALIAS: &str = "id";
const SCORE_ALIAS: &str = "score";
const DEFAULT_INDEX_DESCRIPTION: &str = "IVF,SQ8";
const DIMENSION_PROBE: &str = "check the embedding dimension";

// ---------------------------------------------------------------------------
// DistanceStrategy / IndexType
// ---------------------------------------------------------------------------

/// Similarity metric passed to `APPROX_VECTOR_DISTANCE` and the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceStrategy {
    #[default]
    Dot,
    L2,
    Euclidean,
    Cosine,
    L2Squared,
    EuclideanSquared,
}

impl DistanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceStrategy::Dot => "dot",
            DistanceStrategy::L2 => "l2",
            DistanceStrategy::Euclidean => "euclidean",
            DistanceStrategy::Cosine => "cosine",
            DistanceStrategy::L2Squared => "l2_squared",
            DistanceStrategy::EuclideanSquared => "euclidean_squared",
        }
    }
}

impl fmt::Display for DistanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout of a Query-service vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Dedicated vector index keyed on the vector alone; other fields are included.
    Bhive,
    /// Composite secondary index whose key holds the text, the vector and extra fields.
    Composite,
}

impl IndexType {
    fn default_name(&self) -> &'static str {
        match self {
            IndexType::Bhive => "langchain_bhive_query_index",
            IndexType::Composite => "langchain_composite_query_index",
        }
    }
}

// ---------------------------------------------------------------------------
// QueryVectorConfig
// ---------------------------------------------------------------------------

/// Configuration for [`CouchbaseQueryVectorStore`].
#[derive(Debug, Clone)]
pub struct QueryVectorConfig {
    pub keyspace: Keyspace,
    /// Field storing the document text (default: `text`).
    pub text_key: String,
    /// Field storing the vector (default: `embedding`).
    pub embedding_key: String,
    /// Metric used for distance computation (default: [`DistanceStrategy::Dot`]).
    pub distance_metric: DistanceStrategy,
}

impl QueryVectorConfig {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            keyspace: Keyspace::new(bucket, scope, collection),
            text_key: DEFAULT_TEXT_KEY.to_string(),
            embedding_key: DEFAULT_EMBEDDING_KEY.to_string(),
            distance_metric: DistanceStrategy::default(),
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

    pub fn with_distance_metric(mut self, metric: DistanceStrategy) -> Self {
        self.distance_metric = metric;
        self
    }
}

// ---------------------------------------------------------------------------
// QueryParams / CreateIndexOptions
// ---------------------------------------------------------------------------

/// Per-call options for Query-backed similarity queries.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Fields to project; text and metadata when `None` or `["*"]`. The text field is always added.
    pub fields: Option<Vec<String>>,
    /// Raw predicate appended as the `WHERE` clause. Fields are reached through the alias `d`.
    pub where_str: Option<String>,
}

impl QueryParams {
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_where(mut self, where_str: impl Into<String>) -> Self {
        self.where_str = Some(where_str.into());
        self
    }
}

/// Options for [`CouchbaseQueryVectorStore::create_index`].
#[derive(Debug, Clone, Default)]
pub struct CreateIndexOptions {
    /// Index name; defaults depend on the [`IndexType`].
    pub index_name: Option<String>,
    /// Quantization description (default `IVF,SQ8`). Must start with `IVF`.
    pub index_description: Option<String>,
    /// Metric for the index; the store's metric when `None`.
    pub distance_metric: Option<DistanceStrategy>,
    /// Vector field; the store's embedding field when `None`.
    pub vector_field: Option<String>,
    /// Vector dimension; probed from the embedding model when `None`.
    pub vector_dimension: Option<usize>,
    /// Extra fields to include in (Bhive) or append to (Composite) the index.
    pub fields: Option<Vec<String>>,
    /// Partial index predicate.
    pub where_clause: Option<String>,
    pub index_scan_nprobes: Option<u32>,
    pub index_trainlist: Option<u32>,
}

impl CreateIndexOptions {
    pub fn with_index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.index_description = Some(description.into());
        self
    }

    pub fn with_distance_metric(mut self, metric: DistanceStrategy) -> Self {
        self.distance_metric = Some(metric);
        self
    }

    pub fn with_vector_field(mut self, field: impl Into<String>) -> Self {
        self.vector_field = Some(field.into());
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.vector_dimension = Some(dimension);
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    pub fn with_scan_nprobes(mut self, nprobes: u32) -> Self {
        self.index_scan_nprobes = Some(nprobes);
        self
    }

    pub fn with_trainlist(mut self, trainlist: u32) -> Self {
        self.index_trainlist = Some(trainlist);
        self
    }
}

// ---------------------------------------------------------------------------
// Statement builders
// ---------------------------------------------------------------------------

/// `*` stands for the stored text and metadata; the vector is never projected.
fn projection(fields: Option<&[String]>, text_key: &str) -> String {
    requested_fields(fields, text_key)
        .iter()
        .map(|field| {
            if field == "*" {
                format!("d.{}, d.{}", ident(text_key), ident(METADATA_KEY))
            } else {
                format!("d.{} AS {}", field_path(field), ident(field))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the k-nearest-neighbour statement. Binds `$query_vector` and `$k`.
pub(crate) fn build_search_statement(
    collection_ident: &str,
    text_key: &str,
    embedding_key: &str,
    metric: DistanceStrategy,
    params: &QueryParams,
) -> String {
    let where_clause = match params.where_str.as_deref().map(str::trim) {
        Some(clause) if !clause.is_empty() => format!(" WHERE {clause}"),
        _ => String::new(),
    };
    format!(
        "SELECT META(d).id AS {id}, {projection}, \
         APPROX_VECTOR_DISTANCE(d.{embedding}, $query_vector, \"{metric}\") AS {score} \
         FROM {collection_ident} AS d{where_clause} ORDER BY {score} ASC LIMIT $k",
        id = ident(ID_ALIAS),
        projection = projection(params.fields.as_deref(), text_key),
        embedding = field_path(embedding_key),
        score = ident(SCORE_ALIAS),
    )
}

fn check_description(description: &str) -> Result<(), CouchbaseError> {
    let valid = match description.split_once(',') {
        Some((centroids, quantization)) => {
            centroids.starts_with("IVF") && !quantization.trim().is_empty()
        }
        None => description.starts_with("IVF"),
    };
    if !valid {
        return Err(CouchbaseError::InvalidArgument(format!(
            "index_description must be of the form IVF[<centroids>],<quantization>, got {description:?}"
        )));
    }
    Ok(())
}

struct IndexDefinition<'a> {
    index_type: IndexType,
    name: &'a str,
    collection_ident: &'a str,
    text_key: &'a str,
    vector_field: &'a str,
    fields: &'a [String],
    where_clause: Option<&'a str>,
    with: Value,
}

fn build_index_statement(def: &IndexDefinition<'_>) -> String {
    let vector = format!("{} VECTOR", field_path(def.vector_field));
    let extra: Vec<String> = def.fields.iter().map(|f| field_path(f)).collect();

    let (verb, keys, include) = match def.index_type {
        IndexType::Bhive => {
            let include = if extra.is_empty() {
                String::new()
            } else {
                format!(" INCLUDE ({})", extra.join(", "))
            };
            ("CREATE VECTOR INDEX", vector, include)
        }
        IndexType::Composite => {
            let mut keys = vec![field_path(def.text_key), vector];
            keys.extend(extra);
            ("CREATE INDEX", keys.join(", "), String::new())
        }
    };
    let where_clause = match def.where_clause.map(str::trim) {
        Some(clause) if !clause.is_empty() => format!(" WHERE {clause}"),
        _ => String::new(),
    };

    format!(
        "{verb} {name} ON {coll}({keys}){include}{where_clause} USING GSI WITH {with}",
        name = ident(def.name),
        coll = def.collection_ident,
        with = def.with,
    )
}

// ---------------------------------------------------------------------------
// CouchbaseQueryVectorStore
// ---------------------------------------------------------------------------

/// A [`VectorStore`] that runs nearest-neighbour queries as
/// `APPROX_VECTOR_DISTANCE` statements on the Couchbase Query service.
///
/// Queries work without a vector index but scan the collection; call
/// [`create_index`](Self::create_index) once the collection holds enough
/// documents to train the index.
pub struct CouchbaseQueryVectorStore {
    documents: DocumentCollection,
    distance_metric: DistanceStrategy,
}

impl CouchbaseQueryVectorStore {
    pub async fn new(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: QueryVectorConfig,
    ) -> Result<Self, CouchbaseError> {
        let resolved = ConnectionValidator::validate(cluster, config.keyspace).await?;
        Ok(Self {
            documents: DocumentCollection {
                resolved,
                embeddings,
                text_key: config.text_key,
                embedding_key: config.embedding_key,
            },
            distance_metric: config.distance_metric,
        })
    }

    pub async fn from_texts<S: AsRef<str>>(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: QueryVectorConfig,
        texts: &[S],
        options: AddTextsOptions,
    ) -> Result<Self, CouchbaseError> {
        let store = Self::new(cluster, embeddings, config).await?;
        store.add_texts(texts, options).await?;
        Ok(store)
    }

    pub async fn from_documents(
        cluster: Arc<dyn CouchbaseCluster>,
        embeddings: Arc<dyn Embeddings>,
        config: QueryVectorConfig,
        docs: Vec<Document>,
    ) -> Result<Self, CouchbaseError> {
        let store = Self::new(cluster, embeddings, config).await?;
        store.documents.add_documents(docs, None).await?;
        Ok(store)
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.documents.resolved.keyspace()
    }

    pub fn distance_metric(&self) -> DistanceStrategy {
        self.distance_metric
    }

    pub fn embeddings(&self) -> &Arc<dyn Embeddings> {
        &self.documents.embeddings
    }

    pub async fn add_texts<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: AddTextsOptions,
    ) -> Result<Vec<String>, CouchbaseError> {
        self.documents.add_texts(texts, options).await
    }

    pub async fn add_documents_with_ttl(
        &self,
        docs: Vec<Document>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CouchbaseError> {
        self.documents.add_documents(docs, ttl).await
    }

    pub async fn delete_ids(
        &self,
        ids: &[String],
        batch_size: Option<usize>,
    ) -> Result<bool, CouchbaseError> {
        self.documents.delete(ids, batch_size).await
    }

    /// Nearest-neighbour query by vector. Scores are distances under the
    /// store's metric, lowest first.
    pub async fn search_by_vector_with_score(
        &self,
        vector: &[f32],
        k: usize,
        params: &QueryParams,
    ) -> Result<Vec<(Document, f64)>, CouchbaseError> {
        let statement = build_search_statement(
            &self.keyspace().collection_ident(),
            &self.documents.text_key,
            &self.documents.embedding_key,
            self.distance_metric,
            params,
        );
        let mut bindings = Map::new();
        bindings.insert("query_vector".to_string(), json!(vector));
        bindings.insert("k".to_string(), json!(k));

        let rows = self.documents.resolved.query(&statement, bindings).await?;
        rows.into_iter().map(|row| self.row_to_document(row)).collect()
    }

    pub async fn search_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        params: &QueryParams,
    ) -> Result<Vec<Document>, CouchbaseError> {
        let hits = self.search_by_vector_with_score(vector, k, params).await?;
        Ok(hits.into_iter().map(|(doc, _)| doc).collect())
    }

    pub async fn search_with_score(
        &self,
        query: &str,
        k: usize,
        params: &QueryParams,
    ) -> Result<Vec<(Document, f64)>, CouchbaseError> {
        let vector = self.documents.embeddings.embed_query(query).await?;
        self.search_by_vector_with_score(&vector, k, params).await
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        params: &QueryParams,
    ) -> Result<Vec<Document>, CouchbaseError> {
        let hits = self.search_with_score(query, k, params).await?;
        Ok(hits.into_iter().map(|(doc, _)| doc).collect())
    }

    /// Create a vector index on the collection.
    ///
    /// The collection should already hold documents: the index is trained on
    /// existing vectors when it is built.
    pub async fn create_index(
        &self,
        index_type: IndexType,
        options: CreateIndexOptions,
    ) -> Result<(), CouchbaseError> {
        let description = options
            .index_description
            .unwrap_or_else(|| DEFAULT_INDEX_DESCRIPTION.to_string());
        check_description(&description)?;

        let dimension = match options.vector_dimension {
            Some(0) => {
                return Err(CouchbaseError::InvalidArgument(
                    "vector_dimension must be greater than 0".to_string(),
                ))
            }
            Some(dimension) => dimension,
            None => self
                .documents
                .embeddings
                .embed_query(DIMENSION_PROBE)
                .await?
                .len(),
        };

        let mut with = Map::new();
        with.insert("dimension".to_string(), json!(dimension));
        with.insert(
            "similarity".to_string(),
            json!(options
                .distance_metric
                .unwrap_or(self.distance_metric)
                .as_str()),
        );
        with.insert("description".to_string(), json!(description));
        if let Some(nprobes) = options.index_scan_nprobes {
            with.insert("scan_nprobes".to_string(), json!(nprobes));
        }
        if let Some(trainlist) = options.index_trainlist {
            with.insert("train_list".to_string(), json!(trainlist));
        }

        let name = options
            .index_name
            .unwrap_or_else(|| index_type.default_name().to_string());
        let vector_field = options
            .vector_field
            .unwrap_or_else(|| self.documents.embedding_key.clone());
        let fields = options.fields.unwrap_or_default();
        let collection_ident = self.keyspace().collection_ident();

        let statement = build_index_statement(&IndexDefinition {
            index_type,
            name: &name,
            collection_ident: &collection_ident,
            text_key: &self.documents.text_key,
            vector_field: &vector_field,
            fields: &fields,
            where_clause: options.where_clause.as_deref(),
            with: Value::Object(with),
        });
        self.documents
            .resolved
            .query(&statement, Map::new())
            .await
            .map(|_| ())
    }

    fn row_to_document(&self, row: Value) -> Result<(Document, f64), CouchbaseError> {
        let mut fields = match row {
            Value::Object(fields) => fields,
            other => {
                return Err(CouchbaseError::Query(format!(
                    "unexpected row shape: {other}"
                )))
            }
        };
        let id = match fields.remove(ID_ALIAS) {
            Some(Value::String(id)) => id,
            _ => return Err(CouchbaseError::Query("row without document id".to_string())),
        };
        let score = fields
            .remove(SCORE_ALIAS)
            .and_then(|score| score.as_f64())
            .unwrap_or(f64::NAN);
        if fields.is_empty() {
            return Err(CouchbaseError::MissingFields(
                self.documents.text_key.clone(),
            ));
        }
        Ok((
            document_from_fields(id, fields, &self.documents.text_key),
            score,
        ))
    }
}

// ---------------------------------------------------------------------------
// VectorStore implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl VectorStore for CouchbaseQueryVectorStore {
    async fn add_documents(&self, docs: Vec<Document>) -> Result<Vec<String>, SynapticError> {
        Ok(self.documents.add_documents(docs, None).await?)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<Document>, SynapticError> {
        Ok(self.search(query, k, &QueryParams::default()).await?)
    }

    async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(Document, f32)>, SynapticError> {
        let hits = self
            .search_with_score(query, k, &QueryParams::default())
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
            .search_by_vector(embedding, k, &QueryParams::default())
            .await?)
    }

    async fn delete(&self, ids: &[&str]) -> Result<bool, SynapticError> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        Ok(self.documents.delete(&ids, None).await?)
    }
}
