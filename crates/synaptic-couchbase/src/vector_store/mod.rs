//! Vector stores over a Couchbase collection.
//!
//! Both flavors store documents as `{text, metadata, embedding}` and share the
//! write path in this module; they differ only in how nearest-neighbour
//! queries are executed.

mod query;
mod search;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use synaptic_core::{Document, Embeddings};

use crate::cluster::MultiMutationResult;
use crate::validation::{validate_ttl, ResolvedKeyspace};
use crate::CouchbaseError;

pub use query::{
    CouchbaseQueryVectorStore, CreateIndexOptions, DistanceStrategy, IndexType, QueryParams,
    QueryVectorConfig,
};
pub use search::{
    CouchbaseSearchVectorStore, SearchParams, SearchQuery, SearchVectorConfig,
};

/// Default number of documents per write, delete and embedding request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub(crate) const METADATA_KEY: &str = "metadata";
pub(crate) const DEFAULT_TEXT_KEY: &str = "text";
pub(crate) const DEFAULT_EMBEDDING_KEY: &str = "embedding";

// ---------------------------------------------------------------------------
// AddTextsOptions
// ---------------------------------------------------------------------------

/// Optional arguments for `add_texts`.
#[derive(Debug, Clone, Default)]
pub struct AddTextsOptions {
    /// One metadata map per text.
    pub metadatas: Option<Vec<HashMap<String, Value>>>,
    /// One id per text; generated when absent.
    pub ids: Option<Vec<String>>,
    /// Expiry for the written documents.
    pub ttl: Option<Duration>,
    /// Documents per batch (default [`DEFAULT_BATCH_SIZE`]).
    pub batch_size: Option<usize>,
}

impl AddTextsOptions {
    pub fn with_metadatas(mut self, metadatas: Vec<HashMap<String, Value>>) -> Self {
        self.metadatas = Some(metadatas);
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

// ---------------------------------------------------------------------------
// DocumentCollection
// ---------------------------------------------------------------------------

/// The write side shared by both vector store flavors.
pub(crate) struct DocumentCollection {
    pub(crate) resolved: ResolvedKeyspace,
    pub(crate) embeddings: Arc<dyn Embeddings>,
    pub(crate) text_key: String,
    pub(crate) embedding_key: String,
}

impl DocumentCollection {
    /// Embed and upsert `texts` batch by batch.
    ///
    /// Batches already written stay written if a later batch fails.
    pub(crate) async fn add_texts<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: AddTextsOptions,
    ) -> Result<Vec<String>, CouchbaseError> {
        let batch_size = batch_size(options.batch_size)?;
        let ttl = validate_ttl(options.ttl)?;

        let ids = match options.ids {
            Some(ids) => {
                check_len("ids", ids.len(), texts.len())?;
                ids
            }
            None => texts.iter().map(|_| generate_id()).collect(),
        };
        let metadatas = match options.metadatas {
            Some(metadatas) => {
                check_len("metadatas", metadatas.len(), texts.len())?;
                metadatas
            }
            None => vec![HashMap::new(); texts.len()],
        };

        let mut doc_ids = Vec::with_capacity(texts.len());
        for start in (0..texts.len()).step_by(batch_size) {
            let end = (start + batch_size).min(texts.len());
            let batch_texts: Vec<&str> = texts[start..end].iter().map(AsRef::as_ref).collect();
            let vectors = self.embeddings.embed_documents(&batch_texts).await?;
            if vectors.len() != batch_texts.len() {
                return Err(CouchbaseError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    batch_texts.len(),
                    vectors.len()
                )));
            }

            let docs: Vec<(String, Value)> = batch_texts
                .iter()
                .zip(&ids[start..end])
                .zip(&metadatas[start..end])
                .zip(vectors)
                .map(|(((text, id), metadata), vector)| {
                    (id.clone(), self.document_body(text, metadata, vector))
                })
                .collect();

            let result = self.resolved.upsert_multi(docs, ttl).await?;
            check_written(result)?;
            doc_ids.extend_from_slice(&ids[start..end]);
        }

        Ok(doc_ids)
    }

    /// Add documents, generating ids for those with an empty one.
    pub(crate) async fn add_documents(
        &self,
        docs: Vec<Document>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CouchbaseError> {
        let mut texts = Vec::with_capacity(docs.len());
        let mut ids = Vec::with_capacity(docs.len());
        let mut metadatas = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(if doc.id.is_empty() {
                generate_id()
            } else {
                doc.id
            });
            texts.push(doc.content);
            metadatas.push(doc.metadata);
        }
        let mut options = AddTextsOptions::default()
            .with_ids(ids)
            .with_metadatas(metadatas);
        options.ttl = ttl;
        self.add_texts(&texts, options).await
    }

    /// Remove documents batch by batch.
    ///
    /// A missing id aborts with [`CouchbaseError::DocumentNotFound`]; any other
    /// per-key failure makes the result `false` but later batches still run.
    pub(crate) async fn delete(
        &self,
        ids: &[String],
        batch_size: Option<usize>,
    ) -> Result<bool, CouchbaseError> {
        let batch_size = self::batch_size(batch_size)?;
        let mut all_deleted = true;
        for batch in ids.chunks(batch_size) {
            let result = self.resolved.remove_multi(batch).await?;
            let missing: Vec<String> = result
                .failed
                .iter()
                .filter(|(_, e)| matches!(e, CouchbaseError::DocumentNotFound(_)))
                .map(|(key, _)| key.clone())
                .collect();
            if !missing.is_empty() {
                return Err(CouchbaseError::DocumentNotFound(missing.join(", ")));
            }
            all_deleted &= result.all_ok();
        }
        Ok(all_deleted)
    }

    fn document_body(&self, text: &str, metadata: &HashMap<String, Value>, vector: Vec<f32>) -> Value {
        let mut body = Map::new();
        body.insert(self.text_key.clone(), Value::String(text.to_string()));
        body.insert(
            METADATA_KEY.to_string(),
            Value::Object(metadata.clone().into_iter().collect()),
        );
        body.insert(
            self.embedding_key.clone(),
            Value::Array(
                vector
                    .into_iter()
                    .map(|v| {
                        serde_json::Number::from_f64(v as f64)
                            .map(Value::Number)
                            .unwrap_or(Value::Null)
                    })
                    .collect(),
            ),
        );
        Value::Object(body)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn batch_size(requested: Option<usize>) -> Result<usize, CouchbaseError> {
    match requested {
        Some(0) => Err(CouchbaseError::InvalidArgument(
            "batch_size must be greater than 0".to_string(),
        )),
        Some(n) => Ok(n),
        None => Ok(DEFAULT_BATCH_SIZE),
    }
}

fn check_len(name: &str, got: usize, expected: usize) -> Result<(), CouchbaseError> {
    if got != expected {
        return Err(CouchbaseError::InvalidArgument(format!(
            "{name} has {got} entries but {expected} texts were given"
        )));
    }
    Ok(())
}

/// Turn a batch outcome into an error when any key failed.
///
/// A batch rejected only because its ids already exist is reported as
/// [`CouchbaseError::DocumentExists`].
fn check_written(result: MultiMutationResult) -> Result<(), CouchbaseError> {
    if result.all_ok() {
        return Ok(());
    }
    let all_exist = result.succeeded.is_empty()
        && result
            .failed
            .iter()
            .all(|(_, e)| matches!(e, CouchbaseError::DocumentExists(_)));
    if all_exist {
        return Err(CouchbaseError::DocumentExists(result.failed_keys().join(", ")));
    }
    Err(CouchbaseError::PartialFailure {
        keys: result.failed_keys(),
    })
}

/// Rebuild metadata from the fields a backend returned.
///
/// `metadata.`-prefixed keys lose their prefix, a nested `metadata` object is
/// merged in, and any other field is kept under its own name.
pub(crate) fn format_metadata(fields: Map<String, Value>) -> HashMap<String, Value> {
    let prefix = format!("{METADATA_KEY}.");
    let mut metadata = HashMap::new();
    for (key, value) in fields {
        if key == METADATA_KEY {
            match value {
                Value::Object(nested) => metadata.extend(nested),
                other => {
                    metadata.insert(key, other);
                }
            }
        } else if let Some(stripped) = key.strip_prefix(&prefix) {
            metadata.insert(stripped.to_string(), value);
        } else {
            metadata.insert(key, value);
        }
    }
    metadata
}

/// Build a [`Document`] from returned fields, popping the text field first.
pub(crate) fn document_from_fields(
    id: String,
    mut fields: Map<String, Value>,
    text_key: &str,
) -> Document {
    let content = match fields.remove(text_key) {
        Some(Value::String(text)) => text,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Document::with_metadata(id, content, format_metadata(fields))
}

/// Fields to request: everything by default, otherwise the requested ones
/// plus the text field.
pub(crate) fn requested_fields(fields: Option<&[String]>, text_key: &str) -> Vec<String> {
    match fields {
        None => vec!["*".to_string()],
        Some(fields) if fields.len() == 1 && fields[0] == "*" => fields.to_vec(),
        Some(fields) => {
            let mut fields = fields.to_vec();
            if !fields.iter().any(|f| f == text_key) {
                fields.push(text_key.to_string());
            }
            fields
        }
    }
}
