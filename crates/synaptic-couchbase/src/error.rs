use synaptic_core::SynapticError;
use thiserror::Error;

/// Errors raised by the Couchbase adapters.
///
/// Construction-time and correctness-critical failures (missing keyspace,
/// missing index, duplicate ids, ...) surface as one of these variants. The
/// advisory components (caches, chat history) log them instead of returning
/// them from their fail-soft entry points.
#[derive(Debug, Error)]
pub enum CouchbaseError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Bucket {0} does not exist. Please create the bucket before searching.")]
    BucketNotFound(String),
    #[error("Scope {scope} not found in Couchbase bucket {bucket}")]
    ScopeNotFound { scope: String, bucket: String },
    #[error("Collection {collection} not found in scope {scope} in Couchbase bucket {bucket}")]
    CollectionNotFound {
        collection: String,
        scope: String,
        bucket: String,
    },
    #[error("Index {0} does not exist. Please create the index before searching.")]
    IndexNotFound(String),
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Document already exists: {0}")]
    DocumentExists(String),
    #[error("Document not found: {0}")]
    DocumentNotFound(String),
    #[error("operation failed for keys: {}", keys.join(", "))]
    PartialFailure { keys: Vec<String> },
    #[error(
        "Search results do not contain the fields from the document. \
         Please check if the index contains the required fields: {0}"
    )]
    MissingFields(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("embedding error: {0}")]
    Embedding(String),
}

impl From<serde_json::Error> for CouchbaseError {
    fn from(e: serde_json::Error) -> Self {
        CouchbaseError::Serialization(e.to_string())
    }
}

impl From<SynapticError> for CouchbaseError {
    fn from(e: SynapticError) -> Self {
        match e {
            SynapticError::Embedding(msg) => CouchbaseError::Embedding(msg),
            other => CouchbaseError::Embedding(other.to_string()),
        }
    }
}

impl From<CouchbaseError> for SynapticError {
    fn from(e: CouchbaseError) -> Self {
        let msg = e.to_string();
        match e {
            CouchbaseError::BucketNotFound(_)
            | CouchbaseError::ScopeNotFound { .. }
            | CouchbaseError::CollectionNotFound { .. }
            | CouchbaseError::IndexNotFound(_)
            | CouchbaseError::DocumentNotFound(_) => SynapticError::NotFound(msg),
            CouchbaseError::DocumentExists(_) => SynapticError::AlreadyExists(msg),
            CouchbaseError::InvalidArgument(_)
            | CouchbaseError::InvalidTtl(_)
            | CouchbaseError::InvalidFilter(_) => SynapticError::Validation(msg),
            CouchbaseError::Serialization(_) => SynapticError::Parsing(msg),
            CouchbaseError::Embedding(_) => SynapticError::Embedding(msg),
            _ => SynapticError::VectorStore(msg),
        }
    }
}
