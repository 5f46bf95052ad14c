use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CouchbaseError;

// ---------------------------------------------------------------------------
// Keyspace
// ---------------------------------------------------------------------------

/// Fully qualified location of a collection: `bucket.scope.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Query context that lets statements name the collection alone.
    pub fn query_context(&self) -> String {
        format!("default:{}.{}", ident(&self.bucket), ident(&self.scope))
    }

    /// The collection name quoted for use inside a statement.
    pub fn collection_ident(&self) -> String {
        ident(&self.collection)
    }
}

impl std::fmt::Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// A scope and the names of the collections it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSpec {
    pub name: String,
    pub collections: Vec<String>,
}

/// Where a Search index is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLocation {
    /// Index scoped to `bucket.scope`.
    Scope { bucket: String, scope: String },
    /// Cluster-level index.
    Cluster,
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Per-key outcome of a multi-document mutation.
#[derive(Debug, Default)]
pub struct MultiMutationResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, CouchbaseError)>,
}

impl MultiMutationResult {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|(key, _)| key.clone()).collect()
    }
}

/// One hit returned by the Search service.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub id: String,
    pub score: f64,
    /// Stored fields of the hit; `None` when the index returned none at all.
    pub fields: Option<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// CouchbaseCluster
// ---------------------------------------------------------------------------

/// The operations the adapters need from a Couchbase cluster.
///
/// [`HttpCluster`](crate::HttpCluster) implements this over the cluster's REST
/// services. Callers own the handle and share it between components as an
/// `Arc<dyn CouchbaseCluster>`.
#[async_trait]
pub trait CouchbaseCluster: Send + Sync {
    /// Whether `bucket` exists on the cluster.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, CouchbaseError>;

    /// All scopes of `bucket`, in the order the cluster reports them.
    async fn scopes(&self, bucket: &str) -> Result<Vec<ScopeSpec>, CouchbaseError>;

    /// Names of the Search indexes defined at `location`.
    async fn search_indexes(&self, location: &IndexLocation)
        -> Result<Vec<String>, CouchbaseError>;

    /// Fetch one document. A missing key is [`CouchbaseError::DocumentNotFound`].
    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Value, CouchbaseError>;

    /// Insert or replace documents.
    async fn upsert_multi(
        &self,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError>;

    /// Insert documents; existing keys fail with [`CouchbaseError::DocumentExists`].
    async fn insert_multi(
        &self,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError>;

    /// Remove documents; missing keys fail with [`CouchbaseError::DocumentNotFound`].
    async fn remove_multi(
        &self,
        keyspace: &Keyspace,
        keys: &[String],
    ) -> Result<MultiMutationResult, CouchbaseError>;

    /// Run a statement in the query context of `keyspace`'s scope with named parameters.
    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<Value>, CouchbaseError>;

    /// Run a Search request against `index` at `location`.
    async fn search(
        &self,
        location: &IndexLocation,
        index: &str,
        request: Value,
    ) -> Result<Vec<SearchRow>, CouchbaseError>;

    /// Upsert a single document.
    async fn upsert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
    ) -> Result<(), CouchbaseError> {
        let result = self
            .upsert_multi(keyspace, vec![(key.to_string(), value)], expiry)
            .await?;
        first_failure(result)
    }

    /// Insert a single document.
    async fn insert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
    ) -> Result<(), CouchbaseError> {
        let result = self
            .insert_multi(keyspace, vec![(key.to_string(), value)], expiry)
            .await?;
        first_failure(result)
    }
}

fn first_failure(result: MultiMutationResult) -> Result<(), CouchbaseError> {
    match result.failed.into_iter().next() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Statement helpers
// ---------------------------------------------------------------------------

/// Quote a single identifier with backticks.
pub(crate) fn ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a dotted field path segment by segment: `metadata.page` -> `` `metadata`.`page` ``.
pub(crate) fn field_path(path: &str) -> String {
    path.split('.').map(ident).collect::<Vec<_>>().join(".")
}
