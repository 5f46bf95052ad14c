use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::cluster::{Keyspace, MultiMutationResult};
use crate::{CouchbaseCluster, CouchbaseError};

/// Checks that a keyspace exists before a component is allowed to use it.
pub struct ConnectionValidator;

impl ConnectionValidator {
    /// Resolve `keyspace` against `cluster`.
    ///
    /// Errors are reported in a fixed order: bucket, then scope, then
    /// collection. Scopes are enumerated in cluster order and the first name
    /// match wins.
    pub async fn validate(
        cluster: Arc<dyn CouchbaseCluster>,
        keyspace: Keyspace,
    ) -> Result<ResolvedKeyspace, CouchbaseError> {
        require("bucket_name", &keyspace.bucket)?;
        if !cluster.bucket_exists(&keyspace.bucket).await? {
            return Err(CouchbaseError::BucketNotFound(keyspace.bucket));
        }
        require("scope_name", &keyspace.scope)?;
        require("collection_name", &keyspace.collection)?;

        let scopes = cluster.scopes(&keyspace.bucket).await?;
        let scope = scopes
            .iter()
            .find(|s| s.name == keyspace.scope)
            .ok_or_else(|| CouchbaseError::ScopeNotFound {
                scope: keyspace.scope.clone(),
                bucket: keyspace.bucket.clone(),
            })?;
        if !scope.collections.iter().any(|c| *c == keyspace.collection) {
            return Err(CouchbaseError::CollectionNotFound {
                collection: keyspace.collection.clone(),
                scope: keyspace.scope.clone(),
                bucket: keyspace.bucket.clone(),
            });
        }

        Ok(ResolvedKeyspace { cluster, keyspace })
    }
}

/// Reject an empty required argument.
pub(crate) fn require(name: &str, value: &str) -> Result<(), CouchbaseError> {
    if value.is_empty() {
        return Err(CouchbaseError::InvalidArgument(format!(
            "{name} must be provided."
        )));
    }
    Ok(())
}

/// Validate an optional time-to-live.
///
/// Expiry is stored with one-second granularity, so anything shorter than a
/// second (including zero) is rejected. Longer values with a fractional part
/// are rounded up to the next whole second.
pub fn validate_ttl(ttl: Option<Duration>) -> Result<Option<Duration>, CouchbaseError> {
    match ttl {
        Some(ttl) if ttl.as_secs() == 0 => Err(CouchbaseError::InvalidTtl(format!(
            "ttl must be at least one second but was {} seconds.",
            ttl.as_secs_f64()
        ))),
        Some(ttl) => Ok(Some(Duration::from_secs(whole_seconds(ttl)))),
        None => Ok(None),
    }
}

/// Seconds in `ttl`, rounding any fractional part up.
pub(crate) fn whole_seconds(ttl: Duration) -> u64 {
    ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)
}

// ---------------------------------------------------------------------------
// ResolvedKeyspace
// ---------------------------------------------------------------------------

/// A validated keyspace bound to the cluster handle it was validated against.
///
/// Read-only after construction; components hold one and route every
/// operation through it.
#[derive(Clone)]
pub struct ResolvedKeyspace {
    cluster: Arc<dyn CouchbaseCluster>,
    keyspace: Keyspace,
}

impl ResolvedKeyspace {
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn cluster(&self) -> &Arc<dyn CouchbaseCluster> {
        &self.cluster
    }

    pub async fn get(&self, key: &str) -> Result<Value, CouchbaseError> {
        self.cluster.get(&self.keyspace, key).await
    }

    pub async fn upsert(
        &self,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
    ) -> Result<(), CouchbaseError> {
        self.cluster.upsert(&self.keyspace, key, value, expiry).await
    }

    pub async fn insert(
        &self,
        key: &str,
        value: Value,
        expiry: Option<Duration>,
    ) -> Result<(), CouchbaseError> {
        self.cluster.insert(&self.keyspace, key, value, expiry).await
    }

    pub async fn upsert_multi(
        &self,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.cluster.upsert_multi(&self.keyspace, docs, expiry).await
    }

    pub async fn insert_multi(
        &self,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.cluster.insert_multi(&self.keyspace, docs, expiry).await
    }

    pub async fn remove_multi(&self, keys: &[String]) -> Result<MultiMutationResult, CouchbaseError> {
        self.cluster.remove_multi(&self.keyspace, keys).await
    }

    pub async fn query(
        &self,
        statement: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<Value>, CouchbaseError> {
        self.cluster.query(&self.keyspace, statement, params).await
    }

    /// Delete every document of the collection. Needs an index on the collection.
    pub async fn delete_all(&self) -> Result<(), CouchbaseError> {
        let statement = format!("DELETE FROM {}", self.keyspace.collection_ident());
        self.query(&statement, Map::new()).await.map(|_| ())
    }
}

impl std::fmt::Debug for ResolvedKeyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKeyspace")
            .field("keyspace", &self.keyspace)
            .finish_non_exhaustive()
    }
}
