mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{keyspace, ConsistentFakeEmbeddings, MemoryCluster, BUCKET, COLLECTION, INDEX, SCOPE};
use synaptic_couchbase::cluster::IndexLocation;
use synaptic_couchbase::{
    ChatHistoryConfig, ConnectionValidator, CouchbaseCache, CouchbaseCacheConfig,
    CouchbaseChatMessageHistory, CouchbaseCluster, CouchbaseError, CouchbaseQueryVectorStore,
    CouchbaseSearchVectorStore, CouchbaseSemanticCache, Keyspace, QueryVectorConfig,
    SearchVectorConfig, SemanticCacheConfig,
};

fn embeddings() -> Arc<ConsistentFakeEmbeddings> {
    Arc::new(ConsistentFakeEmbeddings::new())
}

// ---------------------------------------------------------------------------
// ConnectionValidator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolves_existing_keyspace() {
    let cluster = MemoryCluster::standard();
    let resolved = ConnectionValidator::validate(cluster, keyspace()).await.unwrap();
    assert_eq!(resolved.keyspace(), &keyspace());
}

#[tokio::test]
async fn missing_bucket_is_reported_by_name() {
    let cluster = MemoryCluster::standard();
    let err = ConnectionValidator::validate(cluster, Keyspace::new("nope", SCOPE, COLLECTION))
        .await
        .unwrap_err();
    match err {
        CouchbaseError::BucketNotFound(bucket) => assert_eq!(bucket, "nope"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_bucket_wins_over_missing_scope_name() {
    let cluster = MemoryCluster::standard();
    let err = ConnectionValidator::validate(cluster, Keyspace::new("nope", "", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, CouchbaseError::BucketNotFound(_)));
}

#[tokio::test]
async fn empty_bucket_name_is_invalid_argument() {
    let cluster = MemoryCluster::standard();
    let err = ConnectionValidator::validate(cluster, Keyspace::new("", SCOPE, COLLECTION))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid argument: bucket_name must be provided."
    );
}

#[tokio::test]
async fn missing_scope_and_collection() {
    let cluster = MemoryCluster::standard();

    let err = ConnectionValidator::validate(
        cluster.clone(),
        Keyspace::new(BUCKET, "other", COLLECTION),
    )
    .await
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Scope other not found in Couchbase bucket {BUCKET}")
    );

    let err = ConnectionValidator::validate(cluster, Keyspace::new(BUCKET, SCOPE, "other"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CouchbaseError::CollectionNotFound { ref collection, .. } if collection == "other"
    ));
}

#[tokio::test]
async fn collection_must_live_in_the_named_scope() {
    let cluster: Arc<dyn CouchbaseCluster> = Arc::new(
        MemoryCluster::new()
            .with_collection("b", "s1", "c1")
            .with_collection("b", "s2", "c2"),
    );
    assert!(ConnectionValidator::validate(cluster.clone(), Keyspace::new("b", "s2", "c2"))
        .await
        .is_ok());
    let err = ConnectionValidator::validate(cluster, Keyspace::new("b", "s1", "c2"))
        .await
        .unwrap_err();
    assert!(matches!(err, CouchbaseError::CollectionNotFound { .. }));
}

#[tokio::test]
async fn empty_bucket_has_no_scopes() {
    let cluster = Arc::new(MemoryCluster::new().with_bucket("empty"));
    let err = ConnectionValidator::validate(cluster, Keyspace::new("empty", SCOPE, COLLECTION))
        .await
        .unwrap_err();
    assert!(matches!(err, CouchbaseError::ScopeNotFound { .. }));
}

// ---------------------------------------------------------------------------
// Component construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_component_rejects_a_missing_bucket_first() {
    let cluster = MemoryCluster::standard();

    let err = CouchbaseCache::new(
        cluster.clone(),
        CouchbaseCacheConfig::new("nope", SCOPE, COLLECTION).with_ttl(Duration::ZERO),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::BucketNotFound(_)));

    let err = CouchbaseSemanticCache::new(
        cluster.clone(),
        embeddings(),
        SemanticCacheConfig::new("nope", SCOPE, COLLECTION, ""),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::BucketNotFound(_)));

    let err = CouchbaseChatMessageHistory::new(
        cluster.clone(),
        ChatHistoryConfig::new("nope", SCOPE, COLLECTION, "session"),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::BucketNotFound(_)));

    let err = CouchbaseSearchVectorStore::new(
        cluster.clone(),
        embeddings(),
        SearchVectorConfig::new("nope", SCOPE, COLLECTION, "missing-index"),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::BucketNotFound(_)));

    let err = CouchbaseQueryVectorStore::new(
        cluster,
        embeddings(),
        QueryVectorConfig::new("nope", SCOPE, COLLECTION),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::BucketNotFound(_)));
}

#[tokio::test]
async fn collection_errors_precede_index_errors() {
    let cluster = MemoryCluster::standard();
    let err = CouchbaseSearchVectorStore::new(
        cluster,
        embeddings(),
        SearchVectorConfig::new(BUCKET, SCOPE, "other", "missing-index"),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::CollectionNotFound { .. }));
}

#[tokio::test]
async fn search_store_requires_index_name() {
    let cluster = MemoryCluster::standard();
    let err = CouchbaseSearchVectorStore::new(
        cluster,
        embeddings(),
        SearchVectorConfig::new(BUCKET, SCOPE, COLLECTION, ""),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(
        err.to_string(),
        "invalid argument: index_name must be provided."
    );
}

#[tokio::test]
async fn search_store_requires_existing_index() {
    let cluster = MemoryCluster::standard();
    let err = CouchbaseSearchVectorStore::new(
        cluster,
        embeddings(),
        SearchVectorConfig::new(BUCKET, SCOPE, COLLECTION, "missing-index"),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(
        err.to_string(),
        "Index missing-index does not exist. Please create the index before searching."
    );
}

#[tokio::test]
async fn scoped_and_cluster_indexes_are_listed_separately() {
    let cluster = Arc::new(
        MemoryCluster::new()
            .with_collection(BUCKET, SCOPE, COLLECTION)
            .with_search_index(IndexLocation::Cluster, "global-index", keyspace()),
    );

    let scoped = CouchbaseSearchVectorStore::new(
        cluster.clone(),
        embeddings(),
        SearchVectorConfig::new(BUCKET, SCOPE, COLLECTION, "global-index"),
    )
    .await;
    assert!(matches!(scoped, Err(CouchbaseError::IndexNotFound(_))));

    let global = CouchbaseSearchVectorStore::new(
        cluster,
        embeddings(),
        SearchVectorConfig::new(BUCKET, SCOPE, COLLECTION, "global-index").with_scoped_index(false),
    )
    .await
    .unwrap();
    assert_eq!(global.index_name(), "global-index");
}

#[tokio::test]
async fn invalid_ttl_is_rejected_before_any_write() {
    let cluster = MemoryCluster::standard();

    let err = CouchbaseCache::new(
        cluster.clone(),
        CouchbaseCacheConfig::new(BUCKET, SCOPE, COLLECTION).with_ttl(Duration::ZERO),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::InvalidTtl(_)));

    let err = CouchbaseChatMessageHistory::new(
        cluster.clone(),
        ChatHistoryConfig::new(BUCKET, SCOPE, COLLECTION, "s").with_ttl(Duration::from_millis(10)),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::InvalidTtl(_)));

    let err = CouchbaseSemanticCache::new(
        cluster.clone(),
        embeddings(),
        SemanticCacheConfig::new(BUCKET, SCOPE, COLLECTION, INDEX).with_ttl(Duration::ZERO),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, CouchbaseError::InvalidTtl(_)));

    assert!(cluster.docs(&keyspace()).is_empty());
}
