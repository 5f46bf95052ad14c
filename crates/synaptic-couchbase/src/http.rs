use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cluster::{IndexLocation, Keyspace, MultiMutationResult, ScopeSpec, SearchRow};
use crate::validation::whole_seconds;
use crate::{CouchbaseCluster, CouchbaseError};

/// N1QL error code for DML failures, including duplicate keys on INSERT.
const DML_ERROR_CODE: i64 = 12009;

/// Largest expiry the server treats as relative to now (thirty days).
const MAX_RELATIVE_EXPIRY_SECS: u64 = 30 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// CouchbaseConfig
// ---------------------------------------------------------------------------

/// Connection settings for [`HttpCluster`].
#[derive(Debug, Clone)]
pub struct CouchbaseConfig {
    /// Host name of any cluster node (default: `localhost`).
    pub host: String,
    pub username: String,
    pub password: String,
    /// Use HTTPS and the secure service ports.
    pub tls: bool,
    /// Cluster manager port (default: `8091`, `18091` with TLS).
    pub management_port: u16,
    /// Query service port (default: `8093`, `18093` with TLS).
    pub query_port: u16,
    /// Search service port (default: `8094`, `18094` with TLS).
    pub search_port: u16,
    /// Per-request timeout applied by the HTTP client.
    pub timeout: Option<Duration>,
}

impl CouchbaseConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            tls: false,
            management_port: 8091,
            query_port: 8093,
            search_port: 8094,
            timeout: None,
        }
    }

    /// Read `COUCHBASE_HOST` (default `localhost`), `COUCHBASE_USERNAME` and
    /// `COUCHBASE_PASSWORD`; `COUCHBASE_TLS=true` switches to the secure ports.
    pub fn from_env() -> Result<Self, CouchbaseError> {
        let host = std::env::var("COUCHBASE_HOST").unwrap_or_else(|_| "localhost".to_string());
        let username = std::env::var("COUCHBASE_USERNAME").map_err(|_| {
            CouchbaseError::InvalidArgument("COUCHBASE_USERNAME is not set".to_string())
        })?;
        let password = std::env::var("COUCHBASE_PASSWORD").map_err(|_| {
            CouchbaseError::InvalidArgument("COUCHBASE_PASSWORD is not set".to_string())
        })?;
        let tls = std::env::var("COUCHBASE_TLS")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        Ok(Self::new(host, username, password).with_tls(tls))
    }

    /// Toggle TLS. Resets the service ports to the matching defaults.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        if tls {
            self.management_port = 18091;
            self.query_port = 18093;
            self.search_port = 18094;
        } else {
            self.management_port = 8091;
            self.query_port = 8093;
            self.search_port = 8094;
        }
        self
    }

    pub fn with_ports(mut self, management: u16, query: u16, search: u16) -> Self {
        self.management_port = management;
        self.query_port = query;
        self.search_port = search;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn base(&self, port: u16) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{port}", self.host)
    }

    pub fn management_url(&self) -> String {
        self.base(self.management_port)
    }

    pub fn query_url(&self) -> String {
        self.base(self.query_port)
    }

    pub fn search_url(&self) -> String {
        self.base(self.search_port)
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScopesResponse {
    #[serde(default)]
    scopes: Vec<ScopeEntry>,
}

#[derive(Debug, Deserialize)]
struct ScopeEntry {
    name: String,
    #[serde(default)]
    collections: Vec<NamedEntry>,
}

#[derive(Debug, Deserialize)]
struct NamedEntry {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    errors: Vec<QueryErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct QueryErrorEntry {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl QueryErrorEntry {
    fn is_duplicate_key(&self) -> bool {
        self.code == DML_ERROR_CODE && self.msg.contains("Duplicate Key")
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    status: Option<SearchStatus>,
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchStatus {
    #[serde(default)]
    failed: u64,
    /// Per-partition errors; an object keyed by partition or a list.
    #[serde(default)]
    errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    fields: Option<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// HttpCluster
// ---------------------------------------------------------------------------

/// A [`CouchbaseCluster`] that talks to the cluster manager, Query and Search
/// REST services.
///
/// Key-value operations are issued as N1QL statements (`USE KEYS`,
/// `VALUES ... OPTIONS`, `RETURNING META().id`) so the outcome of every key in
/// a batch can be recovered from a single request.
pub struct HttpCluster {
    config: CouchbaseConfig,
    client: reqwest::Client,
}

impl HttpCluster {
    pub fn new(config: CouchbaseConfig) -> Result<Self, CouchbaseError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| CouchbaseError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Return a reference to the configuration.
    pub fn config(&self) -> &CouchbaseConfig {
        &self.config
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<(reqwest::StatusCode, String), CouchbaseError> {
        let resp = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| CouchbaseError::Transport(format!("Couchbase request failed: {e}")))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            CouchbaseError::Transport(format!("failed to read Couchbase response: {e}"))
        })?;
        Ok((status, text))
    }

    /// Execute a statement and return results and errors together; DML
    /// statements can report both in one response.
    async fn execute(
        &self,
        keyspace: &Keyspace,
        statement: &str,
        params: Map<String, Value>,
    ) -> Result<QueryResponse, CouchbaseError> {
        let body = query_body(keyspace, statement, params);
        let url = format!("{}/query/service", self.config.query_url());
        let (status, text) = self.send(self.client.post(&url).json(&body)).await?;

        match serde_json::from_str::<QueryResponse>(&text) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(CouchbaseError::Query(format!(
                "Couchbase query error (HTTP {status}): {text}"
            ))),
            Err(e) => Err(CouchbaseError::Query(format!(
                "failed to parse Couchbase query response: {e}"
            ))),
        }
    }

    async fn mutate(
        &self,
        verb: &str,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        if docs.is_empty() {
            return Ok(MultiMutationResult::default());
        }
        let keys: Vec<String> = docs.iter().map(|(k, _)| k.clone()).collect();
        let now = chrono::Utc::now().timestamp();
        let (statement, params) = mutation_statement(verb, keyspace, docs, expiry, now);
        let response = self.execute(keyspace, &statement, params).await?;
        mutation_outcomes(keys, &response)
    }
}

#[async_trait]
impl CouchbaseCluster for HttpCluster {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, CouchbaseError> {
        let url = format!(
            "{}/pools/default/buckets/{bucket}",
            self.config.management_url()
        );
        let (status, text) = self.send(self.client.get(&url)).await?;
        match status.as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(CouchbaseError::Transport(format!(
                "Couchbase bucket lookup error (HTTP {status}): {text}"
            ))),
        }
    }

    async fn scopes(&self, bucket: &str) -> Result<Vec<ScopeSpec>, CouchbaseError> {
        let url = format!(
            "{}/pools/default/buckets/{bucket}/scopes",
            self.config.management_url()
        );
        let (status, text) = self.send(self.client.get(&url)).await?;
        if !status.is_success() {
            return Err(CouchbaseError::Transport(format!(
                "Couchbase scope listing error (HTTP {status}): {text}"
            )));
        }
        let parsed: ScopesResponse = serde_json::from_str(&text)?;
        Ok(parsed
            .scopes
            .into_iter()
            .map(|scope| ScopeSpec {
                name: scope.name,
                collections: scope.collections.into_iter().map(|c| c.name).collect(),
            })
            .collect())
    }

    async fn search_indexes(
        &self,
        location: &IndexLocation,
    ) -> Result<Vec<String>, CouchbaseError> {
        let url = match location {
            IndexLocation::Scope { bucket, scope } => format!(
                "{}/api/bucket/{bucket}/scope/{scope}/index",
                self.config.search_url()
            ),
            IndexLocation::Cluster => format!("{}/api/index", self.config.search_url()),
        };
        let (status, text) = self.send(self.client.get(&url)).await?;
        if !status.is_success() {
            return Err(CouchbaseError::Search(format!(
                "Couchbase index listing error (HTTP {status}): {text}"
            )));
        }
        let parsed: Value = serde_json::from_str(&text)?;
        Ok(index_names(&parsed, location))
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Value, CouchbaseError> {
        let statement = format!(
            "SELECT RAW d FROM {} AS d USE KEYS $key",
            keyspace.collection_ident()
        );
        let mut params = Map::new();
        params.insert("key".to_string(), Value::String(key.to_string()));
        self.query(keyspace, &statement, params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CouchbaseError::DocumentNotFound(key.to_string()))
    }

    async fn upsert_multi(
        &self,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.mutate("UPSERT", keyspace, docs, expiry).await
    }

    async fn insert_multi(
        &self,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.mutate("INSERT", keyspace, docs, expiry).await
    }

    async fn remove_multi(
        &self,
        keyspace: &Keyspace,
        keys: &[String],
    ) -> Result<MultiMutationResult, CouchbaseError> {
        if keys.is_empty() {
            return Ok(MultiMutationResult::default());
        }
        let statement = format!(
            "DELETE FROM {} USE KEYS $keys RETURNING RAW META().id",
            keyspace.collection_ident()
        );
        let mut params = Map::new();
        params.insert("keys".to_string(), serde_json::to_value(keys)?);
        let response = self.execute(keyspace, &statement, params).await?;
        if let Some(err) = response.errors.first() {
            return Err(CouchbaseError::Query(err.msg.clone()));
        }
        Ok(split_outcomes(keys.to_vec(), &response.results, |key| {
            CouchbaseError::DocumentNotFound(key.to_string())
        }))
    }

    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<Value>, CouchbaseError> {
        let response = self.execute(keyspace, statement, params).await?;
        if let Some(err) = response.errors.first() {
            if err.is_duplicate_key() {
                return Err(CouchbaseError::DocumentExists(err.msg.clone()));
            }
            return Err(CouchbaseError::Query(format!("[{}] {}", err.code, err.msg)));
        }
        Ok(response.results)
    }

    async fn search(
        &self,
        location: &IndexLocation,
        index: &str,
        request: Value,
    ) -> Result<Vec<SearchRow>, CouchbaseError> {
        let url = match location {
            IndexLocation::Scope { bucket, scope } => format!(
                "{}/api/bucket/{bucket}/scope/{scope}/index/{index}/query",
                self.config.search_url()
            ),
            IndexLocation::Cluster => {
                format!("{}/api/index/{index}/query", self.config.search_url())
            }
        };
        let (status, text) = self.send(self.client.post(&url).json(&request)).await?;
        if !status.is_success() {
            return Err(CouchbaseError::Search(format!(
                "Couchbase search error (HTTP {status}): {text}"
            )));
        }
        let parsed: SearchResponse = serde_json::from_str(&text)
            .map_err(|e| CouchbaseError::Search(format!("failed to parse search response: {e}")))?;
        search_rows(parsed)
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

fn query_body(keyspace: &Keyspace, statement: &str, params: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("statement".to_string(), Value::String(statement.to_string()));
    body.insert(
        "query_context".to_string(),
        Value::String(keyspace.query_context()),
    );
    for (name, value) in params {
        body.insert(format!("${name}"), value);
    }
    Value::Object(body)
}

/// Build `INSERT`/`UPSERT` with one `VALUES` tuple per document.
fn mutation_statement(
    verb: &str,
    keyspace: &Keyspace,
    docs: Vec<(String, Value)>,
    expiry: Option<Duration>,
    now: i64,
) -> (String, Map<String, Value>) {
    let mut params = Map::new();
    let mut tuples = Vec::with_capacity(docs.len());
    for (i, (key, value)) in docs.into_iter().enumerate() {
        params.insert(format!("k{i}"), Value::String(key));
        params.insert(format!("v{i}"), value);
        if expiry.is_some() {
            tuples.push(format!("($k{i}, $v{i}, $expiry)"));
        } else {
            tuples.push(format!("($k{i}, $v{i})"));
        }
    }
    let columns = match expiry {
        Some(ttl) => {
            params.insert(
                "expiry".to_string(),
                serde_json::json!({ "expiration": expiration(ttl, now) }),
            );
            "(KEY, VALUE, OPTIONS)"
        }
        None => "(KEY, VALUE)",
    };
    let statement = format!(
        "{verb} INTO {} {columns} VALUES {} RETURNING RAW META().id",
        keyspace.collection_ident(),
        tuples.join(", ")
    );
    (statement, params)
}

/// Expiry as the server reads it: values above thirty days are absolute
/// Unix timestamps, so longer TTLs are sent as `now + ttl`.
fn expiration(ttl: Duration, now: i64) -> u64 {
    let secs = whole_seconds(ttl);
    if secs > MAX_RELATIVE_EXPIRY_SECS {
        (now.max(0) as u64).saturating_add(secs)
    } else {
        secs
    }
}

/// Per-key outcome of an `INSERT`/`UPSERT ... RETURNING META().id`.
///
/// Keys missing from the results failed. They are reported as
/// [`CouchbaseError::DocumentExists`] when the server reported duplicate keys.
/// Any other error with no results at all fails the whole statement.
fn mutation_outcomes(
    keys: Vec<String>,
    response: &QueryResponse,
) -> Result<MultiMutationResult, CouchbaseError> {
    let duplicates = response.errors.iter().any(QueryErrorEntry::is_duplicate_key);
    if let Some(other) = response.errors.iter().find(|e| !e.is_duplicate_key()) {
        if response.results.is_empty() {
            return Err(CouchbaseError::Query(format!("[{}] {}", other.code, other.msg)));
        }
    }

    Ok(split_outcomes(keys, &response.results, |key| {
        if duplicates {
            CouchbaseError::DocumentExists(key.to_string())
        } else {
            CouchbaseError::Query(format!("document {key} was not written"))
        }
    }))
}

/// Partition requested keys by whether the statement returned them.
fn split_outcomes(
    keys: Vec<String>,
    returned: &[Value],
    on_missing: impl Fn(&str) -> CouchbaseError,
) -> MultiMutationResult {
    let done: HashSet<&str> = returned.iter().filter_map(Value::as_str).collect();
    let mut result = MultiMutationResult::default();
    for key in keys {
        if done.contains(key.as_str()) {
            result.succeeded.push(key);
        } else {
            let err = on_missing(&key);
            result.failed.push((key, err));
        }
    }
    result
}

/// Hits of a Search response. Any failed index partition fails the query,
/// since the hits would cover only part of the collection.
fn search_rows(response: SearchResponse) -> Result<Vec<SearchRow>, CouchbaseError> {
    let status = response.status.unwrap_or_default();
    if status.failed > 0 {
        let detail = status
            .errors
            .map(|errors| errors.to_string())
            .unwrap_or_default();
        return Err(CouchbaseError::Search(format!(
            "{} index partition(s) failed: {detail}",
            status.failed
        )));
    }
    Ok(response
        .hits
        .into_iter()
        .map(|hit| SearchRow {
            id: hit.id,
            score: hit.score,
            fields: hit.fields,
        })
        .collect())
}

/// Index names from a Search index listing.
///
/// A scoped listing reports its indexes as `bucket.scope.name` and only the
/// name is kept. The cluster-level listing keeps full names, so a scoped
/// index never matches a bare name there.
fn index_names(listing: &Value, location: &IndexLocation) -> Vec<String> {
    let Some(defs) = listing
        .get("indexDefs")
        .and_then(|defs| defs.get("indexDefs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    match location {
        IndexLocation::Scope { bucket, scope } => {
            let prefix = format!("{bucket}.{scope}.");
            defs.keys()
                .map(|name| name.strip_prefix(&prefix).unwrap_or(name).to_string())
                .collect()
        }
        IndexLocation::Cluster => defs.keys().cloned().collect(),
    }
}
