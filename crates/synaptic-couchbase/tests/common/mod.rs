//! In-memory stand-in for a Couchbase cluster plus a deterministic embedding
//! model, shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use synaptic_core::{Embeddings, SynapticError};
use synaptic_couchbase::cluster::{IndexLocation, MultiMutationResult, ScopeSpec, SearchRow};
use synaptic_couchbase::{CouchbaseCluster, CouchbaseError, Keyspace};

pub const BUCKET: &str = "langchain";
pub const SCOPE: &str = "_default";
pub const COLLECTION: &str = "docs";
pub const INDEX: &str = "vector-index";

// ---------------------------------------------------------------------------
// MemoryCluster
// ---------------------------------------------------------------------------

struct SearchIndex {
    location: IndexLocation,
    keyspace: Keyspace,
    store_fields: bool,
}

#[derive(Default)]
struct State {
    /// bucket -> scope -> collections, in creation order.
    buckets: BTreeMap<String, Vec<ScopeSpec>>,
    docs: HashMap<Keyspace, BTreeMap<String, Value>>,
    expiries: HashMap<String, Option<Duration>>,
    /// Write order of every key, used to break timestamp ties.
    written_at: HashMap<String, u64>,
    next_seq: u64,
    search_indexes: Vec<(String, SearchIndex)>,
    query_indexes: Vec<String>,
    statements: Vec<String>,
    search_requests: Vec<Value>,
    failing: HashSet<&'static str>,
    poisoned_keys: HashSet<String>,
}

/// A [`CouchbaseCluster`] that keeps every collection in memory.
///
/// Statements are interpreted by shape, covering exactly the statements the
/// adapters issue. Failures can be injected per operation (`get`, `upsert`,
/// `insert`, `remove`, `query`, `search`, `create_index`) or per key.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster holding `langchain._default.docs` with a scoped `vector-index` over it.
    pub fn standard() -> Arc<Self> {
        let cluster = Self::new()
            .with_collection(BUCKET, SCOPE, COLLECTION)
            .with_search_index(
                IndexLocation::Scope {
                    bucket: BUCKET.into(),
                    scope: SCOPE.into(),
                },
                INDEX,
                Keyspace::new(BUCKET, SCOPE, COLLECTION),
            );
        Arc::new(cluster)
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.lock().buckets.entry(bucket.to_string()).or_default();
        self
    }

    pub fn with_collection(self, bucket: &str, scope: &str, collection: &str) -> Self {
        {
            let mut state = self.lock();
            let scopes = state.buckets.entry(bucket.to_string()).or_default();
            let existing = scopes.iter().position(|s| s.name == scope);
            match existing {
                Some(i) => scopes[i].collections.push(collection.to_string()),
                None => scopes.push(ScopeSpec {
                    name: scope.to_string(),
                    collections: vec![collection.to_string()],
                }),
            }
            state
                .docs
                .entry(Keyspace::new(bucket, scope, collection))
                .or_default();
        }
        self
    }

    pub fn with_search_index(self, location: IndexLocation, name: &str, keyspace: Keyspace) -> Self {
        self.lock().search_indexes.push((
            name.to_string(),
            SearchIndex {
                location,
                keyspace,
                store_fields: true,
            },
        ));
        self
    }

    /// Make `name` return hits without any stored fields.
    pub fn without_stored_fields(self, name: &str) -> Self {
        for (index, def) in self.lock().search_indexes.iter_mut() {
            if index == name {
                def.store_fields = false;
            }
        }
        self
    }

    pub fn fail(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.lock().failing.remove(op);
    }

    /// Every mutation touching `key` fails from now on.
    pub fn poison_key(&self, key: &str) {
        self.lock().poisoned_keys.insert(key.to_string());
    }

    pub fn docs(&self, keyspace: &Keyspace) -> BTreeMap<String, Value> {
        self.lock().docs.get(keyspace).cloned().unwrap_or_default()
    }

    pub fn insert_raw(&self, keyspace: &Keyspace, key: &str, value: Value) {
        self.lock()
            .docs
            .entry(keyspace.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn expiry_of(&self, key: &str) -> Option<Duration> {
        self.lock().expiries.get(key).copied().flatten()
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn search_requests(&self) -> Vec<Value> {
        self.lock().search_requests.clone()
    }

    pub fn query_indexes(&self) -> Vec<String> {
        self.lock().query_indexes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check(&self, op: &'static str) -> Result<(), CouchbaseError> {
        if self.lock().failing.contains(op) {
            return Err(CouchbaseError::Transport(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn mutate(
        &self,
        op: &'static str,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
        overwrite: bool,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.check(op)?;
        let mut state = self.lock();
        let poisoned = state.poisoned_keys.clone();
        let mut result = MultiMutationResult::default();
        let mut written = Vec::new();
        {
            let collection = state
                .docs
                .get_mut(keyspace)
                .ok_or_else(|| CouchbaseError::Query(format!("keyspace {keyspace} not found")))?;
            for (key, value) in docs {
                if poisoned.contains(&key) {
                    let err = CouchbaseError::Query(format!("document {key} was not written"));
                    result.failed.push((key, err));
                } else if !overwrite && collection.contains_key(&key) {
                    let err = CouchbaseError::DocumentExists(key.clone());
                    result.failed.push((key, err));
                } else {
                    collection.insert(key.clone(), value);
                    written.push(key.clone());
                    result.succeeded.push(key);
                }
            }
        }
        for key in written {
            state.next_seq += 1;
            let seq = state.next_seq;
            state.written_at.insert(key.clone(), seq);
            state.expiries.insert(key, expiry);
        }
        Ok(result)
    }

    fn collection_mut<'a>(
        state: &'a mut State,
        keyspace: &Keyspace,
    ) -> Result<&'a mut BTreeMap<String, Value>, CouchbaseError> {
        state
            .docs
            .get_mut(keyspace)
            .ok_or_else(|| CouchbaseError::Query(format!("keyspace {keyspace} not found")))
    }
}

#[async_trait]
impl CouchbaseCluster for MemoryCluster {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, CouchbaseError> {
        Ok(self.lock().buckets.contains_key(bucket))
    }

    async fn scopes(&self, bucket: &str) -> Result<Vec<ScopeSpec>, CouchbaseError> {
        Ok(self.lock().buckets.get(bucket).cloned().unwrap_or_default())
    }

    async fn search_indexes(
        &self,
        location: &IndexLocation,
    ) -> Result<Vec<String>, CouchbaseError> {
        Ok(self
            .lock()
            .search_indexes
            .iter()
            .filter(|(_, def)| def.location == *location)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Value, CouchbaseError> {
        self.check("get")?;
        let mut state = self.lock();
        Self::collection_mut(&mut state, keyspace)?
            .get(key)
            .cloned()
            .ok_or_else(|| CouchbaseError::DocumentNotFound(key.to_string()))
    }

    async fn upsert_multi(
        &self,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.mutate("upsert", keyspace, docs, expiry, true)
    }

    async fn insert_multi(
        &self,
        keyspace: &Keyspace,
        docs: Vec<(String, Value)>,
        expiry: Option<Duration>,
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.mutate("insert", keyspace, docs, expiry, false)
    }

    async fn remove_multi(
        &self,
        keyspace: &Keyspace,
        keys: &[String],
    ) -> Result<MultiMutationResult, CouchbaseError> {
        self.check("remove")?;
        let mut state = self.lock();
        let poisoned = state.poisoned_keys.clone();
        let collection = Self::collection_mut(&mut state, keyspace)?;
        let mut result = MultiMutationResult::default();
        for key in keys {
            if poisoned.contains(key) {
                let err = CouchbaseError::Query(format!("document {key} was not removed"));
                result.failed.push((key.clone(), err));
            } else if collection.remove(key).is_some() {
                result.succeeded.push(key.clone());
            } else {
                let err = CouchbaseError::DocumentNotFound(key.clone());
                result.failed.push((key.clone(), err));
            }
        }
        Ok(result)
    }

    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &str,
        params: Map<String, Value>,
    ) -> Result<Vec<Value>, CouchbaseError> {
        self.lock().statements.push(statement.to_string());
        if statement.starts_with("CREATE ") {
            self.check("create_index")?;
            let name = Regex::new(r"^CREATE (?:VECTOR )?INDEX `([^`]+)`")
                .unwrap()
                .captures(statement)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            let mut state = self.lock();
            if !state.query_indexes.contains(&name) {
                state.query_indexes.push(name);
            }
            return Ok(Vec::new());
        }
        self.check("query")?;

        let mut state = self.lock();
        let written_at = state.written_at.clone();
        let collection = Self::collection_mut(&mut state, keyspace)?;

        if Regex::new(r"^DELETE FROM `[^`]+`$").unwrap().is_match(statement) {
            collection.clear();
            return Ok(Vec::new());
        }

        let session_delete = Regex::new(r"^DELETE FROM `[^`]+` WHERE `([^`]+)` = \$session_id$").unwrap();
        if let Some(c) = session_delete.captures(statement) {
            let field = c[1].to_string();
            let session = params.get("session_id").cloned().unwrap_or(Value::Null);
            collection.retain(|_, doc| doc.get(&field) != Some(&session));
            return Ok(Vec::new());
        }

        let session_select = Regex::new(
            r"^SELECT `([^`]+)` FROM `[^`]+` WHERE `([^`]+)` = \$session_id ORDER BY `([^`]+)` ASC$",
        )
        .unwrap();
        if let Some(c) = session_select.captures(statement) {
            let (message, field, ts) = (c[1].to_string(), c[2].to_string(), c[3].to_string());
            let session = params.get("session_id").cloned().unwrap_or(Value::Null);
            let mut rows: Vec<(f64, u64, Value)> = collection
                .iter()
                .filter(|(_, doc)| doc.get(&field) == Some(&session))
                .map(|(key, doc)| {
                    let mut row = Map::new();
                    if let Some(payload) = doc.get(&message) {
                        row.insert(message.clone(), payload.clone());
                    }
                    let ts = doc.get(&ts).and_then(Value::as_f64).unwrap_or(0.0);
                    let seq = written_at.get(key).copied().unwrap_or(0);
                    (ts, seq, Value::Object(row))
                })
                .collect();
            rows.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            return Ok(rows.into_iter().map(|(_, _, row)| row).collect());
        }

        let vector_select = Regex::new(
            r#"^SELECT META\(d\)\.id AS `id`, (.+), APPROX_VECTOR_DISTANCE\(d\.(.+?), \$query_vector, "(\w+)"\) AS `score` FROM `[^`]+` AS d(?: WHERE (.+))? ORDER BY `score` ASC LIMIT \$k$"#,
        )
        .unwrap();
        if let Some(c) = vector_select.captures(statement) {
            let projection = parse_projection(&c[1]);
            let embedding = parse_path(&c[2]);
            let metric = c[3].to_string();
            let predicate = c.get(4).map(|m| parse_predicate(m.as_str())).transpose()?;
            let query = vector_param(&params, "query_vector");
            let k = params.get("k").and_then(Value::as_u64).unwrap_or(0) as usize;

            let mut rows: Vec<(f64, Value)> = collection
                .iter()
                .filter(|(_, doc)| match &predicate {
                    Some((path, expected)) => lookup(doc, path) == Some(expected),
                    None => true,
                })
                .filter_map(|(id, doc)| {
                    let stored = as_vector(lookup(doc, &embedding)?)?;
                    let score = distance(&metric, &query, &stored);
                    let mut row = Map::new();
                    row.insert("id".into(), Value::String(id.clone()));
                    for (path, alias) in &projection {
                        if let Some(value) = lookup(doc, path) {
                            row.insert(alias.clone(), value.clone());
                        }
                    }
                    row.insert("score".into(), serde_json::json!(score));
                    Some((score, Value::Object(row)))
                })
                .collect();
            rows.sort_by(|a, b| a.0.total_cmp(&b.0));
            return Ok(rows.into_iter().take(k).map(|(_, row)| row).collect());
        }

        Err(CouchbaseError::Query(format!(
            "unsupported statement in fake: {statement}"
        )))
    }

    async fn search(
        &self,
        location: &IndexLocation,
        index: &str,
        request: Value,
    ) -> Result<Vec<SearchRow>, CouchbaseError> {
        self.check("search")?;
        let mut state = self.lock();
        state.search_requests.push(request.clone());

        let (keyspace, store_fields) = state
            .search_indexes
            .iter()
            .find(|(name, def)| name == index && def.location == *location)
            .map(|(_, def)| (def.keyspace.clone(), def.store_fields))
            .ok_or_else(|| CouchbaseError::Search(format!("index {index} not found")))?;
        let collection = Self::collection_mut(&mut state, &keyspace)?;

        let knn = &request["knn"][0];
        let field = knn["field"].as_str().unwrap_or("embedding").to_string();
        let query = as_vector(&knn["vector"]).unwrap_or_default();
        let k = knn["k"].as_u64().unwrap_or(0) as usize;
        let filter = knn.get("filter").cloned();
        let wanted: Vec<String> = request["fields"]
            .as_array()
            .map(|f| f.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let mut hits: Vec<SearchRow> = collection
            .iter()
            .filter_map(|(id, doc)| {
                let stored = as_vector(doc.get(&field)?)?;
                let flat = flatten(doc, &field);
                if let Some(filter) = &filter {
                    if !matches_filter(filter, &flat) {
                        return None;
                    }
                }
                let score = 1.0 / (1.0 + distance("l2", &query, &stored));
                let fields = store_fields.then(|| {
                    if wanted.iter().any(|f| f == "*") {
                        flat.clone()
                    } else {
                        flat.iter()
                            .filter(|(name, _)| wanted.contains(name))
                            .map(|(name, value)| (name.clone(), value.clone()))
                            .collect()
                    }
                });
                Some(SearchRow {
                    id: id.clone(),
                    score,
                    fields,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Statement and document helpers
// ---------------------------------------------------------------------------

/// `` `metadata`.`page` `` -> `["metadata", "page"]`; bare `a.b` also accepted.
fn parse_path(expr: &str) -> Vec<String> {
    expr.split('.')
        .map(|segment| segment.trim_matches('`').to_string())
        .collect()
}

/// Projection items as (path, alias).
fn parse_projection(list: &str) -> Vec<(Vec<String>, String)> {
    let item = Regex::new(r"^d\.(.+?)(?: AS `([^`]+)`)?$").unwrap();
    list.split(", ")
        .filter_map(|part| {
            let c = item.captures(part.trim())?;
            let path = parse_path(&c[1]);
            let alias = match c.get(2) {
                Some(alias) => alias.as_str().to_string(),
                None => path.last().cloned().unwrap_or_default(),
            };
            Some((path, alias))
        })
        .collect()
}

/// Only `d.<path> = <json literal>` predicates are understood.
fn parse_predicate(clause: &str) -> Result<(Vec<String>, Value), CouchbaseError> {
    let re = Regex::new(r"^d\.([\w.`]+) = (.+)$").unwrap();
    let c = re
        .captures(clause.trim())
        .ok_or_else(|| CouchbaseError::Query(format!("unsupported predicate: {clause}")))?;
    let value: Value = serde_json::from_str(&c[2])?;
    Ok((parse_path(&c[1]), value))
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |value, segment| value.get(segment))
}

fn as_vector(value: &Value) -> Option<Vec<f64>> {
    value
        .as_array()?
        .iter()
        .map(Value::as_f64)
        .collect::<Option<Vec<_>>>()
}

fn vector_param(params: &Map<String, Value>, name: &str) -> Vec<f64> {
    params.get(name).and_then(as_vector).unwrap_or_default()
}

fn distance(metric: &str, a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let squared: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    match metric {
        "dot" => -dot,
        "cosine" => {
            let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            1.0 - dot / (na * nb)
        }
        "l2_squared" | "euclidean_squared" => squared,
        _ => squared.sqrt(),
    }
}

/// Stored fields as the Search service returns them: nested objects are
/// flattened with dotted names and the vector field is left out.
fn flatten(doc: &Value, vector_field: &str) -> Map<String, Value> {
    fn walk(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
        match value {
            Value::Object(obj) => {
                for (key, child) in obj {
                    let name = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&name, child, out);
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
    let mut out = Map::new();
    if let Value::Object(obj) = doc {
        for (key, value) in obj {
            if key != vector_field {
                walk(key, value, &mut out);
            }
        }
    }
    out
}

fn matches_filter(filter: &Value, fields: &Map<String, Value>) -> bool {
    if let Some(children) = filter.get("conjuncts").and_then(Value::as_array) {
        return children.iter().all(|c| matches_filter(c, fields));
    }
    if let Some(children) = filter.get("disjuncts").and_then(Value::as_array) {
        return children.iter().any(|c| matches_filter(c, fields));
    }
    let field = filter["field"].as_str().unwrap_or_default();
    let stored = fields.get(field);
    if let Some(expected) = filter.get("match").or_else(|| filter.get("term")) {
        return stored == Some(expected);
    }
    let Some(number) = stored.and_then(Value::as_f64) else {
        return false;
    };
    let above = filter.get("min").and_then(Value::as_f64).is_none_or(|min| number >= min);
    let below = filter.get("max").and_then(Value::as_f64).is_none_or(|max| number < max);
    above && below
}

// ---------------------------------------------------------------------------
// ConsistentFakeEmbeddings
// ---------------------------------------------------------------------------

/// Embeds each distinct text as `[1.0; dim - 1] ++ [n]`, where `n` is the
/// order in which the text was first seen. Equal texts always embed equally.
pub struct ConsistentFakeEmbeddings {
    dimension: usize,
    known: Mutex<Vec<String>>,
}

impl ConsistentFakeEmbeddings {
    pub fn new() -> Self {
        Self::with_dimension(10)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            known: Mutex::new(Vec::new()),
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut known = self.known.lock().unwrap();
        let position = match known.iter().position(|t| t == text) {
            Some(position) => position,
            None => {
                known.push(text.to_string());
                known.len() - 1
            }
        };
        let mut vector = vec![1.0; self.dimension - 1];
        vector.push(position as f32);
        vector
    }
}

#[async_trait]
impl Embeddings for ConsistentFakeEmbeddings {
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SynapticError> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, SynapticError> {
        Ok(self.embed(text))
    }
}

/// Embedding model that always fails.
pub struct FailingEmbeddings;

#[async_trait]
impl Embeddings for FailingEmbeddings {
    async fn embed_documents(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, SynapticError> {
        Err(SynapticError::Embedding("model unavailable".into()))
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, SynapticError> {
        Err(SynapticError::Embedding("model unavailable".into()))
    }
}

pub fn keyspace() -> Keyspace {
    Keyspace::new(BUCKET, SCOPE, COLLECTION)
}
