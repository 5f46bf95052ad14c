use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use synaptic_core::{ChatMessageHistory, Message};
use tracing::{Instrument, Span};

use crate::cluster::{ident, Keyspace};
use crate::validation::{require, validate_ttl, ConnectionValidator, ResolvedKeyspace};
use crate::vector_store::{generate_id, DEFAULT_BATCH_SIZE};
use crate::{CouchbaseCluster, CouchbaseError};

const DEFAULT_SESSION_ID_KEY: &str = "session_id";
const DEFAULT_MESSAGE_KEY: &str = "message";
const TS_KEY: &str = "ts";
const INDEX_NAME: &str = "LANGCHAIN_CHAT_HISTORY";

// ---------------------------------------------------------------------------
// ChatHistoryConfig
// ---------------------------------------------------------------------------

/// Configuration for [`CouchbaseChatMessageHistory`].
#[derive(Debug, Clone)]
pub struct ChatHistoryConfig {
    pub keyspace: Keyspace,
    /// Session the history belongs to.
    pub session_id: String,
    /// Field holding the session id (default: `session_id`).
    pub session_id_key: String,
    /// Field holding the serialized message (default: `message`).
    pub message_key: String,
    /// Create the `(session_id, ts, message)` index at construction (default: `true`).
    pub create_index: bool,
    /// Optional expiry applied to every stored message.
    pub ttl: Option<Duration>,
    /// Messages per insert request in `add_messages` (default: 100).
    pub batch_size: usize,
}

impl ChatHistoryConfig {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            keyspace: Keyspace::new(bucket, scope, collection),
            session_id: session_id.into(),
            session_id_key: DEFAULT_SESSION_ID_KEY.to_string(),
            message_key: DEFAULT_MESSAGE_KEY.to_string(),
            create_index: true,
            ttl: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_session_id_key(mut self, key: impl Into<String>) -> Self {
        self.session_id_key = key.into();
        self
    }

    pub fn with_message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = key.into();
        self
    }

    pub fn with_create_index(mut self, create_index: bool) -> Self {
        self.create_index = create_index;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

// ---------------------------------------------------------------------------
// CouchbaseChatMessageHistory
// ---------------------------------------------------------------------------

/// Append-only chat history for one session.
///
/// Every message is its own document `{message, session_id, ts}` under a
/// random key, so writers never contend. Reads order by `ts`; messages
/// written within the same microsecond come back in the order the query
/// service sorts them.
pub struct CouchbaseChatMessageHistory {
    resolved: ResolvedKeyspace,
    session_id: String,
    session_id_key: String,
    message_key: String,
    ttl: Option<Duration>,
    batch_size: usize,
    span: Span,
}

impl CouchbaseChatMessageHistory {
    /// Validate the keyspace and TTL, then optionally create the history index.
    ///
    /// Index creation failures are logged and do not fail construction.
    pub async fn new(
        cluster: Arc<dyn CouchbaseCluster>,
        config: ChatHistoryConfig,
    ) -> Result<Self, CouchbaseError> {
        let span = tracing::info_span!(
            "couchbase_chat_history",
            keyspace = %config.keyspace,
            session_id = %config.session_id,
        );
        let resolved = ConnectionValidator::validate(cluster, config.keyspace).await?;
        require("session_id", &config.session_id)?;
        let ttl = validate_ttl(config.ttl)?;
        if config.batch_size == 0 {
            return Err(CouchbaseError::InvalidArgument(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        let history = Self {
            resolved,
            session_id: config.session_id,
            session_id_key: config.session_id_key,
            message_key: config.message_key,
            ttl,
            batch_size: config.batch_size,
            span,
        };

        if config.create_index {
            if let Err(e) = history
                .create_index()
                .instrument(history.span.clone())
                .await
            {
                history
                    .span
                    .in_scope(|| tracing::error!(error = %e, "error creating index"));
            }
        }
        Ok(history)
    }

    /// Replace the span that history events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.resolved.keyspace()
    }

    /// Idempotently create the index backing the ordered session read.
    pub async fn create_index(&self) -> Result<(), CouchbaseError> {
        let statement = format!(
            "CREATE INDEX {} IF NOT EXISTS ON {}({}, {}, {})",
            ident(INDEX_NAME),
            self.keyspace().collection_ident(),
            ident(&self.session_id_key),
            ident(TS_KEY),
            ident(&self.message_key),
        );
        self.resolved.query(&statement, Map::new()).await.map(|_| ())
    }

    fn record(&self, message: &Message) -> Result<(String, Value), CouchbaseError> {
        let mut doc = Map::new();
        doc.insert(self.message_key.clone(), serde_json::to_value(message)?);
        doc.insert(self.session_id_key.clone(), json!(self.session_id));
        doc.insert(TS_KEY.to_string(), json!(timestamp()));
        Ok((generate_id(), Value::Object(doc)))
    }

    fn session_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("session_id".to_string(), json!(self.session_id));
        params
    }

    /// Insert one message under a fresh key.
    pub async fn try_add_message(&self, message: &Message) -> Result<(), CouchbaseError> {
        let (key, doc) = self.record(message)?;
        self.resolved.insert(&key, doc, self.ttl).await
    }

    /// Insert messages `batch_size` at a time.
    ///
    /// Stops at the first failed batch; earlier batches stay written.
    pub async fn try_add_messages(&self, messages: &[Message]) -> Result<(), CouchbaseError> {
        for batch in messages.chunks(self.batch_size) {
            let docs = batch
                .iter()
                .map(|message| self.record(message))
                .collect::<Result<Vec<_>, _>>()?;
            let result = self.resolved.insert_multi(docs, self.ttl).await?;
            if !result.all_ok() {
                return Err(CouchbaseError::PartialFailure {
                    keys: result.failed_keys(),
                });
            }
        }
        Ok(())
    }

    /// All messages of the session, oldest first.
    ///
    /// Rows that do not decode as a message are skipped with a warning.
    pub async fn try_messages(&self) -> Result<Vec<Message>, CouchbaseError> {
        let statement = format!(
            "SELECT {message} FROM {coll} WHERE {session} = $session_id ORDER BY {ts} ASC",
            message = ident(&self.message_key),
            coll = self.keyspace().collection_ident(),
            session = ident(&self.session_id_key),
            ts = ident(TS_KEY),
        );
        let rows = self.resolved.query(&statement, self.session_params()).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for mut row in rows {
            let payload = row
                .get_mut(&self.message_key)
                .map(Value::take)
                .unwrap_or(Value::Null);
            match serde_json::from_value::<Message>(payload) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable chat message"),
            }
        }
        Ok(messages)
    }

    /// Delete every message of the session.
    pub async fn try_clear(&self) -> Result<(), CouchbaseError> {
        let statement = format!(
            "DELETE FROM {} WHERE {} = $session_id",
            self.keyspace().collection_ident(),
            ident(&self.session_id_key),
        );
        self.resolved
            .query(&statement, self.session_params())
            .await
            .map(|_| ())
    }
}

/// Wall-clock seconds since the Unix epoch, with microsecond precision.
fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// ChatMessageHistory implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ChatMessageHistory for CouchbaseChatMessageHistory {
    async fn messages(&self) -> Vec<Message> {
        async {
            self.try_messages().await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "error fetching messages");
                Vec::new()
            })
        }
        .instrument(self.span.clone())
        .await
    }

    async fn add_message(&self, message: Message) {
        if let Err(e) = self
            .try_add_message(&message)
            .instrument(self.span.clone())
            .await
        {
            self.span
                .in_scope(|| tracing::error!(error = %e, "error adding message"));
        }
    }

    async fn add_messages(&self, messages: Vec<Message>) {
        if let Err(e) = self
            .try_add_messages(&messages)
            .instrument(self.span.clone())
            .await
        {
            self.span
                .in_scope(|| tracing::error!(error = %e, "error adding messages"));
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.try_clear().instrument(self.span.clone()).await {
            self.span
                .in_scope(|| tracing::error!(error = %e, "error clearing chat history"));
        }
    }
}
