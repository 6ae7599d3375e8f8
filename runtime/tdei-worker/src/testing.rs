//! In-memory collaborators for exercising jobs without Postgres or a real
//! object store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tdei_db::{DbError, DbProvider, DbSession, JsonRow, SqlValue};
use tokio::sync::mpsc;

use crate::error::{PublishError, StorageError};
use crate::message::ResultMessage;
use crate::publisher::ResultPublisher;
use crate::storage::{BlobStorage, ObjectStoreBlobStorage, StorageSettings};

#[derive(Default)]
struct Script {
    statements: Vec<String>,
    bindings: Vec<(String, Vec<SqlValue>)>,
    /// `(fragment, rows)`: the first fragment contained in a query answers it.
    responses: Vec<(String, Vec<JsonRow>)>,
    failures: Vec<String>,
    cursors: HashMap<String, VecDeque<JsonRow>>,
    failing_cursors: HashSet<String>,
}

/// A [`DbProvider`] that answers from a script and records every statement.
#[derive(Clone, Default)]
pub struct ScriptedDatabase {
    script: Arc<Mutex<Script>>,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl ScriptedDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers queries containing `fragment` with `rows`.
    pub fn with_rows(self, fragment: &str, rows: Vec<JsonRow>) -> Self {
        self.script().responses.push((fragment.to_string(), rows));
        self
    }

    /// Answers the planning statement with `(file_name, cursor_ref)` rows.
    pub fn with_plan(self, cursors: &[(&str, &str)]) -> Self {
        let rows = cursors
            .iter()
            .map(|(file_name, cursor)| {
                let mut row = JsonRow::new();
                row.insert("file_name".to_string(), Value::from(*file_name));
                row.insert("cursor_ref".to_string(), Value::from(*cursor));
                row
            })
            .collect();
        self.with_rows("cursor_ref", rows)
    }

    pub fn with_cursor(self, name: &str, rows: Vec<JsonRow>) -> Self {
        self.script().cursors.insert(name.to_string(), rows.into());
        self
    }

    /// Fails any statement containing `fragment`.
    pub fn fail_on(self, fragment: &str) -> Self {
        self.script().failures.push(fragment.to_string());
        self
    }

    pub fn fail_fetch(self, cursor: &str) -> Self {
        self.script().failing_cursors.insert(cursor.to_string());
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.script().statements.clone()
    }

    /// Parameters bound to the first query containing `fragment`.
    pub fn params_for(&self, fragment: &str) -> Option<Vec<SqlValue>> {
        self.script()
            .bindings
            .iter()
            .find(|(sql, _)| sql.contains(fragment))
            .map(|(_, params)| params.clone())
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DbProvider for ScriptedDatabase {
    async fn acquire(&self) -> Result<Box<dyn DbSession>, DbError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            db: self.clone(),
        }))
    }
}

struct ScriptedSession {
    db: ScriptedDatabase,
}

impl ScriptedSession {
    fn record(&self, sql: &str) -> Result<(), DbError> {
        let mut script = self.db.script();
        script.statements.push(sql.to_string());
        if script.failures.iter().any(|fragment| sql.contains(fragment.as_str())) {
            return Err(DbError::generic(format!("scripted failure: {sql}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DbSession for ScriptedSession {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.record(sql)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<JsonRow>, DbError> {
        self.record(sql)?;
        let mut script = self.db.script();
        script.bindings.push((sql.to_string(), params.to_vec()));
        if let Some(rest) = sql.strip_prefix("FETCH FORWARD ") {
            let (count, cursor) = rest
                .split_once(" FROM ")
                .ok_or_else(|| DbError::generic("malformed FETCH"))?;
            let count: usize = count
                .parse()
                .map_err(|_| DbError::generic("malformed FETCH count"))?;
            let cursor = cursor.trim_matches('"');
            if script.failing_cursors.contains(cursor) {
                return Err(DbError::generic(format!("cursor \"{cursor}\" failed mid-stream")));
            }
            let rows = script
                .cursors
                .get_mut(cursor)
                .ok_or_else(|| DbError::generic(format!("cursor \"{cursor}\" does not exist")))?;
            let take = count.min(rows.len());
            return Ok(rows.drain(..take).collect());
        }
        Ok(script
            .responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.db.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects published results instead of sending them anywhere.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, ResultMessage)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, ResultMessage)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, message: &ResultMessage) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), message.clone()));
        Ok(())
    }
}

/// Blob storage backed by `object_store`'s in-memory store.
pub fn memory_storage() -> Arc<ObjectStoreBlobStorage> {
    Arc::new(ObjectStoreBlobStorage::new(StorageSettings {
        url_template: "memory:///{container}".to_string(),
        public_url: "https://storage.local".to_string(),
        options: Vec::new(),
    }))
}

/// Wraps a storage whose uploads work but whose downloads always fail.
pub struct BrokenDownloads(pub Arc<dyn BlobStorage>);

#[async_trait]
impl BlobStorage for BrokenDownloads {
    fn remote_url(&self, container: &str, path: &str) -> String {
        self.0.remote_url(container, path)
    }

    async fn upload_stream(
        &self,
        container: &str,
        path: &str,
        content_type: &str,
        body: mpsc::Receiver<Bytes>,
    ) -> Result<String, StorageError> {
        self.0.upload_stream(container, path, content_type, body).await
    }

    async fn upload(
        &self,
        container: &str,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<String, StorageError> {
        self.0.upload(container, path, content_type, body).await
    }

    async fn download(&self, url: &str) -> Result<Bytes, StorageError> {
        Err(StorageError::Download {
            url: url.to_string(),
            reason: "download refused".to_string(),
        })
    }

    async fn exists(&self, url: &str) -> Result<bool, StorageError> {
        self.0.exists(url).await
    }
}

/// A cursor row carrying a minimal GeoJSON feature.
pub fn feature_row(id: i64) -> JsonRow {
    let mut row = JsonRow::new();
    row.insert(
        "feature".to_string(),
        json!({"type": "Feature", "properties": {"_id": id}, "geometry": null}),
    );
    row
}

/// A single-row JSON object built from `value`.
pub fn json_row(value: Value) -> JsonRow {
    match value {
        Value::Object(map) => map,
        _ => JsonRow::new(),
    }
}
