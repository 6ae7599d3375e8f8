//! Server-side cursor streaming.
//!
//! A plan names one or more cursors, each bound to an output key. Cursors
//! are drained in order with `FETCH FORWARD`, one batch in memory at a time,
//! and every cursor the plan names is closed before this returns, whether
//! or not it was drained.

use postgres_protocol::escape::escape_identifier;
use serde_json::Value;
use tdei_db::{DbSession, JsonRow, SqlValue};
use tracing::{debug, error, warn};

use super::SinkManager;
use crate::error::{JobError, Result};

/// How the cursors for a job come into existence.
#[derive(Clone, Debug, PartialEq)]
pub enum CursorPlan {
    /// A planning statement returning `(file_name, cursor_ref)` rows.
    Function { sql: String, params: Vec<SqlValue> },
    /// A single cursor declared here over `query`.
    Declared {
        file_name: String,
        cursor_name: String,
        query: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorRef {
    pub file_name: String,
    pub cursor: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub cursors: usize,
    pub rows: u64,
}

/// Runs the plan's opening statement and returns the cursors it produced.
pub async fn open_plan(session: &mut dyn DbSession, plan: &CursorPlan) -> Result<Vec<CursorRef>> {
    match plan {
        CursorPlan::Function { sql, params } => {
            let rows = session.query(sql, params).await?;
            rows.iter().map(cursor_ref).collect()
        }
        CursorPlan::Declared {
            file_name,
            cursor_name,
            query,
        } => {
            session
                .batch_execute(&format!(
                    "DECLARE {} NO SCROLL CURSOR FOR {query}",
                    escape_identifier(cursor_name)
                ))
                .await?;
            Ok(vec![CursorRef {
                file_name: file_name.clone(),
                cursor: cursor_name.clone(),
            }])
        }
    }
}

fn cursor_ref(row: &JsonRow) -> Result<CursorRef> {
    let text = |column: &str| match row.get(column) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        _ => Err(JobError::Streaming(format!("planning row has no {column}"))),
    };
    Ok(CursorRef {
        file_name: text("file_name")?,
        cursor: text("cursor_ref")?,
    })
}

/// Opens the plan and streams every cursor into `sinks`.
///
/// On the first failure no further cursors are fetched; the failing
/// cursor and all remaining ones are still closed.
pub async fn stream_plan(
    session: &mut dyn DbSession,
    plan: &CursorPlan,
    batch_size: usize,
    sinks: &mut SinkManager,
) -> Result<StreamSummary> {
    let cursors = open_plan(session, plan).await?;
    debug!(cursors = cursors.len(), "cursor plan opened");

    let mut summary = StreamSummary::default();
    let mut failure = None;
    for cursor in &cursors {
        if failure.is_none() {
            match drain(session, cursor, batch_size.max(1), sinks).await {
                Ok(rows) => {
                    summary.cursors += 1;
                    summary.rows += rows;
                    if let Err(err) = sinks.finalize(&cursor.file_name).await {
                        failure = Some(err);
                    }
                }
                Err(err) => {
                    error!(cursor = %cursor.cursor, file_name = %cursor.file_name, error = %err, "cursor stream failed");
                    failure = Some(err);
                }
            }
        }
        close(session, cursor).await;
    }

    match failure {
        Some(err) => Err(err),
        None => {
            sinks.finalize_all().await?;
            Ok(summary)
        }
    }
}

async fn drain(
    session: &mut dyn DbSession,
    cursor: &CursorRef,
    batch_size: usize,
    sinks: &mut SinkManager,
) -> Result<u64> {
    let fetch = format!("FETCH FORWARD {batch_size} FROM {}", escape_identifier(&cursor.cursor));
    let mut rows = 0u64;
    loop {
        let batch = session
            .query(&fetch, &[])
            .await
            .map_err(|err| JobError::Streaming(err.to_string()))?;
        if batch.is_empty() {
            break;
        }
        for row in &batch {
            let key = match row.get("file_name") {
                Some(Value::String(name)) if !name.is_empty() => name.as_str(),
                _ => cursor.file_name.as_str(),
            };
            sinks.handle_row(key, row).await?;
        }
        rows += batch.len() as u64;
        if batch.len() < batch_size {
            break;
        }
    }
    debug!(cursor = %cursor.cursor, file_name = %cursor.file_name, rows, "cursor drained");
    Ok(rows)
}

async fn close(session: &mut dyn DbSession, cursor: &CursorRef) {
    let sql = format!("CLOSE {}", escape_identifier(&cursor.cursor));
    if let Err(err) = session.batch_execute(&sql).await {
        warn!(cursor = %cursor.cursor, error = %err, "failed to close cursor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{OutputFormat, UploadContext};
    use crate::testing::{ScriptedDatabase, feature_row, memory_storage};
    use std::collections::HashMap;
    use tdei_db::DbProvider;

    fn sinks() -> SinkManager {
        SinkManager::new(
            memory_storage(),
            UploadContext::new("osw", "backend-jobs/j/d", "out.zip"),
            OutputFormat::GeoJson,
            HashMap::new(),
            "{ \"features\": [".to_string(),
            4,
        )
    }

    fn plan() -> CursorPlan {
        CursorPlan::Function {
            sql: "SELECT file_name, cursor_ref::text AS cursor_ref FROM content.bbox_intersect($1)".into(),
            params: vec![SqlValue::text("d")],
        }
    }

    #[tokio::test]
    async fn drains_in_batches_and_closes() {
        let db = ScriptedDatabase::new()
            .with_plan(&[("edges", "c1"), ("nodes", "c2")])
            .with_cursor("c1", (0..5).map(feature_row).collect())
            .with_cursor("c2", vec![feature_row(9)]);
        let mut session = db.acquire().await.expect("session");
        let mut sinks = sinks();
        let summary = stream_plan(session.as_mut(), &plan(), 2, &mut sinks).await.expect("stream");
        assert_eq!(summary, StreamSummary { cursors: 2, rows: 6 });
        assert_eq!(sinks.context().remote_urls.len(), 2);

        let log = db.statements();
        let fetches = log.iter().filter(|sql| sql.starts_with("FETCH FORWARD 2 FROM \"c1\"")).count();
        assert_eq!(fetches, 3);
        assert!(log.contains(&"CLOSE \"c1\"".to_string()));
        assert!(log.contains(&"CLOSE \"c2\"".to_string()));
    }

    #[tokio::test]
    async fn failure_still_closes_every_cursor() {
        let db = ScriptedDatabase::new()
            .with_plan(&[("edges", "c1"), ("nodes", "c2"), ("zones", "c3")])
            .with_cursor("c1", vec![feature_row(1)])
            .with_cursor("c2", vec![feature_row(2)])
            .with_cursor("c3", vec![feature_row(3)])
            .fail_fetch("c2");
        let mut session = db.acquire().await.expect("session");
        let mut sinks = sinks();
        let err = stream_plan(session.as_mut(), &plan(), 10, &mut sinks)
            .await
            .expect_err("c2 fails");
        assert_eq!(err.public_message(), "Error streaming data");

        let log = db.statements();
        for cursor in ["c1", "c2", "c3"] {
            assert!(log.contains(&format!("CLOSE \"{cursor}\"")), "{cursor} left open: {log:?}");
        }
        assert!(!log.iter().any(|sql| sql.contains("FROM \"c3\"")));
    }

    #[tokio::test]
    async fn row_file_name_overrides_cursor_key() {
        let mut routed = feature_row(1);
        routed.insert("file_name".into(), Value::from("extensions_points"));
        let db = ScriptedDatabase::new()
            .with_plan(&[("edges", "c1")])
            .with_cursor("c1", vec![feature_row(0), routed]);
        let mut session = db.acquire().await.expect("session");
        let mut sinks = sinks();
        stream_plan(session.as_mut(), &plan(), 10, &mut sinks).await.expect("stream");
        let urls = &sinks.context().remote_urls;
        assert!(urls[0].ends_with("osw.edges.geojson"));
        assert!(urls[1].ends_with("osw.extensions_points.geojson"));
    }

    #[tokio::test]
    async fn declared_cursor_is_declared_and_closed() {
        let db = ScriptedDatabase::new().with_cursor("osm_export", Vec::new());
        let mut session = db.acquire().await.expect("session");
        let plan = CursorPlan::Declared {
            file_name: "d1".into(),
            cursor_name: "osm_export".into(),
            query: "SELECT 1".into(),
        };
        let summary = stream_plan(session.as_mut(), &plan, 10, &mut sinks()).await.expect("stream");
        assert_eq!(summary.rows, 0);
        let log = db.statements();
        assert_eq!(log[0], "DECLARE \"osm_export\" NO SCROLL CURSOR FOR SELECT 1");
        assert_eq!(log.last().map(String::as_str), Some("CLOSE \"osm_export\""));
    }
}
