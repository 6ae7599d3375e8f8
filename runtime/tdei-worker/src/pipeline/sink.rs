//! Per-output-key streaming uploads.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tdei_db::JsonRow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{OutputFormat, UploadContext};
use crate::error::{JobError, Result, StorageError};
use crate::storage::BlobStorage;

enum SinkState {
    /// No row yet; nothing uploaded.
    Pending,
    Open {
        tx: mpsc::Sender<Bytes>,
        upload: JoinHandle<std::result::Result<String, StorageError>>,
    },
    Finished,
}

struct OutputSink {
    header: String,
    state: SinkState,
}

/// Owns one append-only upload stream per output key.
pub struct SinkManager {
    storage: Arc<dyn BlobStorage>,
    format: OutputFormat,
    buffer: usize,
    default_header: String,
    sinks: HashMap<String, OutputSink>,
    context: UploadContext,
}

impl SinkManager {
    /// `headers` holds the envelope prefix per known key; other keys get
    /// `default_header`.
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        context: UploadContext,
        format: OutputFormat,
        headers: HashMap<String, String>,
        default_header: String,
        buffer: usize,
    ) -> Self {
        let sinks = headers
            .into_iter()
            .map(|(key, header)| {
                (
                    key,
                    OutputSink {
                        header,
                        state: SinkState::Pending,
                    },
                )
            })
            .collect();
        Self {
            storage,
            format,
            buffer: buffer.max(1),
            default_header,
            sinks,
            context,
        }
    }

    pub fn context(&self) -> &UploadContext {
        &self.context
    }

    pub fn into_context(self) -> UploadContext {
        self.context
    }

    /// Appends one row to `key`'s stream, opening the upload on first use.
    pub async fn handle_row(&mut self, key: &str, row: &JsonRow) -> Result<()> {
        let payload = self.format.encode_row(row)?;
        let format = self.format;
        let sink = self.sinks.entry(key.to_string()).or_insert_with(|| OutputSink {
            header: self.default_header.clone(),
            state: SinkState::Pending,
        });

        let chunk = match sink.state {
            SinkState::Pending => {
                let mut chunk = BytesMut::with_capacity(sink.header.len() + payload.len());
                chunk.put_slice(sink.header.as_bytes());
                chunk.put_slice(&payload);
                let (tx, rx) = mpsc::channel(self.buffer);
                let storage = Arc::clone(&self.storage);
                let container = self.context.container_name.clone();
                let path = format!("{}/{}", self.context.file_path, format.file_name(key));
                let content_type = format.content_type();
                debug!(file = %path, "opening output stream");
                let upload = tokio::spawn(async move {
                    storage.upload_stream(&container, &path, content_type, rx).await
                });
                sink.state = SinkState::Open { tx, upload };
                chunk.freeze()
            }
            SinkState::Open { .. } => {
                let separator = format.separator();
                let mut chunk = BytesMut::with_capacity(separator.len() + payload.len());
                chunk.put_slice(separator);
                chunk.put_slice(&payload);
                chunk.freeze()
            }
            SinkState::Finished => {
                return Err(JobError::Streaming(format!(
                    "row for output {key} arrived after it was finalized"
                )));
            }
        };
        let SinkState::Open { tx, .. } = &sink.state else {
            return Err(JobError::Streaming(format!("output {key} is not open")));
        };
        tx.send(chunk)
            .await
            .map_err(|_| JobError::Streaming(format!("upload for output {key} stopped accepting data")))
    }

    /// Closes `key`'s stream and records its URL. A key that never saw a
    /// row is left out of the upload context.
    pub async fn finalize(&mut self, key: &str) -> Result<()> {
        let Some(sink) = self.sinks.get_mut(key) else {
            return Ok(());
        };
        let SinkState::Open { tx, upload } = std::mem::replace(&mut sink.state, SinkState::Finished)
        else {
            return Ok(());
        };
        let closing = self.format.closing();
        if !closing.is_empty() && tx.send(Bytes::from_static(closing)).await.is_err() {
            warn!(output = %key, "upload ended before the closing bracket");
        }
        drop(tx);
        let url = match upload.await {
            Ok(result) => result?,
            Err(err) => {
                return Err(StorageError::Upload {
                    path: key.to_string(),
                    reason: err.to_string(),
                }
                .into());
            }
        };
        info!(output = %key, url = %url, "finished streaming output");
        self.context.remote_urls.push(url);
        Ok(())
    }

    /// Finalizes every still-open stream, in key order.
    pub async fn finalize_all(&mut self) -> Result<()> {
        let mut open: Vec<String> = self
            .sinks
            .iter()
            .filter(|(_, sink)| matches!(sink.state, SinkState::Open { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        open.sort();
        for key in open {
            self.finalize(&key).await?;
        }
        Ok(())
    }

    /// Cancels every in-flight upload without completing it.
    pub fn abort_all(&mut self) {
        for (key, sink) in &mut self.sinks {
            if let SinkState::Open { upload, .. } = std::mem::replace(&mut sink.state, SinkState::Finished) {
                debug!(output = %key, "aborting output stream");
                upload.abort();
            }
        }
    }
}

impl OutputFormat {
    fn encode_row(self, row: &JsonRow) -> Result<Vec<u8>> {
        match self {
            Self::GeoJson => {
                let feature = row
                    .get("feature")
                    .ok_or_else(|| JobError::Streaming("row has no feature column".to_string()))?;
                serde_json::to_vec(feature).map_err(|err| JobError::Streaming(err.to_string()))
            }
            Self::OsmXml => match row.get("line") {
                Some(Value::String(line)) => {
                    let mut out = Vec::with_capacity(line.len() + 1);
                    out.extend_from_slice(line.as_bytes());
                    out.push(b'\n');
                    Ok(out)
                }
                Some(Value::Null) => Ok(b"\n".to_vec()),
                _ => Err(JobError::Streaming("row has no line column".to_string())),
            },
        }
    }

    fn separator(self) -> &'static [u8] {
        match self {
            Self::GeoJson => b",",
            Self::OsmXml => b"",
        }
    }

    fn closing(self) -> &'static [u8] {
        match self {
            Self::GeoJson => b"]}",
            Self::OsmXml => b"",
        }
    }
}
