//! Zip assembly of a job's uploaded files.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::UploadContext;
use crate::error::{JobError, Result};
use crate::storage::BlobStorage;

/// Grace period before re-reading uploaded files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettlePolicy {
    /// Always waited before the first existence check.
    pub floor: Duration,
    pub retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff: Duration,
}

impl SettlePolicy {
    pub fn immediate() -> Self {
        Self {
            floor: Duration::ZERO,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// No file was uploaded; nothing to zip.
    NoData,
    Archived(String),
}

pub struct ArchiveAssembler {
    storage: Arc<dyn BlobStorage>,
    settle: SettlePolicy,
}

impl ArchiveAssembler {
    pub fn new(storage: Arc<dyn BlobStorage>, settle: SettlePolicy) -> Self {
        Self { storage, settle }
    }

    /// Waits for every URL to become visible. Returns `false` if some are
    /// still missing once retries run out.
    pub async fn wait_for_availability(&self, urls: &[String]) -> bool {
        if !self.settle.floor.is_zero() {
            tokio::time::sleep(self.settle.floor).await;
        }
        let mut pending: Vec<&String> = urls.iter().collect();
        let mut delay = self.settle.backoff;
        for attempt in 0..=self.settle.retries {
            let checks = join_all(pending.iter().map(|url| self.storage.exists(url))).await;
            pending = pending
                .into_iter()
                .zip(checks)
                .filter(|(_, visible)| !matches!(visible, Ok(true)))
                .map(|(url, _)| url)
                .collect();
            if pending.is_empty() {
                return true;
            }
            if attempt < self.settle.retries {
                debug!(attempt, missing = pending.len(), "waiting for uploads to settle");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        warn!(missing = ?pending, "uploads still not visible after settling");
        false
    }

    /// Zips every uploaded file into one archive and uploads it.
    pub async fn zip_and_upload(&self, ctx: &mut UploadContext) -> Result<ArchiveOutcome> {
        if ctx.remote_urls.is_empty() {
            return Ok(ArchiveOutcome::NoData);
        }
        self.wait_for_availability(&ctx.remote_urls).await;

        let entries = try_join_all(ctx.remote_urls.iter().map(|url| async move {
            let body = self.storage.download(url).await?;
            Ok::<_, crate::error::StorageError>((entry_name(url).to_string(), body))
        }))
        .await
        .map_err(|err| JobError::Archive(err.to_string()))?;

        let archive = tokio::task::spawn_blocking(move || build_archive(entries))
            .await
            .map_err(|err| JobError::Archive(err.to_string()))??;

        let path = format!("{}/{}", ctx.file_path, ctx.output_file_name);
        let url = self
            .storage
            .upload(&ctx.container_name, &path, "application/zip", Bytes::from(archive))
            .await
            .map_err(|err| JobError::Archive(err.to_string()))?;
        info!(url = %url, files = ctx.remote_urls.len(), "archive uploaded");
        ctx.zip_url = Some(url.clone());
        Ok(ArchiveOutcome::Archived(url))
    }
}

/// The last path segment of a file URL.
pub fn entry_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

pub fn build_archive(entries: Vec<(String, Bytes)>) -> Result<Vec<u8>> {
    let zip_error = |err: zip::result::ZipError| JobError::Archive(err.to_string());
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in entries {
        writer.start_file(name, options).map_err(zip_error)?;
        writer
            .write_all(&body)
            .map_err(|err| JobError::Archive(err.to_string()))?;
    }
    Ok(writer.finish().map_err(zip_error)?.into_inner())
}
