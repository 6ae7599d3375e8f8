//! Blob storage capability and its `object_store` implementation.
//!
//! Files are addressed by `<public base>/<container>/<path>` URLs. Each
//! container maps to one store, resolved from a URL template such as
//! `az://{container}` or `s3://bucket/{container}` and cached for reuse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutPayload, WriteMultipart};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::error::StorageError;

const UPLOAD_CONCURRENCY: usize = 8;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// URL a file at `path` in `container` will be reachable at.
    fn remote_url(&self, container: &str, path: &str) -> String;

    /// Uploads chunks from `body` until the sender side closes.
    async fn upload_stream(
        &self,
        container: &str,
        path: &str,
        content_type: &str,
        body: mpsc::Receiver<Bytes>,
    ) -> Result<String, StorageError>;

    async fn upload(
        &self,
        container: &str,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<String, StorageError>;

    async fn download(&self, url: &str) -> Result<Bytes, StorageError>;

    async fn exists(&self, url: &str) -> Result<bool, StorageError>;
}

#[derive(Clone, Debug)]
pub struct StorageSettings {
    /// Store URL with a `{container}` placeholder.
    pub url_template: String,
    /// Base of the URLs reported for uploaded files.
    pub public_url: String,
    /// Credentials and tuning passed through to `object_store`.
    pub options: Vec<(String, String)>,
}

struct Container {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

pub struct ObjectStoreBlobStorage {
    settings: StorageSettings,
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl ObjectStoreBlobStorage {
    pub fn new(mut settings: StorageSettings) -> Self {
        settings.public_url = settings.public_url.trim_end_matches('/').to_string();
        Self {
            settings,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Binds `container` to an existing store, bypassing the URL template.
    pub fn register(&self, container: &str, store: Arc<dyn ObjectStore>) {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                container.to_string(),
                Arc::new(Container {
                    store,
                    prefix: Path::default(),
                }),
            );
    }

    fn container(&self, name: &str) -> Result<Arc<Container>, StorageError> {
        let mut containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(container) = containers.get(name) {
            return Ok(Arc::clone(container));
        }
        let raw = self.settings.url_template.replace("{container}", name);
        let url = Url::parse(&raw).map_err(|err| StorageError::InvalidUrl {
            url: raw.clone(),
            reason: err.to_string(),
        })?;
        let (store, prefix) = object_store::parse_url_opts(&url, self.settings.options.iter().cloned())?;
        debug!(container = %name, url = %url, "opened storage container");
        let container = Arc::new(Container {
            store: Arc::from(store),
            prefix,
        });
        containers.insert(name.to_string(), Arc::clone(&container));
        Ok(container)
    }

    fn locate(&self, url: &str) -> Result<(Arc<Container>, Path), StorageError> {
        let invalid = |reason: &str| StorageError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let rest = url
            .strip_prefix(&self.settings.public_url)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| invalid("not under the storage public url"))?;
        let (container, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing container or file path"))?;
        let container = self.container(container)?;
        let location = object_path(&container.prefix, path);
        Ok((container, location))
    }
}

fn object_path(prefix: &Path, path: &str) -> Path {
    let prefix = prefix.as_ref();
    if prefix.is_empty() {
        Path::from(path)
    } else {
        Path::from(format!("{prefix}/{path}"))
    }
}

fn content_type(value: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(Attribute::ContentType, value.to_string().into());
    attributes
}

#[async_trait]
impl BlobStorage for ObjectStoreBlobStorage {
    fn remote_url(&self, container: &str, path: &str) -> String {
        format!("{}/{container}/{path}", self.settings.public_url)
    }

    async fn upload_stream(
        &self,
        container: &str,
        path: &str,
        content_type_value: &str,
        mut body: mpsc::Receiver<Bytes>,
    ) -> Result<String, StorageError> {
        let target = self.container(container)?;
        let location = object_path(&target.prefix, path);
        let upload = target
            .store
            .put_multipart_opts(&location, content_type(content_type_value).into())
            .await?;
        let mut writer = WriteMultipart::new(upload);
        while let Some(chunk) = body.recv().await {
            if let Err(err) = writer.wait_for_capacity(UPLOAD_CONCURRENCY).await {
                warn!(path = %location, error = %err, "aborting streamed upload");
                // The part failure is the error worth reporting.
                let _ = writer.abort().await;
                return Err(err.into());
            }
            writer.write(&chunk);
        }
        writer.finish().await?;
        debug!(path = %location, "streamed upload complete");
        Ok(self.remote_url(container, path))
    }

    async fn upload(
        &self,
        container: &str,
        path: &str,
        content_type_value: &str,
        body: Bytes,
    ) -> Result<String, StorageError> {
        let target = self.container(container)?;
        let location = object_path(&target.prefix, path);
        target
            .store
            .put_opts(
                &location,
                PutPayload::from(body),
                content_type(content_type_value).into(),
            )
            .await?;
        Ok(self.remote_url(container, path))
    }

    async fn download(&self, url: &str) -> Result<Bytes, StorageError> {
        let (container, location) = self.locate(url)?;
        let failed = |err: object_store::Error| StorageError::Download {
            url: url.to_string(),
            reason: err.to_string(),
        };
        container
            .store
            .get(&location)
            .await
            .map_err(failed)?
            .bytes()
            .await
            .map_err(failed)
    }

    async fn exists(&self, url: &str) -> Result<bool, StorageError> {
        let (container, location) = self.locate(url)?;
        match container.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
