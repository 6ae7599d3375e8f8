//! Process configuration, read once by the binary from flags and the
//! environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tdei_db::{PgConfig, PgPoolConfig, SslMode};
use url::Url;

use crate::error::ConfigError;
use crate::orchestrator::{DEFAULT_OSW_SCHEMA_URL, PipelineSettings};
use crate::pipeline::SettlePolicy;
use crate::storage::StorageSettings;

/// TDEI backend job worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "tdei-worker")]
#[command(about = "Runs TDEI backend jobs read as frames from stdin")]
pub struct WorkerConfig {
    #[arg(long, default_value = "localhost", env = "POSTGRES_HOST")]
    pub postgres_host: String,

    #[arg(long, default_value_t = 5432, env = "POSTGRES_PORT")]
    pub postgres_port: u16,

    #[arg(long, default_value = "postgres", env = "POSTGRES_USER")]
    pub postgres_user: String,

    #[arg(long, default_value = "", env = "POSTGRES_PASSWORD", hide_env_values = true)]
    pub postgres_password: String,

    #[arg(long, default_value = "postgres", env = "POSTGRES_DB")]
    pub postgres_db: String,

    /// Require TLS for database connections.
    #[arg(long, env = "SSL")]
    pub ssl: bool,

    /// PEM bundle trusted in addition to the native roots.
    #[arg(long, env = "SSL_ROOT_CERT")]
    pub ssl_root_cert: Option<PathBuf>,

    /// Jobs run at the same time.
    #[arg(long, default_value_t = 2, env = "MAX_CONCURRENT_MESSAGES")]
    pub max_concurrent_messages: usize,

    /// Defaults to one more than the job concurrency.
    #[arg(long, env = "DB_POOL_SIZE")]
    pub pool_size: Option<usize>,

    #[arg(long, default_value = "backend-response", env = "BACKEND_RESPONSE_TOPIC")]
    pub backend_response_topic: String,

    #[arg(long, default_value = DEFAULT_OSW_SCHEMA_URL, env = "OSW_SCHEMA_URL")]
    pub osw_schema_url: String,

    /// Store URL per container, e.g. `az://{container}` or `s3://bucket/{container}`.
    #[arg(long, default_value = "memory:///{container}", env = "STORAGE_URL_TEMPLATE")]
    pub storage_url_template: String,

    /// Base of reported file URLs.
    #[arg(long, default_value = "https://storage.local", env = "STORAGE_PUBLIC_URL")]
    pub storage_public_url: String,

    #[arg(long, default_value_t = 1000, env = "FETCH_BATCH_SIZE")]
    pub fetch_batch_size: usize,

    #[arg(long, default_value_t = 64, env = "SINK_BUFFER_CHUNKS")]
    pub sink_buffer_chunks: usize,

    #[arg(long, default_value_t = 5000, env = "SETTLE_DELAY_MS")]
    pub settle_delay_ms: u64,

    #[arg(long, default_value_t = 5, env = "AVAILABILITY_RETRIES")]
    pub availability_retries: u32,

    #[arg(long, default_value_t = 1000, env = "AVAILABILITY_BACKOFF_MS")]
    pub availability_backoff_ms: u64,

    /// Used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                })
            } else {
                Ok(())
            }
        };
        positive("max_concurrent_messages", self.max_concurrent_messages)?;
        positive("fetch_batch_size", self.fetch_batch_size)?;
        positive("sink_buffer_chunks", self.sink_buffer_chunks)?;
        if let Some(size) = self.pool_size {
            positive("pool_size", size)?;
        }
        Url::parse(&self.storage_public_url).map_err(|err| ConfigError::Invalid {
            field: "storage_public_url",
            reason: err.to_string(),
        })?;
        Url::parse(&self.storage_url_template.replace("{container}", "osw")).map_err(|err| {
            ConfigError::Invalid {
                field: "storage_url_template",
                reason: err.to_string(),
            }
        })?;
        Ok(())
    }

    pub fn pool_config(&self) -> PgPoolConfig {
        let mut pg = PgConfig::new();
        pg.host(&self.postgres_host)
            .port(self.postgres_port)
            .user(&self.postgres_user)
            .password(&self.postgres_password)
            .dbname(&self.postgres_db)
            .application_name("tdei-backend-worker")
            .ssl_mode(if self.ssl {
                SslMode::Require
            } else {
                SslMode::Disable
            });
        let mut config = PgPoolConfig::new(pg);
        config.max_conns = self
            .pool_size
            .unwrap_or(self.max_concurrent_messages + 1);
        config.ssl_root_cert = self.ssl_root_cert.clone();
        config
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            fetch_batch_size: self.fetch_batch_size,
            sink_buffer_chunks: self.sink_buffer_chunks,
            settle: SettlePolicy {
                floor: Duration::from_millis(self.settle_delay_ms),
                retries: self.availability_retries,
                backoff: Duration::from_millis(self.availability_backoff_ms),
            },
            osw_schema_url: self.osw_schema_url.clone(),
            response_topic: self.backend_response_topic.clone(),
        }
    }

    pub fn storage_settings(&self, env: impl IntoIterator<Item = (String, String)>) -> StorageSettings {
        StorageSettings {
            url_template: self.storage_url_template.clone(),
            public_url: self.storage_public_url.clone(),
            options: storage_options(env),
        }
    }
}

/// `AZURE_*` and `AWS_*` variables as `object_store` config keys.
pub fn storage_options(env: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut options: Vec<(String, String)> = env
        .into_iter()
        .filter(|(key, _)| key.starts_with("AZURE_") || key.starts_with("AWS_"))
        .map(|(key, value)| (key.to_ascii_lowercase(), value))
        .collect();
    options.sort();
    options
}
