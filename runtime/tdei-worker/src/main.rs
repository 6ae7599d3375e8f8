use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tdei_db::PgPool;
use tdei_worker::{JobOrchestrator, ObjectStoreBlobStorage, WorkerConfig, serve};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = WorkerConfig::parse();

    // stdout carries result frames
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(err) = config.validate() {
        error!(error = %err, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let pool = Arc::new(PgPool::new(config.pool_config()));
    let storage = Arc::new(ObjectStoreBlobStorage::new(config.storage_settings(std::env::vars())));
    let orchestrator = Arc::new(JobOrchestrator::new(
        pool.clone(),
        storage,
        config.pipeline_settings(),
    ));

    info!(
        host = %config.postgres_host,
        database = %config.postgres_db,
        concurrency = config.max_concurrent_messages,
        pool_size = pool.config().max_conns,
        "tdei worker serving stdin"
    );
    let served = serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        orchestrator,
        config.max_concurrent_messages,
    )
    .await;
    pool.close();

    match served {
        Ok(()) => {
            info!("input closed, worker exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "worker stopped on a transport error");
            ExitCode::FAILURE
        }
    }
}
