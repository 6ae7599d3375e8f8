//! TDEI backend job worker.
//!
//! Compiles spatial-join requests to SQL, streams server-side cursors into
//! per-type GeoJSON (or OSM XML) uploads, zips the results, and publishes
//! one result message per job.

pub mod config;
pub mod error;
pub mod message;
pub mod operations;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;
pub mod query;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wire;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{ConfigError, JobError, PublishError, Result, StorageError};
pub use message::{BackendRequest, QueueMessage, ResultMessage};
pub use orchestrator::{JobOrchestrator, JobPhase, JobReport, Outcome, PipelineSettings};
pub use publisher::{FramePublisher, ResultPublisher};
pub use query::{JoinSpec, compile};
pub use storage::{BlobStorage, ObjectStoreBlobStorage, StorageSettings};
pub use worker::serve;
