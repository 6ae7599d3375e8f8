//! Drives one job from validation to its single published result.
//!
//! ```text
//! Validating -> Rejected -------------------------------------------+
//!            -> ReadyForQuery -> Transacting -> Streaming           |
//!                  -> Committed -> Archiving -> Terminal(Success)   |
//!                  -> Aborted ----------------> Terminal(Failure) <-+
//! ```
//!
//! The job's database session is dropped (released to the pool) before
//! archiving starts, whatever the streaming outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tdei_db::{DbProvider, DbSession};
use tracing::{debug, error, info, warn};

use crate::error::{JobError, Result};
use crate::message::{QueueMessage, ResultMessage};
use crate::operations::{self, JobPlan, Packaging};
use crate::pipeline::{
    ArchiveAssembler, ArchiveOutcome, SettlePolicy, SinkManager, UploadContext, stream_plan,
};
use crate::publisher::ResultPublisher;
use crate::storage::BlobStorage;

pub const ARCHIVE_UPLOADED: &str = "Dataset uploaded successfully!";
pub const OSM_UPLOADED: &str = "OSM uploaded successfully!";
pub const NO_DATA: &str = "No data found for given parameters.";

pub const DEFAULT_OSW_SCHEMA_URL: &str =
    "https://sidewalks.washington.edu/opensidewalks/0.2/schema.json";

/// Tunables shared by every job the orchestrator runs.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub fetch_batch_size: usize,
    /// Chunks buffered per output stream before row forwarding waits.
    pub sink_buffer_chunks: usize,
    pub settle: SettlePolicy,
    pub osw_schema_url: String,
    pub response_topic: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_batch_size: 1000,
            sink_buffer_chunks: 64,
            settle: SettlePolicy {
                floor: Duration::from_secs(5),
                retries: 5,
                backoff: Duration::from_secs(1),
            },
            osw_schema_url: DEFAULT_OSW_SCHEMA_URL.to_string(),
            response_topic: "backend-response".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Validating,
    ReadyForQuery,
    Rejected,
    Transacting,
    Streaming,
    Committed,
    Aborted,
    Archiving,
    Terminal(Outcome),
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::ReadyForQuery => "ready_for_query",
            Self::Rejected => "rejected",
            Self::Transacting => "transacting",
            Self::Streaming => "streaming",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Archiving => "archiving",
            Self::Terminal(Outcome::Success) => "success",
            Self::Terminal(Outcome::Failure) => "failure",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one job: the phases it passed through and the result
/// that was published for it.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    pub phases: Vec<JobPhase>,
    pub result: ResultMessage,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.result.data.success
    }
}

struct Completion {
    message: &'static str,
    file_upload_path: String,
}

struct PhaseLog<'a> {
    job_id: &'a str,
    phases: Vec<JobPhase>,
}

impl PhaseLog<'_> {
    fn enter(&mut self, phase: JobPhase) {
        info!(job_id = %self.job_id, phase = phase.as_str(), "job phase");
        self.phases.push(phase);
    }
}

pub struct JobOrchestrator {
    db: Arc<dyn DbProvider>,
    storage: Arc<dyn BlobStorage>,
    settings: PipelineSettings,
}

impl JobOrchestrator {
    pub fn new(
        db: Arc<dyn DbProvider>,
        storage: Arc<dyn BlobStorage>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            storage,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the job and publishes exactly one result for it.
    pub async fn run(&self, message: &QueueMessage, publisher: &dyn ResultPublisher) -> JobReport {
        let job_id = message.message_id.as_str();
        let mut log = PhaseLog {
            job_id,
            phases: Vec::new(),
        };
        log.enter(JobPhase::Validating);

        let outcome = match operations::plan(job_id, &message.data) {
            Err(err) => {
                log.enter(JobPhase::Rejected);
                Err(err)
            }
            Ok(plan) => {
                log.enter(JobPhase::ReadyForQuery);
                self.execute(plan, &mut log).await
            }
        };

        let result = match outcome {
            Ok(done) => {
                log.enter(JobPhase::Terminal(Outcome::Success));
                ResultMessage::success(
                    job_id,
                    &message.message_type,
                    done.message,
                    done.file_upload_path,
                )
            }
            Err(err) => {
                match &err {
                    JobError::InvalidInput(reason) => {
                        warn!(job_id = %job_id, reason = %reason, "job rejected")
                    }
                    other => error!(job_id = %job_id, error = %other, "job failed"),
                }
                log.enter(JobPhase::Terminal(Outcome::Failure));
                ResultMessage::failure(job_id, &message.message_type, err.public_message())
            }
        };

        if let Err(err) = publisher.publish(&self.settings.response_topic, &result).await {
            error!(job_id = %job_id, error = %err, "failed to publish job result");
        }
        JobReport {
            phases: log.phases,
            result,
        }
    }

    async fn execute(&self, plan: JobPlan, log: &mut PhaseLog<'_>) -> Result<Completion> {
        log.enter(JobPhase::Transacting);
        let mut session = self.db.acquire().await?;
        let streamed = self.transact(session.as_mut(), &plan, log).await;
        drop(session);
        debug!(job_id = %log.job_id, "database connection released");
        let mut context = streamed?;

        log.enter(JobPhase::Archiving);
        match plan.packaging {
            Packaging::Archive => {
                let assembler = ArchiveAssembler::new(Arc::clone(&self.storage), self.settings.settle);
                match assembler.zip_and_upload(&mut context).await? {
                    ArchiveOutcome::NoData => Ok(no_data()),
                    ArchiveOutcome::Archived(url) => Ok(Completion {
                        message: ARCHIVE_UPLOADED,
                        file_upload_path: url,
                    }),
                }
            }
            Packaging::SingleFile => {
                let Some(url) = context.remote_urls.first().cloned() else {
                    return Ok(no_data());
                };
                let assembler = ArchiveAssembler::new(Arc::clone(&self.storage), self.settings.settle);
                assembler.wait_for_availability(std::slice::from_ref(&url)).await;
                Ok(Completion {
                    message: OSM_UPLOADED,
                    file_upload_path: url,
                })
            }
        }
    }

    /// Runs everything that needs the transaction; commits only when
    /// streaming succeeded.
    async fn transact(
        &self,
        session: &mut dyn DbSession,
        plan: &JobPlan,
        log: &mut PhaseLog<'_>,
    ) -> Result<UploadContext> {
        session.batch_execute("BEGIN").await?;
        match self.stream(session, plan, log).await {
            Ok(context) => {
                session.batch_execute("COMMIT").await?;
                log.enter(JobPhase::Committed);
                Ok(context)
            }
            Err(err) => {
                if let Err(rollback) = session.batch_execute("ROLLBACK").await {
                    warn!(job_id = %log.job_id, error = %rollback, "rollback failed");
                }
                log.enter(JobPhase::Aborted);
                Err(err)
            }
        }
    }

    async fn stream(
        &self,
        session: &mut dyn DbSession,
        plan: &JobPlan,
        log: &mut PhaseLog<'_>,
    ) -> Result<UploadContext> {
        for statement in &plan.prelude {
            session.query(&statement.sql, &statement.params).await?;
        }
        let metadata =
            operations::resolve_metadata(session, plan, &self.settings.osw_schema_url).await?;
        let output_file_name = metadata
            .output_file_name
            .unwrap_or_else(|| plan.output_file_name.clone());
        let context = UploadContext::new(&plan.container, &plan.file_path, output_file_name);
        let mut sinks = SinkManager::new(
            Arc::clone(&self.storage),
            context,
            plan.format,
            metadata.headers,
            metadata.default_header,
            self.settings.sink_buffer_chunks,
        );

        log.enter(JobPhase::Streaming);
        match stream_plan(session, &plan.cursor_plan, self.settings.fetch_batch_size, &mut sinks).await {
            Ok(summary) => {
                info!(
                    job_id = %log.job_id,
                    operation = plan.operation,
                    cursors = summary.cursors,
                    rows = summary.rows,
                    files = sinks.context().remote_urls.len(),
                    "streaming finished"
                );
                Ok(sinks.into_context())
            }
            Err(err) => {
                sinks.abort_all();
                Err(err)
            }
        }
    }
}

fn no_data() -> Completion {
    Completion {
        message: NO_DATA,
        file_upload_path: String::new(),
    }
}
