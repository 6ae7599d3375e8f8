//! The stdio frame loop: decode jobs, run them concurrently, write results.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::message::ResultMessage;
use crate::orchestrator::JobOrchestrator;
use crate::publisher::{FramePublisher, Outbound, write_loop};
use crate::wire::{WireCodec, read_frame};

/// Serves jobs from `reader` until it reaches end of stream, then waits for
/// in-flight jobs and flushes their results to `writer`.
///
/// At most `max_concurrent` jobs run at once; no further frame is read
/// while all of them are busy.
pub async fn serve<R, W>(
    mut reader: R,
    writer: W,
    orchestrator: Arc<JobOrchestrator>,
    max_concurrent: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let max_concurrent = max_concurrent.max(1);
    let (tx, rx) = mpsc::channel::<Outbound>(max_concurrent * 4);
    let writer_task = tokio::spawn(write_loop(rx, writer));
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let topic = orchestrator.settings().response_topic.clone();
    let mut jobs = JoinSet::new();

    let outcome = loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break Ok(());
        };
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => {
                error!(error = %err, "failed to read frame");
                reject(&tx, WireCodec::Json, &topic, format!("Invalid request: {err}")).await;
                break Err(err);
            }
        };
        let (codec, decoded) = WireCodec::decode_message(&frame);
        let message = match decoded {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "rejecting undecodable frame");
                reject(&tx, codec, &topic, err.to_string()).await;
                continue;
            }
        };
        debug!(job_id = %message.message_id, service = %message.data.service, "job accepted");
        let publisher = FramePublisher::new(tx.clone(), codec);
        let orchestrator = Arc::clone(&orchestrator);
        jobs.spawn(async move {
            let _permit = permit;
            let report = orchestrator.run(&message, &publisher).await;
            info!(
                job_id = %message.message_id,
                success = report.succeeded(),
                "job finished"
            );
        });
        while let Some(finished) = jobs.try_join_next() {
            log_join(finished);
        }
    };

    while let Some(finished) = jobs.join_next().await {
        log_join(finished);
    }
    drop(tx);
    if let Err(err) = writer_task.await {
        error!(error = %err, "frame writer task failed");
    }
    outcome
}

async fn reject(tx: &mpsc::Sender<Outbound>, codec: WireCodec, topic: &str, reason: String) {
    let outbound = Outbound {
        codec,
        topic: topic.to_string(),
        message: ResultMessage::failure("", "", reason),
    };
    if tx.send(outbound).await.is_err() {
        error!("frame writer has shut down");
    }
}

fn log_join(finished: Result<(), JoinError>) {
    if let Err(err) = finished {
        error!(error = %err, "job task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PipelineSettings;
    use crate::testing::{ScriptedDatabase, memory_storage};
    use crate::wire::write_frame;
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn undecodable_frames_get_an_anonymous_failure() {
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(ScriptedDatabase::new()),
            memory_storage(),
            PipelineSettings::default(),
        ));
        let (mut input, reader) = tokio::io::duplex(1024);
        let (writer, mut output) = tokio::io::duplex(1024);
        write_frame(&mut input, b"{\"messageId\": 1}").await.expect("write");
        input.shutdown().await.expect("shutdown");
        drop(input);

        serve(reader, writer, orchestrator, 1).await.expect("serve");
        let frame = read_frame(&mut output).await.expect("read").expect("one frame");
        let value: Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(value["topic"], "backend-response");
        assert_eq!(value["message"]["messageId"], "");
        assert_eq!(value["message"]["data"]["success"], false);
        assert!(
            value["message"]["data"]["message"]
                .as_str()
                .unwrap_or_default()
                .starts_with("Invalid request")
        );
    }
}
