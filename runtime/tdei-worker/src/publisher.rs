use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::PublishError;
use crate::message::ResultMessage;
use crate::wire::{OutboundFrame, WireCodec, write_frame};

/// Delivers terminal job results to the response topic.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, topic: &str, message: &ResultMessage) -> Result<(), PublishError>;
}

/// A result waiting for the frame writer.
#[derive(Debug)]
pub struct Outbound {
    pub codec: WireCodec,
    pub topic: String,
    pub message: ResultMessage,
}

/// Publishes results as frames on the process's output stream, in the
/// codec the job arrived in.
#[derive(Clone)]
pub struct FramePublisher {
    tx: mpsc::Sender<Outbound>,
    codec: WireCodec,
}

impl FramePublisher {
    pub fn new(tx: mpsc::Sender<Outbound>, codec: WireCodec) -> Self {
        Self { tx, codec }
    }
}

#[async_trait]
impl ResultPublisher for FramePublisher {
    async fn publish(&self, topic: &str, message: &ResultMessage) -> Result<(), PublishError> {
        self.tx
            .send(Outbound {
                codec: self.codec,
                topic: topic.to_string(),
                message: message.clone(),
            })
            .await
            .map_err(|_| PublishError {
                topic: topic.to_string(),
                reason: "frame writer has shut down".to_string(),
            })
    }
}

/// Drains queued results into frames until every sender is dropped.
pub async fn write_loop<W: AsyncWrite + Unpin>(mut rx: mpsc::Receiver<Outbound>, mut writer: W) {
    while let Some(outbound) = rx.recv().await {
        let frame = OutboundFrame {
            topic: &outbound.topic,
            message: &outbound.message,
        };
        let encoded = match outbound.codec.encode(&frame) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, message_id = %outbound.message.message_id, "failed to encode result");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded).await {
            error!(error = %err, "failed to write result frame");
            break;
        }
        debug!(message_id = %outbound.message.message_id, topic = %outbound.topic, "result published");
    }
}
