//! Length-prefixed stdio frames carrying JSON or MessagePack payloads.

use std::io;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{QueueMessage, ResultMessage};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Invalid request: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// One outbound frame: a result routed to a topic.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a> {
    pub topic: &'a str,
    pub message: &'a ResultMessage,
}

impl WireCodec {
    /// Detects the codec and strictly decodes a job message.
    ///
    /// MessagePack is tried first and only accepted when the payload is a
    /// map; JSON text never starts with a map marker byte.
    pub fn decode_message(bytes: &[u8]) -> (Self, Result<QueueMessage, WireError>) {
        let (codec, value) = match rmp_serde::from_slice::<Value>(bytes) {
            Ok(value @ Value::Object(_)) => (Self::Msgpack, Ok(value)),
            _ => (
                Self::Json,
                serde_json::from_slice::<Value>(bytes).map_err(|err| WireError::Decode(err.to_string())),
            ),
        };
        let message = value.and_then(|value| {
            serde_json::from_value::<QueueMessage>(value).map_err(|err| WireError::Decode(err.to_string()))
        });
        (codec, message)
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Msgpack => rmp_serde::to_vec_named(value).map_err(|err| WireError::Encode(err.to_string())),
            Self::Json => serde_json::to_vec(value).map_err(|err| WireError::Encode(err.to_string())),
        }
    }
}

/// Reads one frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Value {
        json!({
            "messageId": "m-1",
            "messageType": "BACKEND_REQUEST",
            "data": {"service": "osw_osm_export", "parameters": {"tdei_dataset_id": "d"}, "user_id": "u"}
        })
    }

    #[test]
    fn detects_both_codecs() {
        let json_bytes = serde_json::to_vec(&job()).expect("json");
        let (codec, message) = WireCodec::decode_message(&json_bytes);
        assert_eq!(codec, WireCodec::Json);
        assert_eq!(message.expect("decoded").message_id, "m-1");

        let msgpack_bytes = rmp_serde::to_vec_named(&job()).expect("msgpack");
        let (codec, message) = WireCodec::decode_message(&msgpack_bytes);
        assert_eq!(codec, WireCodec::Msgpack);
        assert_eq!(message.expect("decoded").data.service, "osw_osm_export");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let (codec, message) = WireCodec::decode_message(b"not a frame");
        assert_eq!(codec, WireCodec::Json);
        assert!(matches!(message, Err(WireError::Decode(_))));
    }

    #[tokio::test]
    async fn frames_roundtrip_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.expect("write");
        drop(client);
        assert_eq!(read_frame(&mut server).await.expect("read"), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut server).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes())
            .await
            .expect("header");
        let err = read_frame(&mut server).await.expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
