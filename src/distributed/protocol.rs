//! Coordinator/worker wire protocol
//!
//! Every message is a MessagePack body behind a 4-byte little-endian length:
//!
//! ```text
//! [4 bytes: body length (u32 LE)][N bytes: MessagePack message]
//! ```
//!
//! One TCP connection carries one worker. The coordinator opens it, sends a
//! `Config` (the worker's Init directive), then `Process`/`Park` directives,
//! and finally `Shutdown`. The worker answers `Ready` to the config, a `Report`
//! to every directive except `Park`, and closes the connection after its
//! finalize report.

use crate::chunk::Chunk;
use crate::resource::WorkerBudget;
use crate::task::SharedSpecification;
use crate::worker::Report;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version, checked on both sides of the config exchange
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest message body accepted
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Coordinator → worker: initialise
    Config(ConfigMessage),

    /// Worker → coordinator: initialised
    Ready(ReadyMessage),

    /// Coordinator → worker: process a chunk
    Process(ProcessMessage),

    /// Coordinator → worker: wait for the next directive
    Park,

    /// Coordinator → worker: finalize and disconnect
    Shutdown(ShutdownMessage),

    /// Worker → coordinator: any other report
    Report(Report),

    /// Either side: the peer cannot continue
    Error(ErrorMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMessage {
    pub protocol_version: u32,
    pub worker_id: usize,
    pub shared: SharedSpecification,
    /// Staged schema text; the worker stages its own copy
    pub schema_json: String,
    pub budget: WorkerBudget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub protocol_version: u32,
    /// Hostname of the worker node
    pub node_id: String,
    pub worker_id: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownMessage {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub node_id: String,
    pub error: String,
}

/// Encode a message with its length prefix
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(msg).context("Failed to serialize message")?;
    let len = u32::try_from(body.len()).context("Message does not fit a u32 length")?;

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode one framed message, returning it with the bytes consumed
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + len]).context("Failed to deserialize message")?;
    Ok((msg, 4 + len))
}

pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!("Message too large: {} bytes (max {})", len, MAX_MESSAGE_BYTES);
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .context("Failed to read message body")?;

    rmp_serde::from_slice(&body).context("Failed to deserialize message")
}

pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;
    stream.write_all(&framed).await.context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, TableRange};
    use crate::worker::ChunkResult;

    fn chunk() -> Chunk {
        Chunk {
            id: ChunkId::root(2).child(1),
            ranges: vec![
                TableRange { begin: 100, end: 900, previous_record_index: 7, records: 20 },
                TableRange { begin: 40, end: 4000, previous_record_index: 31, records: 95 },
            ],
            previous_root_key: Some(vec!["k0000000007".to_string()]),
            last_root_key: Some(vec!["k0000000027".to_string()]),
        }
    }

    #[test]
    fn test_serialize_deserialize_process() {
        let msg = Message::Process(ProcessMessage { chunk: chunk() });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, consumed) = deserialize_message(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());

        match deserialized {
            Message::Process(process) => assert_eq!(process.chunk, chunk()),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_serialize_deserialize_report() {
        let report = Report::ChunkDone(ChunkResult {
            chunk: ChunkId::root(4),
            records: vec![10, 30],
            bytes: 2048,
            unmatched: 1,
            duplicates: 0,
            payload: vec![1, 2, 3],
            elapsed_us: 1500,
        });
        let bytes = serialize_message(&Message::Report(report.clone())).unwrap();
        let (deserialized, _) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Report(r) => assert_eq!(r, report),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_serialize_deserialize_park() {
        let bytes = serialize_message(&Message::Park).unwrap();
        let (deserialized, consumed) = deserialize_message(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(matches!(deserialized, Message::Park));
    }

    #[test]
    fn test_serialize_deserialize_error() {
        let msg = Message::Error(ErrorMessage {
            node_id: "node-a".to_string(),
            error: "Test error".to_string(),
        });
        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Error(err) => {
                assert_eq!(err.node_id, "node-a");
                assert_eq!(err.error, "Test error");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_incomplete_message() {
        let bytes = serialize_message(&Message::Shutdown(ShutdownMessage { ok: true })).unwrap();
        assert!(deserialize_message(&bytes[..2]).is_err());
        assert!(deserialize_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_message_framing() {
        let bytes = serialize_message(&Message::Park).unwrap();
        assert!(bytes.len() >= 4);
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + len);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_message(&mut client, &Message::Process(ProcessMessage { chunk: chunk() }))
            .await
            .unwrap();
        write_message(&mut client, &Message::Park).await.unwrap();

        assert!(matches!(read_message(&mut server).await.unwrap(), Message::Process(_)));
        assert!(matches!(read_message(&mut server).await.unwrap(), Message::Park));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        use tokio::io::AsyncWriteExt;
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_MESSAGE_BYTES as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(read_message(&mut server).await.is_err());
    }
}
