//! Wire protocol
//!
//! Length-prefixed JSON envelopes over a persistent connection. Every frame
//! is `{ v, id, type, payload }`; unary calls answer with `result`/`error`
//! sharing the request id, subscriptions stream `event` frames. Unknown
//! frame types are ignored and unknown payload fields are preserved, so old
//! servers and new clients can coexist.

use crate::error::{VigilError, VigilResult};
use crate::hub::SubscriberFilter;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;
/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// One wire frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: id.into(),
            kind: kind.into(),
            payload,
        }
    }

    pub fn result(id: &str, payload: serde_json::Value) -> Self {
        Self::new(id, "result", payload)
    }

    pub fn error(id: &str, err: &VigilError) -> Self {
        Self::new(
            id,
            "error",
            serde_json::json!({
                "code": err.code(),
                "category": err.category(),
                "message": err.to_string(),
            }),
        )
    }

    pub fn subscribed(id: &str, subscription_id: u64) -> Self {
        Self::new(
            id,
            "subscribed",
            serde_json::json!({ "subscription_id": subscription_id }),
        )
    }

    pub fn event(id: &str, events: serde_json::Value) -> Self {
        Self::new(id, "event", serde_json::json!({ "events": events }))
    }

    pub fn ping(id: &str) -> Self {
        Self::new(id, "ping", serde_json::Value::Null)
    }

    pub fn pong(id: &str) -> Self {
        Self::new(id, "pong", serde_json::Value::Null)
    }
}

/// Parsed view of a client frame
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Call {
        id: String,
        method: String,
        params: serde_json::Value,
    },
    Subscribe {
        id: String,
        filter: SubscriberFilter,
    },
    Unsubscribe {
        id: String,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
    /// Back-compat: unknown types are ignored, not errors
    Unknown {
        id: String,
        kind: String,
    },
}

impl ClientFrame {
    pub fn from_envelope(envelope: Envelope) -> VigilResult<Self> {
        let Envelope {
            id, kind, payload, ..
        } = envelope;
        match kind.as_str() {
            "call" => {
                let method = payload
                    .get("method")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| VigilError::validation("call frame missing method"))?
                    .to_string();
                let params = payload
                    .get("params")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Ok(Self::Call { id, method, params })
            }
            "subscribe" => {
                let filter = match payload.get("filter") {
                    Some(raw) => serde_json::from_value(raw.clone())?,
                    None => SubscriberFilter::all(),
                };
                Ok(Self::Subscribe { id, filter })
            }
            "unsubscribe" => Ok(Self::Unsubscribe { id }),
            "ping" => Ok(Self::Ping { id }),
            "pong" => Ok(Self::Pong { id }),
            _ => Ok(Self::Unknown { id, kind }),
        }
    }
}

// ============================================================================
// Framing codec: u32 big-endian length prefix + JSON bytes
// ============================================================================

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> VigilResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(VigilError::validation(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .await
        .map_err(io_error)?;
    writer.write_all(&bytes).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)?;
    Ok(())
}

/// Reads one frame; `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> VigilResult<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_error(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(VigilError::validation(format!(
            "incoming frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(io_error)?;
    let envelope = serde_json::from_slice(&body)?;
    Ok(Some(envelope))
}

fn io_error(e: std::io::Error) -> VigilError {
    VigilError::Transport {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let out = Envelope::new(
            "req-1",
            "call",
            serde_json::json!({"method": "get_incident", "params": {"id": "inc-1"}}),
        );
        write_frame(&mut client, &out).await.unwrap();
        let read = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(read.v, PROTOCOL_VERSION);
        assert_eq!(read.id, "req-1");
        assert_eq!(read.kind, "call");
        assert_eq!(read.payload["method"], "get_incident");
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(u32::MAX).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, VigilError::Validation { .. }));
    }

    #[test]
    fn unknown_frame_types_parse_as_unknown() {
        let envelope = Envelope::new("x", "frobnicate", serde_json::json!({}));
        match ClientFrame::from_envelope(envelope).unwrap() {
            ClientFrame::Unknown { kind, .. } => assert_eq!(kind, "frobnicate"),
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn unknown_payload_fields_are_preserved() {
        let raw = serde_json::json!({
            "v": 1,
            "id": "a",
            "type": "call",
            "payload": {"method": "health", "future_field": 42}
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.payload["future_field"], 42);
    }

    #[test]
    fn subscribe_defaults_to_match_all() {
        let envelope = Envelope::new("s", "subscribe", serde_json::json!({}));
        match ClientFrame::from_envelope(envelope).unwrap() {
            ClientFrame::Subscribe { filter, .. } => {
                assert!(filter.incident_ids.is_none());
                assert!(filter.kinds.is_none());
            }
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    #[test]
    fn error_frames_carry_stable_codes() {
        let err = VigilError::NotFound {
            kind: "incident".into(),
            id: "inc-404".into(),
        };
        let frame = Envelope::error("req-9", &err);
        assert_eq!(frame.kind, "error");
        assert_eq!(frame.payload["code"], 101);
        assert_eq!(frame.payload["category"], "not_found");
    }
}
