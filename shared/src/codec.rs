//! Newline-delimited JSON codec for TCP framing
//!
//! All messages are framed as:
//! ```text
//! [ N bytes: UTF-8 JSON envelope ][ '\n' ]
//! ```
//!
//! A frame that fails to decode is reported and skipped; it never affects
//! the frames around it.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{Envelope, Message, MessageType, PacketType};

/// Maximum frame size (64 KiB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CodecError {
    fn missing(field: &str) -> Self {
        CodecError::Malformed(format!("missing required field `{field}`"))
    }
}

/// Envelope as it appears on the wire, before validation
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    packet_type: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    content: Value,
}

#[derive(Serialize)]
struct WireEnvelopeOut<'a> {
    packet_type: &'a str,
    message_type: &'a str,
    sender_id: &'a str,
    timestamp: u64,
    content: Value,
}

/// Render an envelope in its wire shape (used for frames and packet logs)
pub fn to_value(envelope: &Envelope) -> Result<Value, CodecError> {
    let out = WireEnvelopeOut {
        packet_type: envelope.packet_type.as_str(),
        message_type: envelope.message_type().as_str(),
        sender_id: &envelope.sender_id,
        timestamp: envelope.timestamp_ms,
        content: envelope.message.content()?,
    };
    Ok(serde_json::to_value(out)?)
}

/// Encode an envelope into a newline-terminated frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope directly into a provided buffer
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), CodecError> {
    let json = serde_json::to_vec(&to_value(envelope)?)?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(json.len()));
    }

    buf.reserve(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(b'\n');
    Ok(())
}

/// Decode a single frame (without its trailing newline)
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    let wire: WireEnvelope = serde_json::from_slice(frame)
        .map_err(|e| CodecError::Malformed(format!("invalid JSON envelope: {e}")))?;

    let packet_type: PacketType = wire
        .packet_type
        .ok_or_else(|| CodecError::missing("packet_type"))?
        .parse()
        .map_err(CodecError::Malformed)?;

    let message_type: MessageType = wire
        .message_type
        .ok_or_else(|| CodecError::missing("message_type"))?
        .parse()
        .map_err(CodecError::Malformed)?;

    let sender_id = wire
        .sender_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodecError::missing("sender_id"))?;

    // Absent content is treated as an empty object so all-optional payloads decode
    let content = match wire.content {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };

    let message = match (packet_type, message_type) {
        (PacketType::Discovery, MessageType::Request) => Message::Discovery(payload(content)?),
        (PacketType::Message, MessageType::Request) => Message::Directive(payload(content)?),
        (_, MessageType::Ack) => Message::Ack(payload(content)?),
        (_, MessageType::Status) => Message::Status(payload(content)?),
        (_, MessageType::IssueReport) => Message::IssueReport(payload(content)?),
        (_, MessageType::MovementCommand) => Message::MovementCommand(payload(content)?),
        (_, MessageType::TaskCompleted) => Message::TaskCompleted(payload(content)?),
        (_, MessageType::Heartbeat) => Message::Heartbeat(payload(content)?),
    };

    message.validate().map_err(CodecError::Malformed)?;

    Ok(Envelope {
        packet_type,
        sender_id,
        timestamp_ms: wire.timestamp.filter(|t| t.is_finite() && *t > 0.0).unwrap_or(0.0) as u64,
        message,
    })
}

fn payload<T: for<'de> Deserialize<'de>>(content: Value) -> Result<T, CodecError> {
    serde_json::from_value(content)
        .map_err(|e| CodecError::Malformed(format!("invalid content: {e}")))
}

/// Streaming decoder that splits a byte stream into frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
    /// Set while skipping the tail of an oversized frame
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            discarding: false,
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Returns `None` when more data is needed. A malformed frame yields
    /// `Some(Err(..))` and is consumed, so callers can keep draining.
    pub fn decode_next(&mut self) -> Option<Result<Envelope, CodecError>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                if self.buffer.len() > MAX_FRAME_SIZE {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    if self.discarding {
                        return None;
                    }
                    self.discarding = true;
                    return Some(Err(CodecError::FrameTooLarge(len)));
                }
                return None;
            };

            let line = self.buffer.split_to(pos + 1);

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let frame = trim_ascii(&line[..pos]);
            if frame.is_empty() {
                continue;
            }
            if frame.len() > MAX_FRAME_SIZE {
                return Some(Err(CodecError::FrameTooLarge(frame.len())));
            }

            return Some(decode(frame));
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
