//! Binary wire codec
//!
//! Every streaming message uses the same little-endian layout:
//!
//! ```text
//! [0..8)        message id (u64)
//! [8..10)       reserved
//! [10]          reference id length N (u8)
//! [11..11+N)    reference id (ASCII)
//! [11+N]        payload format (0 = JSON)
//! [12+N..16+N)  payload length M (u32)
//! [16+N..16+N+M) payload
//! ```
//!
//! A single socket frame may carry several messages back to back.

use crate::errors::{Result, StreamError};
use serde_json::Value;

/// Payload format byte for JSON payloads
pub const PAYLOAD_FORMAT_JSON: u8 = 0;

const MESSAGE_ID_LEN: usize = 8;
const RESERVED_LEN: usize = 2;
const REF_LEN_OFFSET: usize = MESSAGE_ID_LEN + RESERVED_LEN;
const REF_ID_OFFSET: usize = REF_LEN_OFFSET + 1;

/// One decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub message_id: u64,
    pub reference_id: String,
    pub payload_format: u8,
    pub payload: Vec<u8>,
}

/// Control message classes, matched by exact reference id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Heartbeat,
    Disconnect,
    ResetSubscriptions,
}

impl ControlKind {
    pub fn from_reference_id(reference_id: &str) -> Option<Self> {
        match reference_id {
            "_heartbeat" => Some(ControlKind::Heartbeat),
            "_disconnect" => Some(ControlKind::Disconnect),
            "_resetsubscriptions" => Some(ControlKind::ResetSubscriptions),
            _ => None,
        }
    }

    pub fn reference_id(&self) -> &'static str {
        match self {
            ControlKind::Heartbeat => "_heartbeat",
            ControlKind::Disconnect => "_disconnect",
            ControlKind::ResetSubscriptions => "_resetsubscriptions",
        }
    }
}

impl ParsedMessage {
    pub fn new(
        message_id: u64,
        reference_id: impl Into<String>,
        payload_format: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id,
            reference_id: reference_id.into(),
            payload_format,
            payload,
        }
    }

    /// JSON message convenience constructor
    pub fn json(message_id: u64, reference_id: impl Into<String>, payload: &Value) -> Self {
        Self::new(
            message_id,
            reference_id,
            PAYLOAD_FORMAT_JSON,
            payload.to_string().into_bytes(),
        )
    }

    pub fn control_kind(&self) -> Option<ControlKind> {
        ControlKind::from_reference_id(&self.reference_id)
    }

    pub fn is_control(&self) -> bool {
        self.control_kind().is_some()
    }

    /// Parse the payload as JSON. An empty payload reads as `null`.
    pub fn json_payload(&self) -> Result<Value> {
        if self.payload_format != PAYLOAD_FORMAT_JSON {
            return Err(StreamError::UnsupportedPayloadFormat(self.payload_format));
        }
        if self.payload.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

fn require(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(StreamError::FrameTooShort {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode the first message in `data`, returning it with its encoded length
pub fn decode_one(data: &[u8]) -> Result<(ParsedMessage, usize)> {
    require(data, REF_ID_OFFSET)?;

    let mut id_bytes = [0u8; MESSAGE_ID_LEN];
    id_bytes.copy_from_slice(&data[..MESSAGE_ID_LEN]);
    let message_id = u64::from_le_bytes(id_bytes);

    let ref_len = data[REF_LEN_OFFSET] as usize;
    let format_offset = REF_ID_OFFSET + ref_len;
    require(data, format_offset + 1)?;

    let ref_bytes = &data[REF_ID_OFFSET..format_offset];
    if !ref_bytes.is_ascii() {
        return Err(StreamError::InvalidMessage(
            "reference id is not valid ASCII".to_string(),
        ));
    }
    let reference_id = String::from_utf8_lossy(ref_bytes).into_owned();
    let payload_format = data[format_offset];

    let size_offset = format_offset + 1;
    require(data, size_offset + 4)?;
    let payload_len = u32::from_le_bytes([
        data[size_offset],
        data[size_offset + 1],
        data[size_offset + 2],
        data[size_offset + 3],
    ]) as usize;

    let payload_offset = size_offset + 4;
    let end = payload_offset + payload_len;
    require(data, end)?;

    Ok((
        ParsedMessage {
            message_id,
            reference_id,
            payload_format,
            payload: data[payload_offset..end].to_vec(),
        },
        end,
    ))
}

/// Decode exactly one message from the front of `data`
pub fn decode(data: &[u8]) -> Result<ParsedMessage> {
    decode_one(data).map(|(message, _)| message)
}

/// Iterate over every message in a frame.
///
/// Iteration stops after the first error; messages before it are still
/// yielded.
pub fn decode_all(data: &[u8]) -> Messages<'_> {
    Messages {
        remaining: data,
        failed: false,
    }
}

/// Iterator returned by [`decode_all`]
pub struct Messages<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl Iterator for Messages<'_> {
    type Item = Result<ParsedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        match decode_one(self.remaining) {
            Ok((message, consumed)) => {
                self.remaining = &self.remaining[consumed..];
                Some(Ok(message))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Encode a message into its wire form
pub fn encode(message: &ParsedMessage) -> Result<Vec<u8>> {
    if !message.reference_id.is_ascii() {
        return Err(StreamError::InvalidMessage(format!(
            "reference id {:?} is not ASCII",
            message.reference_id
        )));
    }
    let ref_len = u8::try_from(message.reference_id.len()).map_err(|_| {
        StreamError::InvalidMessage(format!(
            "reference id of {} bytes does not fit the length byte",
            message.reference_id.len()
        ))
    })?;
    let payload_len = u32::try_from(message.payload.len()).map_err(|_| {
        StreamError::InvalidMessage("payload exceeds u32 length".to_string())
    })?;

    let mut buf = Vec::with_capacity(REF_ID_OFFSET + ref_len as usize + 5 + message.payload.len());
    buf.extend_from_slice(&message.message_id.to_le_bytes());
    buf.extend_from_slice(&[0u8; RESERVED_LEN]);
    buf.push(ref_len);
    buf.extend_from_slice(message.reference_id.as_bytes());
    buf.push(message.payload_format);
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&message.payload);
    Ok(buf)
}
