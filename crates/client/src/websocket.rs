//! Monoio-native WebSocket client
//!
//! RFC 6455 client built on [`MaybeTlsStream`]:
//! - handshake with extra request headers (bearer token)
//! - masked client frames, unmasked server frames
//! - fragment reassembly, automatic pong, close handshake
//!
//! Only whole messages leave [`MonoioWebSocket::receive_message`]; every
//! returned payload is an owned copy, independent of the read buffer.

use crate::errors::{CLOSE_ABNORMAL, Result, StreamError};
use crate::transport::{MaybeTlsStream, default_tls_config};
use streamwire_core::{PerfTimer, nanos};

use base64::Engine;
use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;
const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

static MASK_COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// WebSocket opcode constants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xa => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A single WebSocket frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Client-side frame: masked, final
    pub fn masked(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: Some(generate_mask()),
            payload,
        }
    }

    /// Server-side frame: unmasked, final
    pub fn unmasked(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload,
        }
    }

    /// Close frame payload: big-endian status code followed by the reason
    pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload
    }

    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.payload.len() as u64;
        let mut frame = Vec::with_capacity(self.payload.len() + 14);

        frame.push(if self.fin { 0x80 } else { 0x00 } | (self.opcode as u8));

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            frame.push(mask_bit | len as u8);
        } else if len < 65536 {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(mask_bit | 127);
            frame.extend_from_slice(&len.to_be_bytes());
        }

        match self.mask {
            Some(mask) => {
                frame.extend_from_slice(&mask);
                frame.extend(
                    self.payload
                        .iter()
                        .enumerate()
                        .map(|(i, byte)| byte ^ mask[i % 4]),
                );
            }
            None => frame.extend_from_slice(&self.payload),
        }

        frame
    }

    /// Parse one frame from the front of `data`.
    ///
    /// `Ok(None)` means more bytes are needed; on success the frame and the
    /// number of bytes it occupied are returned.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 2 {
            return Ok(None);
        }

        let fin = data[0] & 0x80 != 0;
        let opcode = OpCode::from_u8(data[0] & 0x0f).ok_or_else(|| {
            StreamError::InvalidResponse(format!("Invalid WebSocket opcode {:#x}", data[0] & 0x0f))
        })?;
        let masked = data[1] & 0x80 != 0;

        let mut offset = 2;
        let payload_len = match data[1] & 0x7f {
            126 => {
                if data.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[2], data[3]]) as u64;
                offset += 2;
                len
            }
            127 => {
                if data.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                offset += 8;
                u64::from_be_bytes(raw)
            }
            short => short as u64,
        };

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(StreamError::InvalidResponse(format!(
                "WebSocket frame of {payload_len} bytes exceeds limit"
            )));
        }

        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mask = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        let end = offset + payload_len as usize;
        if data.len() < end {
            return Ok(None);
        }

        let mut payload = data[offset..end].to_vec();
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(Some((
            Frame {
                fin,
                opcode,
                mask,
                payload,
            },
            end,
        )))
    }
}

fn generate_mask() -> [u8; 4] {
    let mixed = nanos() ^ MASK_COUNTER.fetch_add(0x9E37_79B9, Ordering::Relaxed);
    let folded = (mixed ^ (mixed >> 32)) as u32;
    folded.to_le_bytes()
}

/// `Sec-WebSocket-Accept` value for a handshake key
pub fn accept_key(ws_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ws_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// A complete message received from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Binary(Vec<u8>),
    Text(String),
    Close { code: u16, reason: String },
}

/// Monoio-native WebSocket client
pub struct MonoioWebSocket {
    stream: MaybeTlsStream,
    url: Url,
    connected: bool,
    close_sent: bool,
    buffer: Vec<u8>,
    fragments: Option<(OpCode, Vec<u8>)>,
}

impl MonoioWebSocket {
    /// Open a connection, sending `headers` with the upgrade request
    pub async fn connect_with_headers(url: Url, headers: &[(&str, &str)]) -> Result<Self> {
        let timer = PerfTimer::start("websocket_connect");
        info!("🔗 Connecting to WebSocket: {}", redact_query(&url));

        let stream = MaybeTlsStream::connect(&url, &default_tls_config()).await?;
        let mut websocket = Self {
            stream,
            url,
            connected: false,
            close_sent: false,
            buffer: Vec::with_capacity(16 * 1024),
            fragments: None,
        };
        websocket.perform_handshake(headers).await?;

        timer.log_elapsed();
        info!("✅ WebSocket connection established");
        Ok(websocket)
    }

    async fn perform_handshake(&mut self, headers: &[(&str, &str)]) -> Result<()> {
        let ws_key = base64::engine::general_purpose::STANDARD.encode(generate_key_bytes());

        let host = self
            .url
            .host_str()
            .ok_or_else(|| StreamError::InvalidUrl("No host in WebSocket URL".to_string()))?;
        let host_header = match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = if self.url.path().is_empty() { "/" } else { self.url.path() };
        let query = self.url.query().map(|q| format!("?{q}")).unwrap_or_default();

        let mut request = format!(
            "GET {path}{query} HTTP/1.1\r\n\
             Host: {host_header}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {ws_key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        for (key, value) in headers {
            request.push_str(&format!("{key}: {value}\r\n"));
        }
        request.push_str("\r\n");

        self.stream.write_all(request.as_bytes()).await?;

        let mut chunk = vec![0u8; 4096];
        let header_end = loop {
            if let Some(pos) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            if self.buffer.len() > MAX_HANDSHAKE_BYTES {
                return Err(StreamError::HandshakeFailed("Handshake response too large".to_string()));
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(StreamError::HandshakeFailed(
                    "Connection closed during handshake".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        };

        let response = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
        // Frames may already follow the 101 response.
        self.buffer.drain(..header_end + 4);

        validate_handshake_response(&response, &ws_key)?;
        self.connected = true;
        debug!("WebSocket handshake completed");
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if !self.connected || self.close_sent {
            return Err(StreamError::SocketClosed);
        }
        self.stream.write_all(&frame.to_bytes()).await?;
        if frame.opcode == OpCode::Close {
            self.close_sent = true;
        }
        Ok(())
    }

    /// Receive the next complete message, answering pings along the way
    pub async fn receive_message(&mut self) -> Result<WsMessage> {
        if !self.connected {
            return Err(StreamError::SocketClosed);
        }

        loop {
            if let Some((frame, consumed)) = Frame::parse(&self.buffer)? {
                self.buffer.drain(..consumed);
                if let Some(message) = self.handle_frame(frame).await? {
                    return Ok(message);
                }
                continue;
            }

            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                self.connected = false;
                return Err(StreamError::ConnectionClosed {
                    code: CLOSE_ABNORMAL,
                    reason: "connection closed by peer without close frame".to_string(),
                });
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<WsMessage>> {
        if frame.opcode.is_control() {
            return match frame.opcode {
                OpCode::Ping => {
                    debug!("Received ping, sending pong");
                    self.send_frame(Frame::masked(OpCode::Pong, frame.payload)).await?;
                    Ok(None)
                }
                OpCode::Pong => Ok(None),
                _ => {
                    let (code, reason) = parse_close_payload(&frame.payload);
                    debug!("Received close frame ({})", code);
                    if !self.close_sent {
                        let echo = Frame::masked(OpCode::Close, Frame::close_payload(code, ""));
                        let _ = self.send_frame(echo).await;
                    }
                    self.connected = false;
                    Ok(Some(WsMessage::Close { code, reason }))
                }
            };
        }

        let (opcode, payload) = match (frame.opcode, self.fragments.take()) {
            (OpCode::Continuation, Some((opcode, mut partial))) => {
                partial.extend_from_slice(&frame.payload);
                (opcode, partial)
            }
            (OpCode::Continuation, None) => {
                return Err(StreamError::InvalidResponse(
                    "Continuation frame without a started message".to_string(),
                ));
            }
            (opcode, _) => (opcode, frame.payload),
        };

        if !frame.fin {
            self.fragments = Some((opcode, payload));
            return Ok(None);
        }

        match opcode {
            OpCode::Text => String::from_utf8(payload)
                .map(|text| Some(WsMessage::Text(text)))
                .map_err(|e| StreamError::InvalidResponse(format!("Invalid UTF-8 in text frame: {e}"))),
            _ => Ok(Some(WsMessage::Binary(payload))),
        }
    }

    /// Send a close frame and wait for the peer's reply.
    ///
    /// Callers bound the wait; a socket that is already closed is left alone.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !self.connected || self.close_sent {
            self.connected = false;
            return Ok(());
        }

        info!("🔌 Closing WebSocket connection");
        self.send_frame(Frame::masked(OpCode::Close, Frame::close_payload(code, reason)))
            .await?;

        loop {
            match self.receive_message().await {
                Ok(WsMessage::Close { .. }) => {
                    debug!("Close handshake completed");
                    break;
                }
                Ok(_) => continue,
                Err(_) => {
                    debug!("Connection terminated during close handshake");
                    break;
                }
            }
        }

        self.connected = false;
        Ok(())
    }
}

fn generate_key_bytes() -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&nanos().to_be_bytes());
    key[8..12].copy_from_slice(&generate_mask());
    key[12..].copy_from_slice(&generate_mask());
    key
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        // No status code in the frame means "no status received".
        return (1005, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

fn validate_handshake_response(response: &str, ws_key: &str) -> Result<()> {
    let status_line = response.lines().next().unwrap_or_default();
    if !status_line.starts_with("HTTP/1.1 101") {
        return Err(StreamError::HandshakeFailed(format!(
            "Unexpected handshake status: {status_line}"
        )));
    }

    let expected = accept_key(ws_key);
    let accepted = response.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(key, value)| {
            key.trim().eq_ignore_ascii_case("sec-websocket-accept") && value.trim() == expected
        })
    });

    if !accepted {
        return Err(StreamError::HandshakeFailed("Invalid Sec-WebSocket-Accept".to_string()));
    }
    Ok(())
}

/// URL for logging with the query string removed
fn redact_query(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.to_string()
}
