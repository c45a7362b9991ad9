//! Message envelopes carried inside frames.
//!
//! The frame name selects the envelope. Reserved names belong to the
//! protocol; every other name is an application post whose payload goes to
//! the application codec untouched.
//!
//! ```text
//! RequestMsg : seq (BE32) | enqueued unix ms (BE64) | timeout ms (BE32) | inner payload
//! ResponseMsg: seq (BE32) | code (1) | ok: inner payload / failed: UTF-8 reason / timeout: -
//! PingMsg    : value (BE64)
//! PongMsg    : value + 1 (BE64)
//! PubkeyMsg  : base64(public key)
//!
//! inner payload: NameLen (1) | Name | Body
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};

use super::frame::{Frame, FrameCodec, validate_name};
use crate::core::{
    FrameError, NAME_PING, NAME_PONG, NAME_PUBKEY, NAME_REQUEST, NAME_RESPONSE, Payload,
    RESERVED_NAMES,
};
use crate::crypto::PublicKey;

/// Result code carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// The request was served.
    Ok = 0,
    /// The peer gave up because the request deadline passed.
    Timeout = 1,
    /// The peer failed to serve the request.
    Failed = 2,
}

impl ResponseCode {
    /// Parse a code byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Ok),
            1 => Some(Self::Timeout),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outcome of a request as reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    /// Served, with a result value.
    Ok(T),
    /// The peer saw the deadline pass.
    Timeout,
    /// The peer failed with a reason.
    Failed(String),
}

impl<T> Reply<T> {
    /// Wire code for this outcome.
    pub fn code(&self) -> ResponseCode {
        match self {
            Reply::Ok(_) => ResponseCode::Ok,
            Reply::Timeout => ResponseCode::Timeout,
            Reply::Failed(_) => ResponseCode::Failed,
        }
    }
}

/// Request metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Sequence id (never 0).
    pub seq: u32,
    /// Wall clock enqueue time, milliseconds since the Unix epoch.
    pub enqueued_ms: u64,
    /// Caller timeout in milliseconds.
    pub timeout_ms: u32,
}

impl RequestHeader {
    /// Build a header stamped with the current time.
    pub fn new(seq: u32, timeout: Duration) -> Self {
        Self {
            seq,
            enqueued_ms: unix_millis(),
            timeout_ms: timeout.as_millis().min(u32::MAX as u128) as u32,
        }
    }

    /// Whether the caller's deadline has passed at `now_ms`.
    pub fn expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.enqueued_ms.saturating_add(self.timeout_ms as u64)
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Key exchange.
    Pubkey(PublicKey),
    /// Keepalive probe.
    Ping(u64),
    /// Keepalive answer.
    Pong(u64),
    /// Request expecting a correlated response.
    Request {
        /// Request metadata.
        header: RequestHeader,
        /// Application payload.
        payload: Payload,
    },
    /// Response to an earlier request.
    Response {
        /// Sequence id of the request.
        seq: u32,
        /// Outcome.
        reply: Reply<Payload>,
    },
    /// Fire-and-forget application message.
    Post(Payload),
}

fn check_app_name(name: &str) -> Result<(), FrameError> {
    validate_name(name)?;
    if RESERVED_NAMES.contains(&name) {
        return Err(FrameError::ReservedName(name.to_string()));
    }
    Ok(())
}

fn put_inner(buf: &mut Vec<u8>, payload: &Payload) -> Result<(), FrameError> {
    check_app_name(&payload.name)?;
    buf.push(payload.name.len() as u8);
    buf.extend_from_slice(payload.name.as_bytes());
    buf.extend_from_slice(&payload.body);
    Ok(())
}

fn get_inner(mut buf: Bytes) -> Result<Payload, FrameError> {
    if buf.is_empty() {
        return Err(FrameError::Truncated("inner name length"));
    }
    let len = buf.get_u8() as usize;
    if buf.len() < len {
        return Err(FrameError::Truncated("inner name"));
    }
    let name_bytes = buf.split_to(len);
    let name = std::str::from_utf8(&name_bytes)
        .ok()
        .filter(|name| name.is_ascii())
        .ok_or_else(|| FrameError::InvalidName(String::from_utf8_lossy(&name_bytes).into()))?;
    Ok(Payload::new(name, buf))
}

fn get_u64(buf: &mut Bytes, field: &'static str) -> Result<u64, FrameError> {
    if buf.len() < 8 {
        return Err(FrameError::Truncated(field));
    }
    Ok(buf.get_u64())
}

fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::Truncated(field));
    }
    Ok(buf.get_u32())
}

impl WireMessage {
    /// Frame name for this envelope.
    pub fn name(&self) -> &str {
        match self {
            WireMessage::Pubkey(_) => NAME_PUBKEY,
            WireMessage::Ping(_) => NAME_PING,
            WireMessage::Pong(_) => NAME_PONG,
            WireMessage::Request { .. } => NAME_REQUEST,
            WireMessage::Response { .. } => NAME_RESPONSE,
            WireMessage::Post(payload) => &payload.name,
        }
    }

    /// Serialize the envelope payload (everything after the frame name).
    pub fn encode_payload(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        match self {
            WireMessage::Pubkey(key) => buf.extend_from_slice(key.to_base64().as_bytes()),
            WireMessage::Ping(value) | WireMessage::Pong(value) => {
                buf.extend_from_slice(&value.to_be_bytes())
            }
            WireMessage::Request { header, payload } => {
                buf.reserve(17 + payload.name.len() + payload.body.len());
                buf.extend_from_slice(&header.seq.to_be_bytes());
                buf.extend_from_slice(&header.enqueued_ms.to_be_bytes());
                buf.extend_from_slice(&header.timeout_ms.to_be_bytes());
                put_inner(&mut buf, payload)?;
            }
            WireMessage::Response { seq, reply } => {
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.push(reply.code() as u8);
                match reply {
                    Reply::Ok(payload) => put_inner(&mut buf, payload)?,
                    Reply::Timeout => {}
                    Reply::Failed(reason) => buf.extend_from_slice(reason.as_bytes()),
                }
            }
            WireMessage::Post(payload) => {
                check_app_name(&payload.name)?;
                buf.extend_from_slice(&payload.body);
            }
        }
        Ok(buf)
    }

    /// Encode the envelope as a complete frame.
    pub fn to_frame(&self, codec: &FrameCodec) -> Result<Vec<u8>, FrameError> {
        codec.encode(self.name(), &self.encode_payload()?)
    }

    /// Parse a decoded frame.
    pub fn decode(frame: Frame) -> Result<Self, FrameError> {
        let Frame { name, mut payload } = frame;
        let message = match name.as_str() {
            NAME_PUBKEY => WireMessage::Pubkey(PublicKey::from_base64(&payload)?),
            NAME_PING => WireMessage::Ping(get_u64(&mut payload, "ping value")?),
            NAME_PONG => WireMessage::Pong(get_u64(&mut payload, "pong value")?),
            NAME_REQUEST => {
                let seq = get_u32(&mut payload, "request seq")?;
                let enqueued_ms = get_u64(&mut payload, "request enqueue time")?;
                let timeout_ms = get_u32(&mut payload, "request timeout")?;
                WireMessage::Request {
                    header: RequestHeader {
                        seq,
                        enqueued_ms,
                        timeout_ms,
                    },
                    payload: get_inner(payload)?,
                }
            }
            NAME_RESPONSE => {
                let seq = get_u32(&mut payload, "response seq")?;
                if payload.is_empty() {
                    return Err(FrameError::Truncated("response code"));
                }
                let byte = payload.get_u8();
                let reply = match ResponseCode::from_byte(byte) {
                    Some(ResponseCode::Ok) => Reply::Ok(get_inner(payload)?),
                    Some(ResponseCode::Timeout) => Reply::Timeout,
                    Some(ResponseCode::Failed) => {
                        Reply::Failed(String::from_utf8_lossy(&payload).into_owned())
                    }
                    None => return Err(FrameError::UnknownCode(byte)),
                };
                WireMessage::Response { seq, reply }
            }
            _ => WireMessage::Post(Payload::new(name, payload)),
        };
        Ok(message)
    }
}
