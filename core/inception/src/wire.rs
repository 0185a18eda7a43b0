//! Wire format shared by every hop
//!
//! Frames are a 4-byte big-endian length followed by the body. The body of
//! a request frame is opaque to the transport; the body of a response frame
//! is a bincode-encoded [`Reply`]. Tiers that route (admin → VM host) wrap
//! the opaque payload in an [`Envelope`] before framing it.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum frame body size (16 MiB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Length of frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Messages
// ============================================================================

/// Where a payload should be delivered relative to the receiving hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Handled by the receiving node itself
    Local,
    /// Delivered to the VM host with this ID
    VmHost(String),
    /// Delivered to the KVM with this service name
    Kvm(String),
}

/// Routing record wrapped around an opaque payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub route: Route,
    pub payload: Vec<u8>,
}

/// Outcome of a request, as carried in the response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ok(Vec<u8>),
    Err(String),
}

// ============================================================================
// Errors
// ============================================================================

/// Wire encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Need more bytes (value = bytes still needed)
    Incomplete(usize),
    /// Frame body exceeds [`MAX_FRAME_SIZE`]
    TooLarge(usize),
    /// Body could not be (de)serialized
    Invalid(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Incomplete(n) => write!(f, "incomplete frame ({} more bytes needed)", n),
            WireError::TooLarge(n) => write!(f, "frame too large: {} bytes", n),
            WireError::Invalid(msg) => write!(f, "invalid message: {}", msg),
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// Framing
// ============================================================================

/// Prefix `body` with its 4-byte length
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, WireError> {
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(WireError::TooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Decode one frame from the front of `buf`
/// Returns (body, bytes_consumed) or error
pub fn decode_frame(buf: &[u8]) -> Result<(&[u8], usize), WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE as usize {
        return Err(WireError::TooLarge(length));
    }

    let total = HEADER_LEN + length;
    if buf.len() < total {
        return Err(WireError::Incomplete(total - buf.len()));
    }

    Ok((&buf[HEADER_LEN..total], total))
}

/// Write one frame to a blocking stream
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let frame = encode_frame(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one frame from a blocking stream
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            WireError::TooLarge(length),
        ));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Ok(body)
}

// ============================================================================
// Envelope / Reply Encoding
// ============================================================================

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    bincode::serialize(envelope).map_err(|e| WireError::Invalid(e.to_string()))
}

pub fn decode_envelope(buf: &[u8]) -> Result<Envelope, WireError> {
    bincode::deserialize(buf).map_err(|e| WireError::Invalid(e.to_string()))
}

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, WireError> {
    bincode::serialize(reply).map_err(|e| WireError::Invalid(e.to_string()))
}

pub fn decode_reply(buf: &[u8]) -> Result<Reply, WireError> {
    bincode::deserialize(buf).map_err(|e| WireError::Invalid(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
