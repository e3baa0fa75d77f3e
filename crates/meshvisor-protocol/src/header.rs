//! Fixed-size message header.

use std::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Largest number of descriptors a single frame may carry.
pub const MAX_HANDLES: usize = 8;

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Client -> server: optional private key, namespace descriptor attached.
    InitRequest = 1,
    /// Server -> client: the daemon for this session is up.
    InitResponse = 2,
    /// Client -> server liveness ping. No payload, no handles.
    Heartbeat = 3,
    /// Server -> daemon: tunnel descriptor attached.
    HandleHandoff = 4,
}

impl MessageKind {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> ProtocolResult<Self> {
        match value {
            1 => Ok(Self::InitRequest),
            2 => Ok(Self::InitResponse),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::HandleHandoff),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitRequest => write!(f, "init-request"),
            Self::InitResponse => write!(f, "init-response"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::HandleHandoff => write!(f, "handle-handoff"),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub sequence: u32,
    /// Payload length in bytes; always equal to the payload that follows.
    pub length: u32,
    /// Number of descriptors attached to the frame.
    pub handles: u32,
}

impl Header {
    /// Build the header describing `payload` with `handles` descriptors.
    ///
    /// Length and handle count are derived from the actual data, so a header
    /// built here can never disagree with what is sent after it.
    pub fn describe(
        kind: MessageKind,
        sequence: u32,
        payload: &[u8],
        handles: usize,
    ) -> ProtocolResult<Self> {
        check_limits(payload.len(), handles)?;
        Ok(Self {
            kind,
            sequence,
            length: payload.len() as u32,
            handles: handles as u32,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.kind.as_u32().to_le_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.handles.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> ProtocolResult<Self> {
        let field = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let kind = MessageKind::try_from(field(0))?;
        let header = Self {
            kind,
            sequence: field(4),
            length: field(8),
            handles: field(12),
        };
        check_limits(header.length as usize, header.handles as usize)?;
        Ok(header)
    }
}

fn check_limits(length: usize, handles: usize) -> ProtocolResult<()> {
    if length > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            length,
            max: MAX_PAYLOAD,
        });
    }
    if handles > MAX_HANDLES {
        return Err(ProtocolError::TooManyHandles {
            count: handles,
            max: MAX_HANDLES,
        });
    }
    Ok(())
}
