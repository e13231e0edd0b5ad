//! Error types and close reasons

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol engine error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Protocol violation (invalid opcode, malformed header, bad sequencing)
    Protocol(&'static str),
    /// A frame or reassembled message exceeded the configured size ceiling
    FrameTooBig,
    /// A data frame was enqueued after a close frame was already sent
    OutboundClosed,
    /// The peer failed to answer a keepalive ping within the deadline
    PingTimeout,
    /// The connection is closed, with the peer's close reason when known
    ConnectionClosed(Option<CloseReason>),
    /// An internal queue was closed before the operation completed
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::FrameTooBig => write!(f, "frame exceeds maximum size"),
            Error::OutboundClosed => write!(f, "outbound already closed"),
            Error::PingTimeout => write!(f, "ping timeout"),
            Error::ConnectionClosed(reason) => {
                if let Some(r) = reason {
                    write!(f, "connection closed: {} ({})", r.code, r.message)
                } else {
                    write!(f, "connection closed")
                }
            }
            Error::ChannelClosed => write!(f, "session channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => {
                Error::ConnectionClosed(None)
            }
            _ => Error::Io(e),
        }
    }
}

/// Close frame reason: a 16-bit status code plus a UTF-8 message
///
/// Well-known codes are exposed as associated constants; unknown codes are
/// preserved numerically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Human-readable reason, possibly empty
    pub message: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (e.g. server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Received a data type it cannot accept
    pub const CANNOT_ACCEPT: u16 = 1003;
    /// Data inconsistent with the message type
    pub const NOT_CONSISTENT: u16 = 1007;
    /// Message violated endpoint policy
    pub const VIOLATED_POLICY: u16 = 1008;
    /// Message too big to process
    pub const TOO_BIG: u16 = 1009;
    /// Expected an extension the server did not negotiate
    pub const NO_EXTENSION: u16 = 1010;
    /// Unexpected condition prevented the request
    pub const UNEXPECTED_CONDITION: u16 = 1011;
    /// Service is restarting
    pub const SERVICE_RESTART: u16 = 1012;
    /// Overload, try again later
    pub const TRY_AGAIN_LATER: u16 = 1013;

    /// Create a new close reason
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Normal closure with an empty message
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    /// Symbolic name for a well-known code, if registered
    pub fn name(&self) -> Option<&'static str> {
        match self.code {
            Self::NORMAL => Some("NORMAL"),
            Self::GOING_AWAY => Some("GOING_AWAY"),
            Self::PROTOCOL_ERROR => Some("PROTOCOL_ERROR"),
            Self::CANNOT_ACCEPT => Some("CANNOT_ACCEPT"),
            Self::NOT_CONSISTENT => Some("NOT_CONSISTENT"),
            Self::VIOLATED_POLICY => Some("VIOLATED_POLICY"),
            Self::TOO_BIG => Some("TOO_BIG"),
            Self::NO_EXTENSION => Some("NO_EXTENSION"),
            Self::UNEXPECTED_CONDITION => Some("UNEXPECTED_CONDITION"),
            Self::SERVICE_RESTART => Some("SERVICE_RESTART"),
            Self::TRY_AGAIN_LATER => Some("TRY_AGAIN_LATER"),
            _ => None,
        }
    }

    /// Encode as a close frame payload: big-endian code followed by the
    /// UTF-8 message
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.message.len());
        buf.put_u16(self.code);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    /// Decode a close frame payload
    ///
    /// An empty payload means the peer gave no reason. A one-byte payload
    /// is malformed per RFC 6455.
    pub fn from_payload(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("close payload of one byte")),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let message = String::from_utf8_lossy(&payload[2..]).into_owned();
                Ok(Some(Self::new(code, message)))
            }
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.code, name),
            None => write!(f, "{}", self.code),
        }?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}
