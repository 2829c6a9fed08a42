pub mod codec;
pub mod frame;
pub mod login;
pub mod packet;
pub mod session;
pub mod status;

use std::{fmt, io};

use thiserror::Error;

use self::codec::CodecError;

/// `host:port` of a server. Identifies it uniquely together with the
/// protocol version spoken to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection state of a session. Transitions only move forward: a session
/// starts in Handshake and never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Handshake,
    Status,
    Login,
    Configuration,
    Play,
}

/// Transport-level failures, kept distinct because callers classify a host
/// as OFFLINE vs UNKNOWN differently depending on which occurred.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("connection reset")]
    Reset,
    #[error("could not resolve {0}")]
    Dns(String),
    #[error("connection closed mid-read with {missing} bytes remaining")]
    Closed { missing: usize },
    #[error("io: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            io::ErrorKind::ConnectionRefused => TransportError::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                TransportError::Reset
            }
            io::ErrorKind::UnexpectedEof => TransportError::Closed { missing: 0 },
            _ => TransportError::Io(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unexpected packet id {id:#04x} for {state:?} state")]
    UnexpectedPacket { state: ProtocolState, id: i32 },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("decompressed to {actual} bytes but frame declared {declared}")]
    DecompressedLengthMismatch { declared: i32, actual: usize },
    #[error("failed to decompress frame: {0}")]
    Decompress(#[source] io::Error),
    #[error("failed to compress frame: {0}")]
    Compress(#[source] io::Error),
}
