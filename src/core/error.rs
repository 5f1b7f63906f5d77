use std::io;
use thiserror::Error;

/// Custom error types for the DExtra gateway
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Datagram length matches no DExtra packet kind
    #[error("Malformed datagram of {0} bytes")]
    Malformed(usize),

    /// Stream packet without the DSVT signature
    #[error("Missing DSVT signature")]
    BadSignature,

    /// Radio header checksum mismatch
    #[error("Radio header checksum mismatch: expected {expected:04x}, computed {computed:04x}")]
    Checksum { expected: u16, computed: u16 },

    /// Data packet belongs to another stream than the active call
    #[error("Stream id mismatch: active {active:?}, received {received:04x}")]
    StreamMismatch { active: Option<u16>, received: u16 },

    /// Trunk header carries the corruption flag
    #[error("Frame flagged as corrupted")]
    Corrupted,

    #[error("Sequence number {0} out of range")]
    SequenceOutOfRange(u8),

    /// Half-duplex gate refuses transmission
    #[error("Channel busy: {0}")]
    Busy(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new peer error
    pub fn peer(msg: impl Into<String>) -> Self {
        Error::Peer(msg.into())
    }

    /// Creates a new link error
    pub fn link(msg: impl Into<String>) -> Self {
        Error::Link(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    /// Whether the error is a per-packet protocol drop rather than a fault
    pub fn is_packet_drop(&self) -> bool {
        matches!(
            self,
            Error::Malformed(_)
                | Error::BadSignature
                | Error::Checksum { .. }
                | Error::StreamMismatch { .. }
                | Error::Corrupted
                | Error::SequenceOutOfRange(_)
        )
    }
}
