//! Core types and traits for the DExtra gateway
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    Callsign,
    Config,
    LinkEndpoint,
    PeerKey,
};

/// Default UDP port of a DExtra reflector
pub const DEFAULT_PORT: u16 = 30001;

/// Default address of the modem link in TCP mode
pub const DEFAULT_LINK_ADDR: &str = "::ffff:127.0.0.1";

/// Default port of the modem link in TCP mode
pub const DEFAULT_LINK_PORT: u16 = 8100;

/// Default socket path of the modem link in Unix mode
pub const DEFAULT_LINK_SOCKET: &str = "/run/vpsed/vpsed.sock";
