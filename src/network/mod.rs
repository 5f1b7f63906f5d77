//! Network management and peer communication module
//!
//! This module runs the reflector socket, tracks bound repeaters and their
//! modem links, and paces gateway-originated calls onto the wire.

mod keepalive;
mod link;
mod server;
mod session;
mod table;
mod transmit;

pub use self::keepalive::KeepaliveSupervisor;
pub use self::link::LinkHandle;
pub use self::server::{ErrorBudget, ReflectorServer, ServerHandle, ServerStats};
pub use self::session::{PeerSession, SessionTimers, TickOutcome};
pub use self::table::{PeerTable, SharedPeerTable, SweepReport};
pub use self::transmit::Transmitter;

use bytes::Bytes;

use crate::core::{Callsign, PeerKey};
use crate::protocol::CallPayload;

/// Something the gateway reports to its embedding application
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A repeater bound to the reflector and its link was opened
    PeerBound {
        key: PeerKey,
        callsign: Callsign,
        module: u8,
    },
    /// A repeater unbound explicitly
    PeerUnbound { key: PeerKey },
    /// A repeater went silent for longer than the dead interval
    PeerExpired { key: PeerKey },
    /// A call from a repeater was fully received
    CallCompleted { key: PeerKey, payload: CallPayload },
    /// Bytes arrived from a session's modem link
    LinkData { key: PeerKey, data: Bytes },
}
