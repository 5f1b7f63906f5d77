//! DExtra gateway: a D-Star reflector endpoint bridged to a local modem link
//!
//! Repeaters bind to the reflector over UDP and stream DSVT frames. Slow and
//! fast data carried in those frames is reassembled per call and handed to a
//! modem over TCP or a Unix-domain socket. Calls can also be originated
//! towards a bound repeater, paced at the D-Star frame rate.
pub mod core;
pub mod network;
pub mod protocol;
mod util;

// Re-export commonly used items
pub use core::{Config, Error, Result};
pub use network::{GatewayEvent, ReflectorServer, ServerHandle};
pub use protocol::{CallPayload, OutboundCall, PayloadMode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
