//! Protocol implementation module
//!
//! This module defines the DExtra datagrams, the DSVT stream layout,
//! S-Frame reassembly and the synthesis of outbound calls.

pub mod builder;
pub mod codec;
pub mod crc;
pub mod frame;
pub mod reassembler;
pub mod scrambler;
pub mod sframe;

pub use self::builder::{FrameBuilder, OutboundCall, PayloadMode, TxPlan};
pub use self::codec::DsvtCodec;
pub use self::frame::{BindRequest, HeaderPacket, Packet, RadioHeader, TrunkHeader, VoicePacket};
pub use self::reassembler::{CallPayload, Reassembler};
