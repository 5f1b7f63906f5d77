//! DExtra datagram layouts
//!
//! Every packet kind is identified by its exact length. Stream packets share
//! an 8-byte prefix (`"DSVT"`, flag byte, three zero bytes) followed by the
//! 7-byte trunk header. All multi-byte fields are encoded at fixed offsets.

use crate::core::{Callsign, Error, Result};
use super::crc::crc_ccitt;

/// Keepalive datagram length
pub const KEEPALIVE_LEN: usize = 9;
/// Bind / unbind request length
pub const BIND_REQUEST_LEN: usize = 11;
/// Bind answer length
pub const BIND_ANSWER_LEN: usize = 14;
/// Stream data packet length
pub const STREAM_PACKET_LEN: usize = 27;
/// Stream header packet length
pub const STREAM_HEADER_LEN: usize = 56;
/// Receive buffer size; anything longer is truncated and rejected
pub const MAX_DATAGRAM_LEN: usize = STREAM_HEADER_LEN + 1;

pub const DSVT_SIGNATURE: &[u8; 4] = b"DSVT";
pub const PREFIX_LEN: usize = 8;
pub const TRUNK_HEADER_LEN: usize = 7;
pub const RADIO_HEADER_LEN: usize = 41;
pub const VOICE_LEN: usize = 9;
pub const DATA_LEN: usize = 3;

/// Prefix flag byte of a header packet
pub const FLAG_HEADER: u8 = 0x10;
/// Prefix flag byte of a voice packet
pub const FLAG_VOICE: u8 = 0x20;

/// Highest valid sequence number within a superframe
pub const MAX_SEQUENCE: u8 = 20;
/// Number of slots in a superframe
pub const SUPERFRAME_SLOTS: usize = MAX_SEQUENCE as usize + 1;

pub const MGMT_SEQUENCE_MASK: u8 = 0x1F;
pub const MGMT_CORRUPTED: u8 = 0x20;
pub const MGMT_KIND_MASK: u8 = 0xC0;
pub const MGMT_LAST_FRAME: u8 = 0x40;
pub const MGMT_HEADER: u8 = 0x80;

/// Bytes appended to a bind request to acknowledge it
pub const BIND_ACK: &[u8; 4] = b"ACK\0";

/// Per-frame control header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkHeader {
    /// 2-bit frame type
    pub kind: u8,
    /// 6 reserved bits
    pub reserved: u8,
    pub dst_repeater: u8,
    pub src_repeater: u8,
    pub src_terminal: u8,
    /// Stream (call) id, big-endian on the wire
    pub call_id: u16,
    /// Sequence, corruption and frame-kind bits
    pub mgmt: u8,
}

impl TrunkHeader {
    /// Trunk header of a gateway-originated stream frame
    pub fn stream(call_id: u16, mgmt: u8) -> Self {
        TrunkHeader {
            kind: 0,
            reserved: 0x08,
            dst_repeater: 0x00,
            src_repeater: 0x01,
            src_terminal: 0x02,
            call_id,
            mgmt,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TRUNK_HEADER_LEN {
            return Err(Error::protocol(format!("Trunk header needs 7 bytes, got {}", buf.len())));
        }
        Ok(TrunkHeader {
            kind: buf[0] & 0x03,
            reserved: buf[0] >> 2,
            dst_repeater: buf[1],
            src_repeater: buf[2],
            src_terminal: buf[3],
            call_id: u16::from_be_bytes([buf[4], buf[5]]),
            mgmt: buf[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; TRUNK_HEADER_LEN] {
        let id = self.call_id.to_be_bytes();
        [
            (self.kind & 0x03) | (self.reserved << 2),
            self.dst_repeater,
            self.src_repeater,
            self.src_terminal,
            id[0],
            id[1],
            self.mgmt,
        ]
    }

    pub fn sequence(&self) -> u8 {
        self.mgmt & MGMT_SEQUENCE_MASK
    }

    pub fn is_corrupted(&self) -> bool {
        self.mgmt & MGMT_CORRUPTED != 0
    }

    pub fn is_last(&self) -> bool {
        self.mgmt & MGMT_KIND_MASK == MGMT_LAST_FRAME
    }
}

/// The 41-byte radio header sent at call setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioHeader {
    pub flags: [u8; 3],
    pub rpt1: Callsign,
    pub rpt2: Callsign,
    pub ur: Callsign,
    pub my: Callsign,
    pub my_suffix: [u8; 4],
}

impl RadioHeader {
    /// Header for a call from `my` to `ur` through the two repeater fields
    pub fn new(rpt1: Callsign, rpt2: Callsign, ur: Callsign, my: Callsign, suffix: &str) -> Self {
        RadioHeader {
            flags: [0; 3],
            rpt1,
            rpt2,
            ur,
            my,
            my_suffix: crate::util::space_padded(suffix),
        }
    }

    /// Parses a radio header, accepting it only when the embedded checksum matches
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RADIO_HEADER_LEN {
            return Err(Error::protocol(format!("Radio header needs 41 bytes, got {}", buf.len())));
        }
        let expected = u16::from_le_bytes([buf[39], buf[40]]);
        let computed = crc_ccitt(&buf[..39]);
        if expected != computed {
            return Err(Error::Checksum { expected, computed });
        }

        let mut flags = [0u8; 3];
        flags.copy_from_slice(&buf[0..3]);
        let mut my_suffix = [0u8; 4];
        my_suffix.copy_from_slice(&buf[35..39]);
        Ok(RadioHeader {
            flags,
            rpt1: Callsign::from_slice(&buf[3..11]),
            rpt2: Callsign::from_slice(&buf[11..19]),
            ur: Callsign::from_slice(&buf[19..27]),
            my: Callsign::from_slice(&buf[27..35]),
            my_suffix,
        })
    }

    /// Serializes the header with a freshly computed checksum
    pub fn to_bytes(&self) -> [u8; RADIO_HEADER_LEN] {
        let mut buf = [0u8; RADIO_HEADER_LEN];
        buf[0..3].copy_from_slice(&self.flags);
        buf[3..11].copy_from_slice(self.rpt1.as_bytes());
        buf[11..19].copy_from_slice(self.rpt2.as_bytes());
        buf[19..27].copy_from_slice(self.ur.as_bytes());
        buf[27..35].copy_from_slice(self.my.as_bytes());
        buf[35..39].copy_from_slice(&self.my_suffix);
        let crc = crc_ccitt(&buf[..39]);
        buf[39..41].copy_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// 56-byte stream header packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPacket {
    pub trunk: TrunkHeader,
    pub radio: RadioHeader,
}

impl HeaderPacket {
    pub fn to_bytes(&self) -> [u8; STREAM_HEADER_LEN] {
        let mut buf = [0u8; STREAM_HEADER_LEN];
        write_prefix(&mut buf, FLAG_HEADER);
        buf[8..15].copy_from_slice(&self.trunk.to_bytes());
        buf[15..].copy_from_slice(&self.radio.to_bytes());
        buf
    }
}

/// 27-byte stream data packet: one voice frame and one data field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoicePacket {
    pub trunk: TrunkHeader,
    pub voice: [u8; VOICE_LEN],
    /// Data field as carried on the wire (scrambled unless it is the sync slot)
    pub data: [u8; DATA_LEN],
}

impl VoicePacket {
    pub fn to_bytes(&self) -> [u8; STREAM_PACKET_LEN] {
        let mut buf = [0u8; STREAM_PACKET_LEN];
        write_prefix(&mut buf, FLAG_VOICE);
        buf[8..15].copy_from_slice(&self.trunk.to_bytes());
        buf[15..24].copy_from_slice(&self.voice);
        buf[24..27].copy_from_slice(&self.data);
        buf
    }
}

/// 11-byte bind or unbind request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    raw: [u8; BIND_REQUEST_LEN],
}

impl BindRequest {
    /// Request from `callsign` (module `module`) to link to `target`, or unbind with `b' '`
    pub fn new(callsign: Callsign, module: u8, target: u8) -> Self {
        let mut raw = [0u8; BIND_REQUEST_LEN];
        raw[..8].copy_from_slice(callsign.as_bytes());
        raw[8] = module;
        raw[9] = target;
        BindRequest { raw }
    }

    pub fn callsign(&self) -> Callsign {
        Callsign::from_slice(&self.raw[..8])
    }

    /// Module letter of the requesting repeater
    pub fn module(&self) -> u8 {
        self.raw[8]
    }

    /// Reflector module to bind to
    pub fn target_module(&self) -> u8 {
        self.raw[9]
    }

    pub fn is_unbind(&self) -> bool {
        matches!(self.raw[9], b' ' | b'Q')
    }

    /// Acknowledgement echoing the request: its first 10 bytes followed by `"ACK\0"`
    pub fn ack(&self) -> [u8; BIND_ANSWER_LEN] {
        let mut ack = [0u8; BIND_ANSWER_LEN];
        ack[..10].copy_from_slice(&self.raw[..10]);
        ack[10..].copy_from_slice(BIND_ACK);
        ack
    }

    pub fn as_bytes(&self) -> &[u8; BIND_REQUEST_LEN] {
        &self.raw
    }
}

/// A decoded DExtra datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Keepalive carrying the sender's callsign
    Keepalive([u8; KEEPALIVE_LEN]),
    Bind(BindRequest),
    /// Answer to a bind we originated; never expected since adjuncts are unsupported
    BindAnswer([u8; BIND_ANSWER_LEN]),
    Header(HeaderPacket),
    Voice(VoicePacket),
}

impl Packet {
    /// Decodes one datagram, dispatching purely on its length
    pub fn parse(buf: &[u8]) -> Result<Packet> {
        match buf.len() {
            KEEPALIVE_LEN => {
                let mut raw = [0u8; KEEPALIVE_LEN];
                raw.copy_from_slice(buf);
                Ok(Packet::Keepalive(raw))
            }
            BIND_REQUEST_LEN => {
                let mut raw = [0u8; BIND_REQUEST_LEN];
                raw.copy_from_slice(buf);
                Ok(Packet::Bind(BindRequest { raw }))
            }
            BIND_ANSWER_LEN => {
                let mut raw = [0u8; BIND_ANSWER_LEN];
                raw.copy_from_slice(buf);
                Ok(Packet::BindAnswer(raw))
            }
            STREAM_HEADER_LEN => {
                check_signature(buf)?;
                Ok(Packet::Header(HeaderPacket {
                    trunk: TrunkHeader::decode(&buf[8..15])?,
                    radio: RadioHeader::decode(&buf[15..])?,
                }))
            }
            STREAM_PACKET_LEN => {
                check_signature(buf)?;
                let mut voice = [0u8; VOICE_LEN];
                voice.copy_from_slice(&buf[15..24]);
                let mut data = [0u8; DATA_LEN];
                data.copy_from_slice(&buf[24..27]);
                Ok(Packet::Voice(VoicePacket {
                    trunk: TrunkHeader::decode(&buf[8..15])?,
                    voice,
                    data,
                }))
            }
            len => Err(Error::Malformed(len)),
        }
    }

    /// Serializes the packet to its wire form
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Packet::Keepalive(raw) => raw.to_vec(),
            Packet::Bind(request) => request.as_bytes().to_vec(),
            Packet::BindAnswer(raw) => raw.to_vec(),
            Packet::Header(header) => header.to_bytes().to_vec(),
            Packet::Voice(voice) => voice.to_bytes().to_vec(),
        }
    }
}

fn check_signature(buf: &[u8]) -> Result<()> {
    if &buf[..4] != DSVT_SIGNATURE {
        return Err(Error::BadSignature);
    }
    Ok(())
}

fn write_prefix(buf: &mut [u8], flag: u8) {
    buf[..4].copy_from_slice(DSVT_SIGNATURE);
    buf[4] = flag;
    buf[5..PREFIX_LEN].fill(0);
}
