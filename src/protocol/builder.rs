//! Outbound call synthesis
//!
//! [`FrameBuilder`] turns an [`OutboundCall`] into the header packet and the
//! ordered list of data packets of one transmission. Pacing those packets
//! onto the wire is left to the network layer.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use super::frame::{
    HeaderPacket, RadioHeader, TrunkHeader, VoicePacket, DATA_LEN, MAX_SEQUENCE, MGMT_HEADER,
    MGMT_LAST_FRAME, VOICE_LEN,
};
use super::scrambler::scramble;
use super::sframe::{
    encode_fast_data, fast_data_chunk_len, message_record, simple_data_record, FILLER_DATA,
    MESSAGE_CHUNK_LEN, MESSAGE_LEN, RECORD_LEN, SIMPLE_DATA_MAX, SYNC_PATTERN,
};

/// Times the header packet is repeated; losing every copy aborts the remote decode
pub const HEADER_REPEATS: usize = 5;
/// One D-Star voice frame
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);
/// Frames between two beep bursts in fast-data mode
pub const BEEP_INTERVAL_FRAMES: usize = 44;
/// Length of a beep burst
pub const BEEP_FRAMES: usize = 6;

/// AMBE silence, used as comfort noise under slow data
pub const SILENCE_VOICE: [u8; VOICE_LEN] = [0x9E, 0x8D, 0x32, 0x88, 0x26, 0x1A, 0x3F, 0x61, 0xE8];
/// AMBE tone frame of the beep burst
pub const BEEP_VOICE: [u8; VOICE_LEN] = [0xEE, 0x6F, 0x04, 0xA8, 0xB2, 0x9D, 0x14, 0x61, 0xC5];
/// Voice field of the end-of-transmission frame
pub const END_VOICE: [u8; VOICE_LEN] = [0x55, 0x55, 0x55, 0x55, 0xC8, 0x7A, 0x00, 0x00, 0x00];
/// Data field of the end-of-transmission frame
pub const END_DATA: [u8; DATA_LEN] = [0x55, 0x55, 0x55];

/// How the payload is carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Five bytes per record, silence in the voice frames
    SlowData,
    /// Up to sixteen bytes per record, voice frames carry data
    FastData,
}

/// A call to be originated by the gateway
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub header: RadioHeader,
    /// Optional 20-character message sent ahead of the payload
    pub message: Option<String>,
    pub payload: Bytes,
    pub mode: PayloadMode,
}

/// The packets of one transmission
#[derive(Debug, Clone)]
pub struct TxPlan {
    pub stream_id: u16,
    /// Header packet, to be sent `header_repeats` times
    pub header: Bytes,
    pub header_repeats: usize,
    /// Data packets, one per frame interval
    pub frames: Vec<Bytes>,
}

/// Synthesizes the superframes of one outbound call
pub struct FrameBuilder {
    stream_id: u16,
    sequence: u8,
    frames: Vec<Bytes>,
    since_beep: usize,
    fast_records: usize,
}

impl FrameBuilder {
    /// Creates a builder for the given stream id
    pub fn new(stream_id: u16) -> Self {
        FrameBuilder {
            stream_id,
            sequence: 0,
            frames: Vec::new(),
            since_beep: 0,
            fast_records: 0,
        }
    }

    /// Creates a builder with a random, non-zero stream id
    pub fn with_random_stream() -> Self {
        let stream_id = rand::thread_rng().gen_range(1..=u16::MAX);
        Self::new(stream_id)
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Lays out every packet of `call`
    pub fn build(mut self, call: &OutboundCall) -> TxPlan {
        let header = HeaderPacket {
            trunk: TrunkHeader::stream(self.stream_id, MGMT_HEADER),
            radio: call.header,
        };

        self.align();
        if let Some(text) = &call.message {
            self.push_message(text);
        }
        match call.mode {
            PayloadMode::SlowData => self.push_slow_data(&call.payload),
            PayloadMode::FastData => self.push_fast_data(&call.payload),
        }
        self.push_end();

        TxPlan {
            stream_id: self.stream_id,
            header: Bytes::copy_from_slice(&header.to_bytes()),
            header_repeats: HEADER_REPEATS,
            frames: self.frames,
        }
    }

    fn push_message(&mut self, text: &str) {
        let message: [u8; MESSAGE_LEN] = crate::util::space_padded(text);
        let chunks = text.len().div_ceil(MESSAGE_CHUNK_LEN).clamp(1, MESSAGE_LEN / MESSAGE_CHUNK_LEN);
        for index in 0..chunks {
            self.push_record(message_record(&message, index), [SILENCE_VOICE; 2]);
        }
    }

    fn push_slow_data(&mut self, payload: &[u8]) {
        for chunk in payload.chunks(SIMPLE_DATA_MAX) {
            self.push_record(simple_data_record(chunk), [SILENCE_VOICE; 2]);
        }
    }

    fn push_fast_data(&mut self, payload: &[u8]) {
        let mut rest = payload;
        while !rest.is_empty() {
            let len = fast_data_chunk_len(self.fast_records).min(rest.len());
            let (chunk, tail) = rest.split_at(len);
            rest = tail;
            self.fast_records += 1;

            if self.since_beep >= BEEP_INTERVAL_FRAMES {
                self.push_beep();
            }

            let (record, region) = encode_fast_data(chunk);
            let mut odd = [0u8; VOICE_LEN];
            let mut even = [0u8; VOICE_LEN];
            odd.copy_from_slice(&region[..VOICE_LEN]);
            even.copy_from_slice(&region[VOICE_LEN..]);
            self.push_record(record, [odd, even]);
        }
    }

    fn push_beep(&mut self) {
        for _ in 0..BEEP_FRAMES {
            self.push_frame(BEEP_VOICE, FILLER_DATA, false);
        }
        self.since_beep = 0;
        self.align();
    }

    /// Emits a record on an odd/even slot pair
    fn push_record(&mut self, record: [u8; RECORD_LEN], voice: [[u8; VOICE_LEN]; 2]) {
        self.align();
        self.push_frame(voice[0], [record[0], record[1], record[2]], false);
        self.push_frame(voice[1], [record[3], record[4], record[5]], false);
    }

    /// Pads with sync or filler frames until the next slot starts a record pair
    fn align(&mut self) {
        while self.sequence % 2 == 0 {
            self.push_frame(SILENCE_VOICE, FILLER_DATA, false);
        }
    }

    fn push_end(&mut self) {
        self.push_frame(END_VOICE, END_DATA, true);
    }

    fn push_frame(&mut self, voice: [u8; VOICE_LEN], field: [u8; DATA_LEN], last: bool) {
        let data = if self.sequence == 0 {
            SYNC_PATTERN
        } else {
            let mut data = field;
            scramble(&mut data);
            data
        };
        let mgmt = self.sequence | if last { MGMT_LAST_FRAME } else { 0 };
        let packet = VoicePacket {
            trunk: TrunkHeader::stream(self.stream_id, mgmt),
            voice,
            data,
        };
        self.frames.push(Bytes::copy_from_slice(&packet.to_bytes()));

        self.since_beep += 1;
        self.sequence = if self.sequence >= MAX_SEQUENCE { 0 } else { self.sequence + 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Callsign;
    use crate::protocol::frame::Packet;
    use crate::protocol::reassembler::{CallPayload, Reassembler};

    fn call(mode: PayloadMode, message: Option<&str>, payload: &[u8]) -> OutboundCall {
        OutboundCall {
            header: RadioHeader::new(
                Callsign::new("XRFSGW A"),
                Callsign::new("XRFSGW G"),
                Callsign::new("CQCQCQ"),
                Callsign::new("XRFSGW"),
                "DATA",
            ),
            message: message.map(str::to_string),
            payload: Bytes::copy_from_slice(payload),
            mode,
        }
    }

    fn replay(plan: &TxPlan) -> CallPayload {
        let header = match Packet::parse(&plan.header).unwrap() {
            Packet::Header(header) => header,
            other => panic!("expected header, got {:?}", other),
        };
        let mut reassembler = Reassembler::new();
        reassembler.begin(header.trunk.call_id, Some(header.radio));

        let mut result = None;
        for frame in &plan.frames {
            match Packet::parse(frame).unwrap() {
                Packet::Voice(voice) => {
                    assert!(result.is_none(), "frames after the last one");
                    result = reassembler.push(&voice).unwrap();
                }
                other => panic!("expected voice, got {:?}", other),
            }
        }
        result.expect("plan ends with a last frame")
    }

    #[test]
    fn test_sequence_layout() {
        let plan = FrameBuilder::new(0x0101).build(&call(PayloadMode::SlowData, None, &[0u8; 60]));
        assert_eq!(plan.header_repeats, HEADER_REPEATS);
        assert_eq!(plan.header.len(), 56);

        // sync + 12 records of 2 slots + one more sync in between, then EOT
        for (i, frame) in plan.frames.iter().enumerate() {
            assert_eq!(frame.len(), 27);
            let seq = frame[14] & 0x1F;
            assert_eq!(seq as usize, i % 21);
            if seq == 0 {
                assert_eq!(&frame[24..27], &SYNC_PATTERN);
            }
        }
        let last = plan.frames.last().unwrap();
        assert_eq!(last[14] & 0xC0, MGMT_LAST_FRAME);
        assert_eq!(plan.frames.iter().filter(|f| f[14] & 0xC0 == MGMT_LAST_FRAME).count(), 1);
    }

    #[test]
    fn test_slow_data_round_trip() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let plan = FrameBuilder::new(0x2222).build(&call(PayloadMode::SlowData, Some("Hi there"), data));
        let payload = replay(&plan);
        assert_eq!(payload.data.as_ref(), &data[..]);
        assert_eq!(payload.message_text(), "Hi there");
        assert_eq!(payload.stream_id, 0x2222);
        assert_eq!(payload.header.unwrap().my, Callsign::new("XRFSGW"));
    }

    #[test]
    fn test_fast_data_round_trip_with_beeps() {
        let data: Vec<u8> = (0..600u32).map(|i| (i * 7 % 251) as u8).collect();
        let plan = FrameBuilder::new(0x3333).build(&call(PayloadMode::FastData, None, &data));

        let beeps = plan.frames.iter().filter(|f| f[15..24] == BEEP_VOICE).count();
        assert!(beeps >= BEEP_FRAMES);
        assert_eq!(beeps % BEEP_FRAMES, 0);

        let payload = replay(&plan);
        assert_eq!(payload.data.as_ref(), data.as_slice());
    }

    #[test]
    fn test_message_chunks() {
        let plan = FrameBuilder::new(0x4444).build(&call(PayloadMode::SlowData, Some("ABCDEFG"), &[]));
        // sync, two message records, EOT
        assert_eq!(plan.frames.len(), 1 + 4 + 1);
        let payload = replay(&plan);
        assert_eq!(payload.message_text(), "ABCDEFG");
        assert!(payload.data.is_empty());
    }

    #[test]
    fn test_random_stream_id() {
        assert_ne!(FrameBuilder::with_random_stream().stream_id(), 0);
    }
}
