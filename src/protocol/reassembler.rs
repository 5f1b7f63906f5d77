//! S-Frame reassembly
//!
//! Rebuilds the slow-data, message and fast-data content of one call from
//! its sequenced data packets. A record is interpreted only once both of its
//! slots have arrived, so packets may be reordered within a superframe; a
//! half record still missing its partner when the call ends is discarded.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::core::{Error, Result};
use crate::util::trim_field;
use super::frame::{RadioHeader, VoicePacket, DATA_LEN, MAX_SEQUENCE, SUPERFRAME_SLOTS, VOICE_LEN};
use super::scrambler::descramble;
use super::sframe::{
    fast_data_bytes, fast_data_cap, record_of_slot, slots_of_record, SFrame, ACCUMULATOR_LEN,
    FAST_VOICE_REGION_LEN, MESSAGE_CHUNK_LEN, MESSAGE_LEN, RECORD_LEN,
};

/// Backwards sequence jump that, onto an already filled slot, marks a
/// superframe wrap whose sync slot was lost
const WRAP_DETECT_DISTANCE: u8 = 10;

/// Everything recovered from one completed call
#[derive(Debug, Clone)]
pub struct CallPayload {
    /// Stream id of the call
    pub stream_id: u16,
    /// Radio header that opened the call
    pub header: Option<RadioHeader>,
    /// Slow-data message, blank padded
    pub message: [u8; MESSAGE_LEN],
    /// Simple and fast data, in arrival order
    pub data: Bytes,
    /// When the last frame was processed
    pub completed_at: DateTime<Utc>,
}

impl CallPayload {
    /// The message without its padding
    pub fn message_text(&self) -> String {
        trim_field(&self.message)
    }
}

/// Per-session reassembly state
pub struct Reassembler {
    stream_id: Option<u16>,
    header: Option<RadioHeader>,
    /// Raw voice payload of every slot, kept for fast-data extraction
    voice: [u8; SUPERFRAME_SLOTS * VOICE_LEN],
    /// Descrambled data fields of slots 1..=20
    accumulator: [u8; ACCUMULATOR_LEN],
    /// Bit `seq` set once slot `seq` arrived in the current superframe
    rx_mask: u32,
    /// Bit `k` set once record `k` was interpreted in the current superframe
    parsed_mask: u16,
    last_sequence: u8,
    message: [u8; MESSAGE_LEN],
    /// Simple-data bytes not yet flushed into the output
    pending: BytesMut,
    output: BytesMut,
    fast_records: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Creates an idle reassembler with no active stream
    pub fn new() -> Self {
        Reassembler {
            stream_id: None,
            header: None,
            voice: [0; SUPERFRAME_SLOTS * VOICE_LEN],
            accumulator: [0; ACCUMULATOR_LEN],
            rx_mask: 0,
            parsed_mask: 0,
            last_sequence: 0,
            message: [b' '; MESSAGE_LEN],
            pending: BytesMut::new(),
            output: BytesMut::new(),
            fast_records: 0,
        }
    }

    /// Starts reassembling the call identified by `stream_id`, dropping any partial state
    pub fn begin(&mut self, stream_id: u16, header: Option<RadioHeader>) {
        self.clear();
        self.stream_id = Some(stream_id);
        self.header = header;
    }

    /// Drops the active call without delivering it
    pub fn abandon(&mut self) {
        self.clear();
    }

    /// Stream id of the call being reassembled
    pub fn active_stream(&self) -> Option<u16> {
        self.stream_id
    }

    /// Slots received in the current superframe
    pub fn receive_mask(&self) -> u32 {
        self.rx_mask
    }

    /// Feeds one data packet; returns the payload when it closes the call
    pub fn push(&mut self, packet: &VoicePacket) -> Result<Option<CallPayload>> {
        let trunk = &packet.trunk;
        if self.stream_id != Some(trunk.call_id) {
            return Err(Error::StreamMismatch {
                active: self.stream_id,
                received: trunk.call_id,
            });
        }
        if trunk.is_corrupted() {
            return Err(Error::Corrupted);
        }
        let seq = trunk.sequence();
        if seq > MAX_SEQUENCE {
            return Err(Error::SequenceOutOfRange(seq));
        }

        let slot = seq as usize;
        self.voice[slot * VOICE_LEN..(slot + 1) * VOICE_LEN].copy_from_slice(&packet.voice);

        let refilled = self.rx_mask & (1 << seq) != 0;
        if seq == 0 || (refilled && seq + WRAP_DETECT_DISTANCE < self.last_sequence) {
            self.start_superframe();
        }
        self.last_sequence = seq;

        if let Some(record) = record_of_slot(seq) {
            let mut field = packet.data;
            descramble(&mut field);
            let offset = (slot - 1) * DATA_LEN;
            self.accumulator[offset..offset + DATA_LEN].copy_from_slice(&field);
            self.rx_mask |= 1 << seq;
            self.try_interpret(record);
        }

        if trunk.is_last() {
            return Ok(Some(self.finish()));
        }
        Ok(None)
    }

    fn start_superframe(&mut self) {
        self.flush_pending();
        self.rx_mask = 0;
        self.parsed_mask = 0;
        self.accumulator = [0; ACCUMULATOR_LEN];
    }

    fn try_interpret(&mut self, index: usize) {
        let (odd, even) = slots_of_record(index);
        let both = (1u32 << odd) | (1u32 << even);
        if self.rx_mask & both != both || self.parsed_mask & (1 << index) != 0 {
            return;
        }
        self.parsed_mask |= 1 << index;

        let mut record = [0u8; RECORD_LEN];
        record.copy_from_slice(&self.accumulator[index * RECORD_LEN..(index + 1) * RECORD_LEN]);

        match SFrame::classify(&record) {
            SFrame::SimpleData(bytes) => self.pending.extend_from_slice(bytes),
            SFrame::Message { index: chunk_index, chunk } => {
                let start = chunk_index * MESSAGE_CHUNK_LEN;
                self.message[start..start + MESSAGE_CHUNK_LEN].copy_from_slice(chunk);
            }
            SFrame::FastData { declared } => {
                let len = declared.min(fast_data_cap(self.fast_records));
                self.fast_records += 1;
                self.flush_pending();
                let start = odd * VOICE_LEN;
                let region = &self.voice[start..start + FAST_VOICE_REGION_LEN];
                self.output.extend(fast_data_bytes(&record, region).take(len));
            }
            SFrame::Unsupported(kind) => {
                trace!(record = index, kind, "Dropping unsupported S-Frame record");
            }
        }
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            let pending = self.pending.split();
            self.output.extend_from_slice(&pending);
        }
    }

    fn finish(&mut self) -> CallPayload {
        self.flush_pending();
        let payload = CallPayload {
            stream_id: self.stream_id.unwrap_or_default(),
            header: self.header,
            message: self.message,
            data: self.output.split().freeze(),
            completed_at: Utc::now(),
        };
        debug!(
            stream_id = payload.stream_id,
            bytes = payload.data.len(),
            message = %payload.message_text(),
            "Call reassembled"
        );
        self.clear();
        payload
    }

    fn clear(&mut self) {
        self.stream_id = None;
        self.header = None;
        self.rx_mask = 0;
        self.parsed_mask = 0;
        self.last_sequence = 0;
        self.accumulator = [0; ACCUMULATOR_LEN];
        self.message = [b' '; MESSAGE_LEN];
        self.pending.clear();
        self.output.clear();
        self.fast_records = 0;
    }
}
