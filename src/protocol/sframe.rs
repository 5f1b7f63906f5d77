//! S-Frame records and the superframe slot layout
//!
//! Slots 1..=20 of a superframe pair up into ten records: pair `k` is made
//! of slots `2k + 1` and `2k + 2`, each contributing a 3-byte data field.
//! A record starts with a type nibble and an argument nibble.
//!
//! Fast data also borrows the voice payloads of the pair's two slots. The
//! 18-byte region `voice[odd] ++ voice[even]` holds three 4-byte fragments
//! at offsets 0, 5 and 10, each followed by a mitigation byte that keeps the
//! payload from imitating the sync pattern.

use super::frame::{DATA_LEN, MAX_SEQUENCE, VOICE_LEN};

/// Length of one assembled record
pub const RECORD_LEN: usize = 2 * DATA_LEN;
/// Records per superframe
pub const RECORDS_PER_SUPERFRAME: usize = MAX_SEQUENCE as usize / 2;
/// Data-field bytes accumulated per superframe
pub const ACCUMULATOR_LEN: usize = RECORDS_PER_SUPERFRAME * RECORD_LEN;
/// Length of the slow-data message
pub const MESSAGE_LEN: usize = 20;
/// Bytes of message per type-4 record
pub const MESSAGE_CHUNK_LEN: usize = 5;

/// Sync pattern carried by slot 0 instead of a data field
pub const SYNC_PATTERN: [u8; DATA_LEN] = [0x55, 0x2D, 0x16];
/// Idle slow-data filler, before scrambling
pub const FILLER_DATA: [u8; DATA_LEN] = [0x66, 0x66, 0x66];

pub const TYPE_SIMPLE_DATA: u8 = 0x3;
pub const TYPE_MESSAGE: u8 = 0x4;
pub const TYPE_FAST_DATA: u8 = 0x8;
pub const TYPE_FAST_DATA_HIGH: u8 = 0x9;

/// Maximum payload of a simple data record
pub const SIMPLE_DATA_MAX: usize = 5;

/// Offset subtracted from the record's first byte to get the fast-data length
pub const FAST_DATA_BASE: u8 = 0x80;
/// Declared length cap of the first fast-data record of a call
pub const FAST_DATA_FIRST_CAP: usize = 28;
/// Declared length cap of every later fast-data record
pub const FAST_DATA_CAP: usize = 20;
/// Byte between the two record-borne fast-data byte pairs
pub const FAST_DATA_GUARD: u8 = 0x02;
/// Byte following each voice-borne fast-data fragment
pub const FAST_DATA_MITIGATION: u8 = 0x02;
/// Voice region borrowed by one fast-data record
pub const FAST_VOICE_REGION_LEN: usize = 2 * VOICE_LEN;
/// Offsets of the 4-byte fragments inside the voice region
pub const FAST_VOICE_FRAGMENTS: [usize; 3] = [0, 5, 10];
/// Bytes one record can physically carry
pub const FAST_DATA_CAPACITY: usize = 4 + 4 * FAST_VOICE_FRAGMENTS.len();

/// Record index of a data slot, `None` for the sync slot or out-of-range slots
pub fn record_of_slot(slot: u8) -> Option<usize> {
    match slot {
        1..=MAX_SEQUENCE => Some((slot as usize - 1) / 2),
        _ => None,
    }
}

/// The two slots carrying record `index`
pub fn slots_of_record(index: usize) -> (usize, usize) {
    (2 * index + 1, 2 * index + 2)
}

/// Declared fast-data length cap for the `nth` fast-data record of a call
pub fn fast_data_cap(nth: usize) -> usize {
    if nth == 0 {
        FAST_DATA_FIRST_CAP
    } else {
        FAST_DATA_CAP
    }
}

/// Bytes the builder packs into the `nth` fast-data record
pub fn fast_data_chunk_len(nth: usize) -> usize {
    fast_data_cap(nth).min(FAST_DATA_CAPACITY)
}

/// A decoded S-Frame record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SFrame<'a> {
    SimpleData(&'a [u8]),
    Message { index: usize, chunk: &'a [u8] },
    /// Fast data with its raw declared length
    FastData { declared: usize },
    Unsupported(u8),
}

impl<'a> SFrame<'a> {
    /// Classifies a 6-byte record by its type nibble
    pub fn classify(record: &'a [u8]) -> SFrame<'a> {
        let kind = record[0] >> 4;
        let arg = (record[0] & 0x0F) as usize;
        match kind {
            TYPE_SIMPLE_DATA if (1..=SIMPLE_DATA_MAX).contains(&arg) => {
                SFrame::SimpleData(&record[1..1 + arg])
            }
            TYPE_MESSAGE if arg < MESSAGE_LEN / MESSAGE_CHUNK_LEN => SFrame::Message {
                index: arg,
                chunk: &record[1..1 + MESSAGE_CHUNK_LEN],
            },
            TYPE_FAST_DATA | TYPE_FAST_DATA_HIGH => SFrame::FastData {
                declared: record[0].wrapping_sub(FAST_DATA_BASE) as usize,
            },
            _ => SFrame::Unsupported(record[0]),
        }
    }
}

/// Iterates the fast-data bytes of a record and its voice region, in wire order
pub fn fast_data_bytes<'a>(record: &'a [u8], region: &'a [u8]) -> impl Iterator<Item = u8> + 'a {
    let fragments = FAST_VOICE_FRAGMENTS
        .into_iter()
        .flat_map(move |offset| region[offset..offset + 4].iter());
    record[1..3]
        .iter()
        .chain(record[4..6].iter())
        .chain(fragments)
        .copied()
}

/// Lays out a fast-data chunk of at most [`FAST_DATA_CAPACITY`] bytes
pub fn encode_fast_data(chunk: &[u8]) -> ([u8; RECORD_LEN], [u8; FAST_VOICE_REGION_LEN]) {
    let len = chunk.len().min(FAST_DATA_CAPACITY);
    let mut padded = [0u8; FAST_DATA_CAPACITY];
    padded[..len].copy_from_slice(&chunk[..len]);

    let record = [
        FAST_DATA_BASE + len as u8,
        padded[0],
        padded[1],
        FAST_DATA_GUARD,
        padded[2],
        padded[3],
    ];

    let mut region = [0u8; FAST_VOICE_REGION_LEN];
    for (i, &offset) in FAST_VOICE_FRAGMENTS.iter().enumerate() {
        let start = 4 + 4 * i;
        region[offset..offset + 4].copy_from_slice(&padded[start..start + 4]);
        region[offset + 4] = FAST_DATA_MITIGATION;
    }
    (record, region)
}

/// Builds a simple-data record of at most five bytes
pub fn simple_data_record(chunk: &[u8]) -> [u8; RECORD_LEN] {
    let len = chunk.len().min(SIMPLE_DATA_MAX);
    let mut record = [0x66; RECORD_LEN];
    record[0] = (TYPE_SIMPLE_DATA << 4) | len as u8;
    record[1..1 + len].copy_from_slice(&chunk[..len]);
    record
}

/// Builds the message record carrying chunk `index` of a 20-byte message
pub fn message_record(message: &[u8; MESSAGE_LEN], index: usize) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[0] = (TYPE_MESSAGE << 4) | index as u8;
    let start = index * MESSAGE_CHUNK_LEN;
    record[1..].copy_from_slice(&message[start..start + MESSAGE_CHUNK_LEN]);
    record
}
