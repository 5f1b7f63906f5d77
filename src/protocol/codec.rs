use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::Error;
use super::frame::Packet;

/// Datagram codec for DExtra packets
///
/// Each call to `decode` consumes the whole buffer as one datagram, since
/// the packet kind is determined by the datagram's exact length.
#[derive(Clone, Default)]
pub struct DsvtCodec;

impl DsvtCodec {
    /// Creates a new datagram codec
    pub fn new() -> Self {
        DsvtCodec
    }
}

impl Decoder for DsvtCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        Packet::parse(&datagram).map(Some)
    }
}

impl Encoder<Packet> for DsvtCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item.to_vec());
        Ok(())
    }
}
