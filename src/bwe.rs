//! Bandwidth-estimate sendback: the predictor contract and the application
//! packet that ferries its estimate to the sender.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};
use crate::marshal::{Marshal, MarshalSize, Unmarshal};

/// Application packet sub-type carrying a bandwidth estimate message.
pub const BWE_MESSAGE_SUB_TYPE: u8 = 0;

/// Four-byte application packet name for bandwidth estimate messages.
pub const BWE_MESSAGE_NAME: [u8; 4] = *b"BWE ";

const RTCP_VERSION: u8 = 2;
const PACKET_TYPE_APP: u8 = 204;

/// Fixed-shape record of one received media packet, handed to the bandwidth
/// predictor on every arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketRecord {
    pub payload_type: u8,
    /// Media-level RTP sequence number (not the transport-wide sequence).
    pub sequence_number: u16,
    /// Send time in milliseconds, recovered from the absolute send time
    /// extension.
    pub send_time_ms: u32,
    pub ssrc: u32,
    pub padding_length: usize,
    pub header_length: usize,
    pub arrival_time_ms: i64,
    pub payload_size: usize,
    /// -1 when unknown; the receive path has no loss accounting.
    pub loss_count: i64,
    /// -1 when unknown; the receive path has no RTT measurement.
    pub rtt_ms: i64,
}

/// Produces bandwidth estimates from observed packet arrivals.
///
/// Implementations must not call back into the proxy: they are invoked while
/// the proxy lock is held.
pub trait BandwidthPredictor: Send {
    fn on_received(&mut self, record: &PacketRecord);

    /// Current estimate in bits per second.
    fn get_bwe_estimate(&self) -> f32;
}

/// Bandwidth estimate shipped back to the sender.
///
/// Marshaled little-endian: three `f32` rates followed by an `i64` timestamp.
/// Sender and receiver must agree on this layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BweMessage {
    pub pacing_rate: f32,
    pub padding_rate: f32,
    pub target_rate: f32,
    pub timestamp_ms: i64,
}

impl MarshalSize for BweMessage {
    fn marshal_size(&self) -> usize {
        4 + 4 + 4 + 8
    }
}

impl Marshal for BweMessage {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::ErrBufferShort);
        }
        buf.put_f32_le(self.pacing_rate);
        buf.put_f32_le(self.padding_rate);
        buf.put_f32_le(self.target_rate);
        buf.put_i64_le(self.timestamp_ms);
        Ok(self.marshal_size())
    }
}

impl Unmarshal for BweMessage {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < 20 {
            return Err(Error::ErrBufferShort);
        }
        Ok(Self {
            pacing_rate: buf.get_f32_le(),
            padding_rate: buf.get_f32_le(),
            target_rate: buf.get_f32_le(),
            timestamp_ms: buf.get_i64_le(),
        })
    }
}

/// RTCP application-defined packet carrying a side-channel payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationPacket {
    pub sub_type: u8,
    pub ssrc: u32,
    pub name: [u8; 4],
    pub data: Bytes,
}

impl MarshalSize for ApplicationPacket {
    fn marshal_size(&self) -> usize {
        let unpadded = 4 + 4 + 4 + self.data.len();
        (unpadded + 3) & !3
    }
}

impl Marshal for ApplicationPacket {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrBufferShort);
        }
        let padding = size - 12 - self.data.len();
        let padding_bit = if padding > 0 { 1 << 5 } else { 0 };
        buf.put_u8((RTCP_VERSION << 6) | padding_bit | (self.sub_type & 0x1F));
        buf.put_u8(PACKET_TYPE_APP);
        buf.put_u16((size / 4 - 1) as u16);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);
        for _ in 0..padding {
            buf.put_u8(0);
        }
        Ok(size)
    }
}
