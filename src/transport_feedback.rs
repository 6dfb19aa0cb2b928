//! Transport-wide feedback packet as specified in
//! <https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01>

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::marshal::{Marshal, MarshalSize};

/// Scale factor for receive deltas (250 microseconds).
const DELTA_SCALE_FACTOR: i64 = 250;

/// Reference time granularity in microseconds (64 ms).
const REF_TIME_UNIT_US: i64 = 64_000;

/// Maximum marshaled size of one feedback packet. Keeps the packet under a
/// conservative path MTU together with IP/UDP/SRTP overhead.
const MAX_SIZE_BYTES: usize = 1350;

/// Fixed header: RTCP header (4) + sender SSRC (4) + media SSRC (4) +
/// base sequence (2) + status count (2) + reference time (3) + fb count (1).
const HEADER_SIZE_BYTES: usize = 20;

const CHUNK_SIZE_BYTES: usize = 2;

/// Chunk capacity limits.
const MAX_RUN_LENGTH_CAP: usize = 0x1FFF; // 13 bits
const MAX_ONE_BIT_CAP: usize = 14;
const MAX_TWO_BIT_CAP: usize = 7;

const RTCP_VERSION: u8 = 2;
const PACKET_TYPE_RTPFB: u8 = 205;
const FORMAT_TCC: u8 = 15;

/// Per-packet reception status symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTypeTcc {
    PacketNotReceived = 0,
    PacketReceivedSmallDelta = 1,
    PacketReceivedLargeDelta = 2,
    PacketReceivedWithoutDelta = 3,
}

impl SymbolTypeTcc {
    /// Only these two symbols can be represented in a one-bit status vector.
    fn one_bit_capable(self) -> bool {
        matches!(
            self,
            SymbolTypeTcc::PacketNotReceived | SymbolTypeTcc::PacketReceivedSmallDelta
        )
    }
}

/// Run length chunk: one symbol repeated up to 2^13 - 1 times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLengthChunk {
    pub packet_status_symbol: SymbolTypeTcc,
    pub run_length: u16,
}

/// Status vector chunk: 14 one-bit or 7 two-bit symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusVectorChunk {
    pub one_bit: bool,
    pub symbol_list: Vec<SymbolTypeTcc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketStatusChunk {
    RunLengthChunk(RunLengthChunk),
    StatusVectorChunk(StatusVectorChunk),
}

impl PacketStatusChunk {
    fn to_u16(&self) -> u16 {
        match self {
            PacketStatusChunk::RunLengthChunk(rlc) => {
                ((rlc.packet_status_symbol as u16) << 13) | (rlc.run_length & 0x1FFF)
            }
            PacketStatusChunk::StatusVectorChunk(svc) => {
                let mut word: u16 = 1 << 15;
                if svc.one_bit {
                    word |= 1 << 14;
                    for (i, &s) in svc.symbol_list.iter().enumerate() {
                        if s == SymbolTypeTcc::PacketReceivedSmallDelta {
                            word |= 1 << (13 - i);
                        }
                    }
                } else {
                    for (i, &s) in svc.symbol_list.iter().enumerate() {
                        word |= (s as u16) << (12 - 2 * i);
                    }
                }
                word
            }
        }
    }
}

/// A received-packet timestamp delta, stored in microseconds rounded to the
/// 250 us wire granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvDelta {
    pub type_tcc_packet: SymbolTypeTcc,
    pub delta_us: i64,
}

fn is_newer_sequence_number(value: u16, previous: u16) -> bool {
    value != previous && value.wrapping_sub(previous) < 0x8000
}

/// A transport feedback packet under construction.
///
/// Arrivals are appended in ascending sequence order via
/// [`add_received_packet`](Self::add_received_packet), which reports `false`
/// once the packet cannot take further entries (delta out of range or size
/// budget exhausted). The caller then opens a fresh packet and resumes.
#[derive(Debug, Clone)]
pub struct TransportFeedback {
    sender_ssrc: u32,
    media_ssrc: u32,
    base_sequence_number: u16,
    base_time_us: i64,
    reference_time_64ms: i64,
    fb_sequence_number: u8,
    include_timestamps: bool,

    next_sequence_number: u16,
    packet_status_count: u16,
    last_timestamp_us: i64,
    chunks: Vec<PacketStatusChunk>,
    last_chunk: Chunk,
    deltas: Vec<RecvDelta>,
    size_bytes: usize,
}

impl TransportFeedback {
    pub fn new(sender_ssrc: u32, include_timestamps: bool) -> Self {
        Self {
            sender_ssrc,
            media_ssrc: 0,
            base_sequence_number: 0,
            base_time_us: 0,
            reference_time_64ms: 0,
            fb_sequence_number: 0,
            include_timestamps,
            next_sequence_number: 0,
            packet_status_count: 0,
            last_timestamp_us: 0,
            chunks: Vec::new(),
            last_chunk: Chunk::new(),
            deltas: Vec::new(),
            size_bytes: HEADER_SIZE_BYTES,
        }
    }

    pub fn set_media_ssrc(&mut self, media_ssrc: u32) {
        self.media_ssrc = media_ssrc;
    }

    /// Set the expected first sequence number and the reference arrival time
    /// of the first received packet, in microseconds.
    pub fn set_base(&mut self, base_sequence: u16, ref_timestamp_us: i64) {
        self.base_sequence_number = base_sequence;
        self.next_sequence_number = base_sequence;
        self.base_time_us = ref_timestamp_us;
        self.reference_time_64ms = ref_timestamp_us / REF_TIME_UNIT_US;
        self.last_timestamp_us = self.reference_time_64ms * REF_TIME_UNIT_US;
    }

    pub fn set_feedback_sequence_number(&mut self, count: u8) {
        self.fb_sequence_number = count;
    }

    /// Append one received packet. Returns false when the entry does not fit:
    /// the timestamp delta exceeds 16 bits of 250 us ticks, or the packet
    /// would outgrow its size budget.
    pub fn add_received_packet(&mut self, sequence_number: u16, timestamp_us: i64) -> bool {
        let mut delta_size = 0usize;
        let mut delta_us_rounded = 0i64;
        let mut symbol = SymbolTypeTcc::PacketReceivedWithoutDelta;
        if self.include_timestamps {
            let delta_us = timestamp_us - self.last_timestamp_us;
            let delta = if delta_us >= 0 {
                (delta_us + DELTA_SCALE_FACTOR / 2) / DELTA_SCALE_FACTOR
            } else {
                (delta_us - DELTA_SCALE_FACTOR / 2) / DELTA_SCALE_FACTOR
            };
            if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
                return false;
            }
            delta_us_rounded = delta * DELTA_SCALE_FACTOR;
            if (0..=0xFF).contains(&delta) {
                delta_size = 1;
                symbol = SymbolTypeTcc::PacketReceivedSmallDelta;
            } else {
                delta_size = 2;
                symbol = SymbolTypeTcc::PacketReceivedLargeDelta;
            }
        }

        if sequence_number != self.next_sequence_number {
            let last = self.next_sequence_number.wrapping_sub(1);
            if !is_newer_sequence_number(sequence_number, last) {
                return false;
            }
            while self.next_sequence_number != sequence_number {
                if !self.add_symbol(SymbolTypeTcc::PacketNotReceived, 0) {
                    return false;
                }
                self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
            }
        }

        if !self.add_symbol(symbol, delta_size) {
            return false;
        }
        if self.include_timestamps {
            self.deltas.push(RecvDelta {
                type_tcc_packet: symbol,
                delta_us: delta_us_rounded,
            });
            self.last_timestamp_us += delta_us_rounded;
        }
        self.next_sequence_number = sequence_number.wrapping_add(1);
        true
    }

    /// Add one status symbol, charging `delta_size` bytes against the size
    /// budget. Chunk bytes are charged when a chunk is started.
    fn add_symbol(&mut self, symbol: SymbolTypeTcc, delta_size: usize) -> bool {
        if self.packet_status_count == u16::MAX {
            return false;
        }
        let begin_chunk = if self.last_chunk.is_empty() {
            CHUNK_SIZE_BYTES
        } else {
            0
        };
        if self.size_bytes + delta_size + begin_chunk > MAX_SIZE_BYTES {
            return false;
        }
        if self.last_chunk.can_add(symbol) {
            self.size_bytes += begin_chunk;
        } else {
            if self.size_bytes + delta_size + CHUNK_SIZE_BYTES > MAX_SIZE_BYTES {
                return false;
            }
            self.chunks.push(self.last_chunk.encode());
            self.size_bytes += CHUNK_SIZE_BYTES;
        }
        self.last_chunk.add(symbol);
        self.size_bytes += delta_size;
        self.packet_status_count += 1;
        true
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    pub fn base_sequence_number(&self) -> u16 {
        self.base_sequence_number
    }

    /// The reference arrival time passed to [`set_base`](Self::set_base),
    /// before truncation to the 64 ms wire granularity.
    pub fn base_time_us(&self) -> i64 {
        self.base_time_us
    }

    pub fn feedback_sequence_number(&self) -> u8 {
        self.fb_sequence_number
    }

    /// Number of sequence numbers covered, received or not.
    pub fn packet_status_count(&self) -> u16 {
        self.packet_status_count
    }

    pub fn recv_deltas(&self) -> &[RecvDelta] {
        &self.deltas
    }

    /// All status chunks, including the pending partial chunk.
    pub fn packet_chunks(&self) -> Vec<PacketStatusChunk> {
        let mut chunks = self.chunks.clone();
        let mut last = self.last_chunk.clone();
        while !last.is_empty() {
            chunks.push(last.encode());
        }
        chunks
    }

    /// Reception status symbols in sequence order, one per covered sequence
    /// number starting at the base.
    pub fn symbols(&self) -> Vec<SymbolTypeTcc> {
        let mut out = Vec::with_capacity(self.packet_status_count as usize);
        for chunk in self.packet_chunks() {
            match chunk {
                PacketStatusChunk::RunLengthChunk(rlc) => {
                    out.extend(std::iter::repeat_n(
                        rlc.packet_status_symbol,
                        rlc.run_length as usize,
                    ));
                }
                PacketStatusChunk::StatusVectorChunk(svc) => out.extend(svc.symbol_list),
            }
        }
        out.truncate(self.packet_status_count as usize);
        out
    }
}

impl MarshalSize for TransportFeedback {
    fn marshal_size(&self) -> usize {
        let chunks = self.packet_chunks().len();
        let deltas: usize = self
            .deltas
            .iter()
            .map(|d| match d.type_tcc_packet {
                SymbolTypeTcc::PacketReceivedSmallDelta => 1,
                _ => 2,
            })
            .sum();
        let unpadded = HEADER_SIZE_BYTES + chunks * CHUNK_SIZE_BYTES + deltas;
        (unpadded + 3) & !3
    }
}

impl Marshal for TransportFeedback {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrBufferShort);
        }
        let padding = size - HEADER_SIZE_BYTES
            - self.packet_chunks().len() * CHUNK_SIZE_BYTES
            - self
                .deltas
                .iter()
                .map(|d| match d.type_tcc_packet {
                    SymbolTypeTcc::PacketReceivedSmallDelta => 1usize,
                    _ => 2,
                })
                .sum::<usize>();

        let padding_bit = if padding > 0 { 1 << 5 } else { 0 };
        buf.put_u8((RTCP_VERSION << 6) | padding_bit | FORMAT_TCC);
        buf.put_u8(PACKET_TYPE_RTPFB);
        buf.put_u16((size / 4 - 1) as u16);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_u16(self.base_sequence_number);
        buf.put_u16(self.packet_status_count);
        let word = ((self.reference_time_64ms as u32 & 0xFF_FFFF) << 8)
            | self.fb_sequence_number as u32;
        buf.put_u32(word);
        for chunk in self.packet_chunks() {
            buf.put_u16(chunk.to_u16());
        }
        for delta in &self.deltas {
            let ticks = delta.delta_us / DELTA_SCALE_FACTOR;
            match delta.type_tcc_packet {
                SymbolTypeTcc::PacketReceivedSmallDelta => buf.put_u8(ticks as u8),
                _ => buf.put_i16(ticks as i16),
            }
        }
        for _ in 0..padding {
            buf.put_u8(0);
        }
        Ok(size)
    }
}

/// Builds one status chunk at a time, upgrading between run-length and
/// status-vector encodings as symbols accumulate.
#[derive(Debug, Clone)]
struct Chunk {
    has_large_delta: bool,
    all_one_bit_capable: bool,
    has_different_types: bool,
    symbols: Vec<SymbolTypeTcc>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            has_large_delta: false,
            all_one_bit_capable: true,
            has_different_types: false,
            symbols: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn can_add(&self, symbol: SymbolTypeTcc) -> bool {
        if self.symbols.len() < MAX_TWO_BIT_CAP {
            return true;
        }
        if self.symbols.len() < MAX_ONE_BIT_CAP
            && self.all_one_bit_capable
            && symbol.one_bit_capable()
        {
            return true;
        }
        if self.symbols.len() < MAX_RUN_LENGTH_CAP
            && !self.has_different_types
            && symbol == self.symbols[0]
        {
            return true;
        }
        false
    }

    fn add(&mut self, symbol: SymbolTypeTcc) {
        if !self.symbols.is_empty() && symbol != self.symbols[0] {
            self.has_different_types = true;
        }
        self.has_large_delta |= symbol == SymbolTypeTcc::PacketReceivedLargeDelta;
        self.all_one_bit_capable &= symbol.one_bit_capable();
        self.symbols.push(symbol);
    }

    /// Emit the densest encoding for the buffered symbols. A two-bit vector
    /// can only carry seven symbols, so any overflow is carried into the next
    /// chunk.
    fn encode(&mut self) -> PacketStatusChunk {
        if !self.has_different_types {
            let chunk = PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                packet_status_symbol: self.symbols[0],
                run_length: self.symbols.len() as u16,
            });
            self.reset();
            return chunk;
        }

        if self.symbols.len() == MAX_ONE_BIT_CAP && self.all_one_bit_capable {
            let chunk = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                one_bit: true,
                symbol_list: self.symbols.clone(),
            });
            self.reset();
            return chunk;
        }

        let take = MAX_TWO_BIT_CAP.min(self.symbols.len());
        let chunk = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
            one_bit: false,
            symbol_list: self.symbols[..take].to_vec(),
        });
        let remainder = self.symbols[take..].to_vec();
        self.reset();
        for symbol in remainder {
            self.add(symbol);
        }
        chunk
    }

    fn reset(&mut self) {
        self.symbols.clear();
        self.has_large_delta = false;
        self.all_one_bit_capable = true;
        self.has_different_types = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn based_feedback() -> TransportFeedback {
        let mut fb = TransportFeedback::new(5000, true);
        fb.set_media_ssrc(1234);
        fb.set_base(0, 64_000);
        fb
    }

    #[test]
    fn test_add_received_sequential() {
        let mut fb = based_feedback();

        assert!(fb.add_received_packet(0, 64_000));
        assert_eq!(fb.packet_status_count(), 1);

        assert!(fb.add_received_packet(1, 64_250));
        assert!(fb.add_received_packet(2, 64_500));
        assert_eq!(fb.packet_status_count(), 3);
        assert_eq!(fb.recv_deltas().len(), 3);
    }

    #[test]
    fn test_add_received_with_gap() {
        let mut fb = based_feedback();

        assert!(fb.add_received_packet(0, 64_000));
        assert!(fb.add_received_packet(2, 64_500));

        // 0 received, 1 missing, 2 received.
        assert_eq!(fb.packet_status_count(), 3);
        assert_eq!(fb.recv_deltas().len(), 2);
        let symbols = fb.symbols();
        assert_eq!(symbols[1], SymbolTypeTcc::PacketNotReceived);
    }

    #[test]
    fn test_delta_out_of_range_rejected() {
        let mut fb = based_feedback();
        assert!(fb.add_received_packet(0, 64_000));
        // More than i16::MAX ticks of 250 us.
        assert!(!fb.add_received_packet(1, 64_000 + 33_000 * 250));
        // The failed entry left no trace.
        assert_eq!(fb.packet_status_count(), 1);
    }

    #[test]
    fn test_reordered_sequence_rejected() {
        let mut fb = based_feedback();
        assert!(fb.add_received_packet(5, 64_000));
        assert!(!fb.add_received_packet(3, 64_250));
    }

    #[test]
    fn test_size_budget_exhaustion() {
        let mut fb = based_feedback();
        let mut added = 0u32;
        let mut t = 64_000i64;
        loop {
            // Alternate small and large deltas so chunks stay two-bit.
            let step = if added % 2 == 0 { 300 * 250 } else { 10 * 250 };
            if !fb.add_received_packet((added % 65_536) as u16, t) {
                break;
            }
            added += 1;
            t += step;
        }
        assert!(added > 100);
        // Budget plus at most three bytes of trailing padding.
        assert!(fb.marshal_size() <= MAX_SIZE_BYTES + 3);
    }

    #[test]
    fn test_no_timestamp_mode() {
        let mut fb = TransportFeedback::new(5000, false);
        fb.set_media_ssrc(1234);
        fb.set_base(10, 1_000_000);

        assert!(fb.add_received_packet(10, 1_000_000));
        assert!(fb.add_received_packet(11, 1_010_000));
        assert_eq!(fb.packet_status_count(), 2);
        assert!(fb.recv_deltas().is_empty());
        assert_eq!(
            fb.symbols(),
            vec![
                SymbolTypeTcc::PacketReceivedWithoutDelta,
                SymbolTypeTcc::PacketReceivedWithoutDelta
            ]
        );
    }

    #[test]
    fn test_wraparound_within_packet() {
        let mut fb = TransportFeedback::new(5000, true);
        fb.set_media_ssrc(1234);
        fb.set_base(65_535, 64_000);

        assert!(fb.add_received_packet(65_535, 64_000));
        assert!(fb.add_received_packet(0, 64_250));
        assert!(fb.add_received_packet(1, 64_500));
        assert_eq!(fb.packet_status_count(), 3);
    }

    #[test]
    fn test_run_length_chunk_encoding() {
        let mut chunk = Chunk::new();
        for _ in 0..10 {
            assert!(chunk.can_add(SymbolTypeTcc::PacketReceivedSmallDelta));
            chunk.add(SymbolTypeTcc::PacketReceivedSmallDelta);
        }
        match chunk.encode() {
            PacketStatusChunk::RunLengthChunk(rlc) => {
                assert_eq!(
                    rlc.packet_status_symbol,
                    SymbolTypeTcc::PacketReceivedSmallDelta
                );
                assert_eq!(rlc.run_length, 10);
            }
            other => panic!("expected run length chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_status_vector_chunk_carry() {
        let mut chunk = Chunk::new();
        chunk.add(SymbolTypeTcc::PacketReceivedLargeDelta);
        for _ in 0..7 {
            chunk.add(SymbolTypeTcc::PacketReceivedSmallDelta);
        }
        // Mixed with a large delta: two-bit vector of 7, one carried over.
        match chunk.encode() {
            PacketStatusChunk::StatusVectorChunk(svc) => {
                assert!(!svc.one_bit);
                assert_eq!(svc.symbol_list.len(), 7);
            }
            other => panic!("expected status vector chunk, got {other:?}"),
        }
        assert_eq!(chunk.symbols.len(), 1);
    }

    #[test]
    fn test_marshal_layout() {
        let mut fb = based_feedback();
        assert!(fb.add_received_packet(0, 64_000));
        assert!(fb.add_received_packet(1, 64_250));

        let wire = fb.marshal().unwrap();
        assert_eq!(wire.len() % 4, 0);
        assert_eq!(wire[0] & 0xC0, 0x80); // version 2
        assert_eq!(wire[0] & 0x1F, FORMAT_TCC);
        assert_eq!(wire[1], PACKET_TYPE_RTPFB);
        let words = u16::from_be_bytes([wire[2], wire[3]]);
        assert_eq!((words as usize + 1) * 4, wire.len());
        assert_eq!(u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]), 5000);
        assert_eq!(
            u32::from_be_bytes([wire[8], wire[9], wire[10], wire[11]]),
            1234
        );
        assert_eq!(u16::from_be_bytes([wire[12], wire[13]]), 0); // base seq
        assert_eq!(u16::from_be_bytes([wire[14], wire[15]]), 2); // status count
    }
}
