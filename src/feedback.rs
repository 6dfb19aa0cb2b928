//! Packs a run of recorded arrivals into one transport feedback packet.

use crate::transport_feedback::TransportFeedback;

/// Fill `packet` with arrivals drawn in ascending order from `arrivals`,
/// starting the report at `base_sequence_number` (which may precede the first
/// actually-received sequence). Arrival times are in milliseconds.
///
/// Returns the first sequence number not covered by this packet: the input of
/// the entry that no longer fit, or one past the last entry when everything
/// fit. The caller resumes the next packet from the returned value.
///
/// The iterator must yield at least one entry, and the packet must accept the
/// first one; a packet that cannot hold a single arrival can never make
/// progress.
pub(crate) fn build_feedback_packet(
    feedback_sequence_number: u8,
    media_ssrc: u32,
    base_sequence_number: i64,
    arrivals: impl IntoIterator<Item = (i64, i64)>,
    packet: &mut TransportFeedback,
) -> i64 {
    let mut next_sequence_number = base_sequence_number;
    let mut first = true;
    for (seq, arrival_time_ms) in arrivals {
        if first {
            packet.set_media_ssrc(media_ssrc);
            // The base sequence is the expected first sequence number, which
            // may not have been received; the base time is the arrival of the
            // first packet that was.
            packet.set_base((base_sequence_number & 0xFFFF) as u16, arrival_time_ms * 1000);
            packet.set_feedback_sequence_number(feedback_sequence_number);
        }
        if !packet.add_received_packet((seq & 0xFFFF) as u16, arrival_time_ms * 1000) {
            assert!(
                !first,
                "feedback packet rejected its first arrival (seq {seq})"
            );
            return seq;
        }
        first = false;
        next_sequence_number = seq + 1;
    }
    next_sequence_number
}
