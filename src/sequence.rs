//! Sequence number and send-time unwrapping for received media packets.

/// Lifts 16-bit wrapping transport sequence numbers to monotonic 64-bit values.
pub struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    /// Unwrap a 16-bit sequence number.
    ///
    /// The first call zero-extends the input. Later calls pick the 64-bit
    /// value congruent to the input mod 2^16 that is closest to the last
    /// returned value, ties broken toward the larger value.
    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = match self.last_unwrapped {
            None => seq as i64,
            Some(last) => {
                let mut diff = seq as i64 - (last & 0xFFFF);
                if diff <= -(1 << 15) {
                    diff += 1 << 16;
                } else if diff > 1 << 15 {
                    diff -= 1 << 16;
                }
                last + diff
            }
        };
        self.last_unwrapped = Some(unwrapped);
        unwrapped
    }
}

impl Default for SequenceUnwrapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts the 24-bit 6.18 fixed-point absolute send time to milliseconds,
/// counting wrap cycles of the 24-bit field (one cycle = 64 seconds).
pub struct AbsSendTimeTracker {
    /// -1 until the first sample is observed.
    cycles: i32,
    max_abs_send_time: u32,
}

impl AbsSendTimeTracker {
    pub fn new() -> Self {
        Self {
            cycles: -1,
            max_abs_send_time: 0,
        }
    }

    /// Convert a 24-bit absolute send time field to a millisecond timestamp.
    ///
    /// Out-of-order send times (older than the maximum observed) do not move
    /// the tracker state; they are converted against the current cycle count.
    pub fn to_millis(&mut self, abs_send_time: u32) -> u32 {
        if self.cycles == -1 {
            self.max_abs_send_time = abs_send_time;
            self.cycles = 0;
        }
        // Shift by 8 to normalize the 24-bit field to 32 bits, then compare
        // as signed 32-bit so the 24-bit wrap falls out of natural overflow.
        let delta = abs_send_time
            .wrapping_shl(8)
            .wrapping_sub(self.max_abs_send_time.wrapping_shl(8)) as i32;
        if delta >= 0 {
            if abs_send_time < self.max_abs_send_time {
                // Wrap detected.
                self.cycles += 1;
            }
            self.max_abs_send_time = abs_send_time;
        }
        // 6.18 fixed point: divide by 2^18 for seconds, cycles add 64 s each.
        let send_time_seconds = abs_send_time as f64 / 262_144.0 + 64.0 * self.cycles as f64;
        (send_time_seconds * 1000.0).round() as u32
    }
}

impl Default for AbsSendTimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_unwrapper() {
        let mut unwrapper = SequenceUnwrapper::new();

        assert_eq!(unwrapper.unwrap(0), 0);
        assert_eq!(unwrapper.unwrap(1), 1);
        assert_eq!(unwrapper.unwrap(100), 100);

        // Wraparound
        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(65534), 65534);
        assert_eq!(unwrapper.unwrap(65535), 65535);
        assert_eq!(unwrapper.unwrap(0), 65536);
        assert_eq!(unwrapper.unwrap(1), 65537);
    }

    #[test]
    fn test_sequence_unwrapper_backwards() {
        let mut unwrapper = SequenceUnwrapper::new();

        assert_eq!(unwrapper.unwrap(10), 10);
        assert_eq!(unwrapper.unwrap(5), 5);

        // A reordered packet from before a wrap goes negative.
        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(2), 2);
        assert_eq!(unwrapper.unwrap(65535), -1);
        assert_eq!(unwrapper.unwrap(3), 3);
    }

    #[test]
    fn test_sequence_unwrapper_tie_prefers_larger() {
        let mut unwrapper = SequenceUnwrapper::new();
        assert_eq!(unwrapper.unwrap(0), 0);
        // A raw delta of exactly 2^15 is ambiguous; the larger value wins.
        assert_eq!(unwrapper.unwrap(0x8000), 0x8000);
        assert_eq!(unwrapper.unwrap(0), 0x10000);
    }

    #[test]
    fn test_sequence_unwrapper_monotone_within_window() {
        let mut unwrapper = SequenceUnwrapper::new();
        let mut expected = 0i64;
        unwrapper.unwrap(0);
        for step in [1i64, 100, 32768, 7, 32000] {
            expected += step;
            assert_eq!(unwrapper.unwrap((expected & 0xFFFF) as u16), expected);
        }
    }

    #[test]
    fn test_abs_send_time_first_sample() {
        let mut tracker = AbsSendTimeTracker::new();
        // 1.0 second in 6.18 fixed point.
        assert_eq!(tracker.to_millis(262_144), 1000);
    }

    #[test]
    fn test_abs_send_time_wrap() {
        let mut tracker = AbsSendTimeTracker::new();
        // 63.75 s, close to the top of the 64 s range.
        assert_eq!(tracker.to_millis(0xFF_0000), 63_750);
        // Wrapped: a small value after the maximum advances one cycle.
        assert_eq!(tracker.to_millis(256), 64_001);
    }

    #[test]
    fn test_abs_send_time_out_of_order() {
        let mut tracker = AbsSendTimeTracker::new();
        assert_eq!(tracker.to_millis(262_144), 1000);
        // Older send time: state unchanged, converted with current cycles.
        assert_eq!(tracker.to_millis(131_072), 500);
        // The maximum is still 1.0 s, so 2.0 s is a forward delta.
        assert_eq!(tracker.to_millis(524_288), 2000);
    }

    #[test]
    fn test_abs_send_time_monotone_over_wraps() {
        let mut tracker = AbsSendTimeTracker::new();
        let mut last_ms = 0;
        let mut t = 0u32;
        for _ in 0..100 {
            t = (t + 400_000) & 0xFF_FFFF;
            let ms = tracker.to_millis(t);
            assert!(ms >= last_ms);
            last_ms = ms;
        }
    }
}
