//! Bounded ordered map of packet arrival times.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Feedback cannot reference sequence numbers further back than what the
/// 15-bit wire window can represent.
pub const MAX_NUMBER_OF_PACKETS: i64 = 1 << 15;

/// Ordered mapping of unwrapped transport sequence number to arrival time in
/// milliseconds.
///
/// The map keeps the first-observed arrival time for every sequence number
/// (retransmits never overwrite it) and never spans more than 2^15 sequence
/// numbers.
#[derive(Default)]
pub struct ArrivalTimeMap {
    arrival_times: BTreeMap<i64, i64>,
}

impl ArrivalTimeMap {
    pub fn new() -> Self {
        Self {
            arrival_times: BTreeMap::new(),
        }
    }

    /// Whether an arrival has been recorded for `sequence_number`.
    pub fn has_received(&self, sequence_number: i64) -> bool {
        self.arrival_times.contains_key(&sequence_number)
    }

    /// Record an arrival. The first recorded time for a sequence number wins.
    pub fn add_packet(&mut self, sequence_number: i64, arrival_time_ms: i64) {
        self.arrival_times
            .entry(sequence_number)
            .or_insert(arrival_time_ms);
    }

    pub fn is_empty(&self) -> bool {
        self.arrival_times.is_empty()
    }

    pub fn len(&self) -> usize {
        self.arrival_times.len()
    }

    pub fn min_sequence_number(&self) -> Option<i64> {
        self.arrival_times.keys().next().copied()
    }

    pub fn max_sequence_number(&self) -> Option<i64> {
        self.arrival_times.keys().next_back().copied()
    }

    /// Whether any entry exists at or after `sequence_number`.
    pub fn has_at_or_after(&self, sequence_number: i64) -> bool {
        self.arrival_times.range(sequence_number..).next().is_some()
    }

    /// The first entry at or after `sequence_number`.
    pub fn first_at_or_after(&self, sequence_number: i64) -> Option<(i64, i64)> {
        self.arrival_times
            .range(sequence_number..)
            .next()
            .map(|(&seq, &arrival)| (seq, arrival))
    }

    /// Iterate entries in ascending order starting at `sequence_number`.
    pub fn iter_from(&self, sequence_number: i64) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.arrival_times
            .range(sequence_number..)
            .map(|(&seq, &arrival)| (seq, arrival))
    }

    /// Iterate entries in ascending order over an inclusive range.
    pub fn iter_range(&self, range: RangeInclusive<i64>) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.arrival_times
            .range(range)
            .map(|(&seq, &arrival)| (seq, arrival))
    }

    /// Remove entries from the front as long as they precede `sequence_number`
    /// and arrived no later than `arrival_time_limit`.
    pub fn remove_old_packets(&mut self, sequence_number: i64, arrival_time_limit: i64) {
        while let Some((&seq, &arrival)) = self.arrival_times.first_key_value() {
            if seq < sequence_number && arrival <= arrival_time_limit {
                self.arrival_times.pop_first();
            } else {
                break;
            }
        }
    }

    /// Remove all entries with keys strictly below `sequence_number`.
    pub fn erase_before(&mut self, sequence_number: i64) {
        self.arrival_times = self.arrival_times.split_off(&sequence_number);
    }

    /// Enforce the 2^15 span bound: drop entries too old for the newest key
    /// to reference. Returns true when anything was removed.
    pub fn trim_span(&mut self) -> bool {
        let Some(max) = self.max_sequence_number() else {
            return false;
        };
        let first_to_keep = max - MAX_NUMBER_OF_PACKETS + 1;
        if self.min_sequence_number().is_some_and(|min| min < first_to_keep) {
            self.erase_before(first_to_keep);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_arrival_wins() {
        let mut map = ArrivalTimeMap::new();
        map.add_packet(10, 1000);
        map.add_packet(10, 2000);
        assert_eq!(map.first_at_or_after(10), Some((10, 1000)));
    }

    #[test]
    fn test_ordered_iteration() {
        let mut map = ArrivalTimeMap::new();
        map.add_packet(5, 50);
        map.add_packet(3, 30);
        map.add_packet(7, 70);

        let entries: Vec<_> = map.iter_from(0).collect();
        assert_eq!(entries, vec![(3, 30), (5, 50), (7, 70)]);

        let entries: Vec<_> = map.iter_from(4).collect();
        assert_eq!(entries, vec![(5, 50), (7, 70)]);
    }

    #[test]
    fn test_has_at_or_after() {
        let mut map = ArrivalTimeMap::new();
        map.add_packet(10, 1000);
        assert!(map.has_at_or_after(10));
        assert!(map.has_at_or_after(5));
        assert!(!map.has_at_or_after(11));
    }

    #[test]
    fn test_remove_old_packets() {
        let mut map = ArrivalTimeMap::new();
        for i in 0..10 {
            map.add_packet(i, i * 100);
        }

        // Entries before seq 7 that arrived at or before t=500 go away.
        map.remove_old_packets(7, 500);
        assert_eq!(map.min_sequence_number(), Some(6));

        // Entries at or past the sequence bound stay regardless of age.
        map.remove_old_packets(7, 10_000);
        assert_eq!(map.min_sequence_number(), Some(7));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_remove_old_packets_stops_at_young_entry() {
        let mut map = ArrivalTimeMap::new();
        map.add_packet(1, 100);
        map.add_packet(2, 900);
        map.add_packet(3, 150);

        map.remove_old_packets(10, 500);
        // Seq 2 arrived late, so culling stops there even though seq 3 is old.
        assert_eq!(map.min_sequence_number(), Some(2));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_erase_before() {
        let mut map = ArrivalTimeMap::new();
        for i in 100..110 {
            map.add_packet(i, i);
        }
        map.erase_before(104);
        assert_eq!(map.min_sequence_number(), Some(104));
        assert_eq!(map.max_sequence_number(), Some(109));
    }

    #[test]
    fn test_trim_span_bound() {
        let mut map = ArrivalTimeMap::new();
        for i in 0..40_000 {
            map.add_packet(i, i);
            map.trim_span();
        }
        let min = map.min_sequence_number().unwrap();
        let max = map.max_sequence_number().unwrap();
        assert_eq!(max, 39_999);
        assert!(min > 39_999 - MAX_NUMBER_OF_PACKETS);
        assert!(max - min < MAX_NUMBER_OF_PACKETS);
        assert!(map.len() <= MAX_NUMBER_OF_PACKETS as usize);
    }
}
