use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::protocol::frame::SENTINEL_SEQUENCE_NUMBER;

/// Per-session bookkeeping of which sequence numbers were seen, and how often.
///
/// Entries are only ever incremented. A tracker is discarded as a whole when its session is
///  evicted.
pub struct SequenceTracker {
    hits: FxHashMap<u32, u32>,
    last_activity: Instant,
}

impl SequenceTracker {
    pub fn new(now: Instant) -> SequenceTracker {
        SequenceTracker {
            hits: FxHashMap::default(),
            last_activity: now,
        }
    }

    /// Returns the number of times `sequence_number` was seen including this call: 1 for a
    ///  fresh packet, more for a duplicate. The sentinel is returned unchanged without touching
    ///  any state.
    ///
    /// NB: Hit counts saturate one below the sentinel so that a pathological number of
    ///      duplicates can never be mistaken for a control frame
    pub fn count_packet(&mut self, sequence_number: u32, now: Instant) -> u32 {
        if sequence_number == SENTINEL_SEQUENCE_NUMBER {
            return SENTINEL_SEQUENCE_NUMBER;
        }

        self.last_activity = now;

        let hits = self.hits.entry(sequence_number).or_insert(0);
        if *hits < SENTINEL_SEQUENCE_NUMBER - 1 {
            *hits += 1;
        }
        *hits
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[cfg(test)]
    pub fn num_distinct(&self) -> usize {
        self.hits.len()
    }

    /// All sequence numbers in `[0, max_exclusive)` that were never seen, compressed into
    ///  ascending inclusive ranges.
    pub fn missing_ranges(&self, max_exclusive: u32) -> Vec<(u32, u32)> {
        let mut seen = self.hits.keys()
            .copied()
            .filter(|&n| n < max_exclusive)
            .collect::<Vec<_>>();
        seen.sort_unstable();

        let mut result = Vec::new();
        let mut next_expected = 0u32;
        for n in seen {
            if n > next_expected {
                result.push((next_expected, n - 1));
            }
            next_expected = n + 1;
        }
        if next_expected < max_exclusive {
            result.push((next_expected, max_exclusive - 1));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case::once(1)]
    #[case::twice(2)]
    #[case::many(17)]
    fn test_count_packet_repeated(#[case] k: usize) {
        let mut tracker = SequenceTracker::new(Instant::now());

        let mut duplicates = 0;
        for i in 0..k {
            let count = tracker.count_packet(42, Instant::now());
            if i == 0 {
                assert_eq!(count, 1);
            }
            else {
                assert!(count > 1);
                duplicates += 1;
            }
        }
        assert_eq!(duplicates, k - 1);
        assert_eq!(tracker.num_distinct(), 1);
    }

    #[test]
    fn test_count_packet_sentinel_has_no_effect() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::new(start);
        tracker.count_packet(3, start);

        for _ in 0..5 {
            let later = start + Duration::from_secs(10);
            assert_eq!(tracker.count_packet(SENTINEL_SEQUENCE_NUMBER, later), SENTINEL_SEQUENCE_NUMBER);
        }

        assert_eq!(tracker.num_distinct(), 1);
        assert_eq!(tracker.last_activity(), start);
        assert_eq!(tracker.missing_ranges(4), vec![(0, 2)]);
    }

    #[test]
    fn test_count_packet_updates_last_activity() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::new(start);

        let later = start + Duration::from_secs(3);
        tracker.count_packet(0, later);
        assert_eq!(tracker.last_activity(), later);
    }

    #[test]
    fn test_count_packet_independent_sequence_numbers() {
        let mut tracker = SequenceTracker::new(Instant::now());
        assert_eq!(tracker.count_packet(1, Instant::now()), 1);
        assert_eq!(tracker.count_packet(2, Instant::now()), 1);
        assert_eq!(tracker.count_packet(1, Instant::now()), 2);
        assert_eq!(tracker.count_packet(0, Instant::now()), 1);
    }

    #[rstest]
    #[case::gaps(vec![0, 1, 2, 5, 6, 9], 10, vec![(3, 4), (7, 8)])]
    #[case::nothing_seen(vec![], 3, vec![(0, 2)])]
    #[case::all_seen(vec![0, 1, 2], 3, vec![])]
    #[case::unordered_arrival(vec![9, 2, 6, 0, 5, 1], 10, vec![(3, 4), (7, 8)])]
    #[case::leading_gap(vec![3, 4], 5, vec![(0, 2)])]
    #[case::trailing_gap(vec![0], 4, vec![(1, 3)])]
    #[case::single_holes(vec![0, 2, 4], 5, vec![(1, 1), (3, 3)])]
    #[case::beyond_range_ignored(vec![0, 7, 8], 3, vec![(1, 2)])]
    #[case::empty_range(vec![1], 0, vec![])]
    fn test_missing_ranges(#[case] seen: Vec<u32>, #[case] max_exclusive: u32, #[case] expected: Vec<(u32, u32)>) {
        let mut tracker = SequenceTracker::new(Instant::now());
        for n in seen {
            tracker.count_packet(n, Instant::now());
        }
        assert_eq!(tracker.missing_ranges(max_exclusive), expected);
    }

    #[test]
    fn test_missing_ranges_unaffected_by_duplicates() {
        let mut tracker = SequenceTracker::new(Instant::now());
        for n in [1, 1, 1, 3] {
            tracker.count_packet(n, Instant::now());
        }
        assert_eq!(tracker.missing_ranges(4), vec![(0, 0), (2, 2)]);
    }
}
