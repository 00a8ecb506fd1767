//! Sliding-window bandwidth accounting for one speaker.

use std::time::Instant;

/// Number of per-datagram slots in the ring.
const SLOTS: usize = 128;

/// Byte-rate meter over the last [`SLOTS`] datagrams.
///
/// Each recorded datagram overwrites the oldest slot and keeps a running
/// sum, so both `record` and `bytes_per_second` are O(1). The rate divides
/// the sum by the span from the oldest live slot to now; with a single
/// sample there is no span yet and the rate reads as zero, so a stream's
/// first datagram is never gated.
pub struct BandwidthMeter {
    bytes: [u32; SLOTS],
    when: [Option<Instant>; SLOTS],
    cursor: usize,
    sum: u64,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self {
            bytes: [0; SLOTS],
            when: [None; SLOTS],
            cursor: 0,
            sum: 0,
        }
    }

    /// Record one datagram of `size` bytes observed at `now`.
    pub fn record(&mut self, size: u32, now: Instant) {
        self.sum -= u64::from(self.bytes[self.cursor]);
        self.bytes[self.cursor] = size;
        self.when[self.cursor] = Some(now);
        self.sum += u64::from(size);
        self.cursor = (self.cursor + 1) % SLOTS;
    }

    /// Current estimate in bytes per second.
    pub fn bytes_per_second(&self, now: Instant) -> u64 {
        // Once the ring has wrapped, the slot at the cursor is the oldest;
        // before that the first slot is.
        let oldest = match self.when[self.cursor].or(self.when[0]) {
            Some(instant) => instant,
            None => return 0,
        };
        let span = now.saturating_duration_since(oldest);
        if span.is_zero() {
            return 0;
        }
        self.sum * 1_000_000 / span.as_micros().max(1) as u64
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}
