use serde::Serialize;

/// Counts carried by one sub-interval bucket and, summed, by a whole window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub packets: u64,
    pub bytes: u64,
    pub syn_packets: u64,
    pub dns_queries: u64,
}

impl Counts {
    fn add(&mut self, other: &Counts) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.syn_packets += other.syn_packets;
        self.dns_queries += other.dns_queries;
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Absolute slot index this bucket last counted for. Stale slots are
    /// zeroed lazily when the ring advances over them.
    slot: u64,
    counts: Counts,
}

/// Rolling counter over a fixed trailing duration, implemented as a ring of
/// sub-interval buckets. `record` increments the bucket covering the event
/// timestamp; buckets older than the window age out to zero the next time
/// the ring rotates over them, so aging is O(1) amortized and never scans
/// history. Counts never go negative and the sum of live buckets always
/// equals the window total.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    bucket_width_ms: u64,
    buckets: Vec<Bucket>,
    /// Highest slot ever recorded; the retained range is
    /// `[head_slot + 1 - len, head_slot]`.
    head_slot: u64,
}

impl WindowCounter {
    /// `window_ms` split into `bucket_count` equal sub-intervals. Widths are
    /// rounded up so the ring always covers at least the requested window.
    pub fn new(window_ms: u64, bucket_count: usize) -> Self {
        assert!(window_ms > 0 && bucket_count > 0);
        let bucket_width_ms = window_ms.div_ceil(bucket_count as u64).max(1);
        Self {
            bucket_width_ms,
            buckets: vec![Bucket::default(); bucket_count],
            head_slot: 0,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.bucket_width_ms * self.buckets.len() as u64
    }

    fn slot_of(&self, ts_ms: u64) -> u64 {
        ts_ms / self.bucket_width_ms
    }

    fn oldest_retained(&self) -> u64 {
        let len = self.buckets.len() as u64;
        self.head_slot.saturating_sub(len - 1)
    }

    /// Count one packet into the bucket covering `ts_ms`. Events older than
    /// the retained window (capture clock skew) are clamped into the oldest
    /// retained bucket rather than rejected.
    pub fn record(&mut self, ts_ms: u64, counts: Counts) {
        let slot = self.slot_of(ts_ms);
        if slot > self.head_slot {
            self.advance_to(slot);
        }
        let slot = slot.max(self.oldest_retained());

        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(slot % len) as usize];
        if bucket.slot != slot {
            // Ring wrapped over a slot nothing was recorded into since.
            bucket.counts = Counts::default();
            bucket.slot = slot;
        }
        bucket.counts.add(&counts);
    }

    fn advance_to(&mut self, slot: u64) {
        // Buckets between the old and new head are stale; they are zeroed
        // on demand in `record`/`total` via the per-bucket slot tag, so the
        // advance itself is constant time regardless of the gap.
        self.head_slot = slot;
    }

    /// Total over the trailing window ending at `now_ms`. Buckets outside
    /// `(now_slot - len, now_slot]` are skipped, which is how aged-out
    /// counts disappear without ever being scanned for expiry.
    pub fn total(&self, now_ms: u64) -> Counts {
        let now_slot = self.slot_of(now_ms);
        let len = self.buckets.len() as u64;
        let floor = now_slot.saturating_sub(len - 1);

        let mut sum = Counts::default();
        for bucket in &self.buckets {
            if bucket.slot >= floor && bucket.slot <= now_slot {
                sum.add(&bucket.counts);
            }
        }
        sum
    }

    /// True when nothing in the ring could still fall inside a window
    /// ending at or after `now_ms`; counts newer than `now_ms` keep the
    /// counter alive.
    pub fn is_idle(&self, now_ms: u64) -> bool {
        let now_slot = self.slot_of(now_ms);
        let len = self.buckets.len() as u64;
        let floor = now_slot.saturating_sub(len - 1);
        self.buckets
            .iter()
            .all(|b| b.counts.is_empty() || b.slot < floor)
    }

    /// Packets per second over the window ending at `now_ms`.
    pub fn rate(&self, now_ms: u64) -> f64 {
        let total = self.total(now_ms);
        total.packets as f64 * 1_000.0 / self.window_ms() as f64
    }
}
