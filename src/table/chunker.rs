//! Chunker trait, dynamic chunk sizing and the low-watermark tracker.
//!
//! Two chunker variants share this interface: the optimistic chunker for
//! single-column auto_increment keys, and the composite chunker for
//! everything else (and for the checksum, which always uses it).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::table::{Chunk, Datum, TableInfo};

/// The initial chunk size before any feedback has arrived.
pub const STARTING_CHUNK_SIZE: u64 = 1000;
/// Maximum growth factor applied per recalculation, to avoid oscillation.
pub const MAX_DYNAMIC_STEP_FACTOR: f64 = 1.5;
/// Lower clamp for the dynamic chunk size.
pub const MIN_CHUNK_SIZE: u64 = 10;
/// Upper clamp for the dynamic chunk size.
pub const MAX_CHUNK_SIZE: u64 = 100_000;
/// A chunk that takes this multiple of the target time triggers an
/// immediate halving instead of waiting for the smoothing window.
pub const DYNAMIC_PANIC_FACTOR: u32 = 5;
/// Default target execution time per chunk.
pub const DEFAULT_TARGET_CHUNK_TIME: Duration = Duration::from_millis(100);

/// Samples collected before the size is recomputed from the p90.
const FEEDBACK_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkerProgress {
    pub rows_read: u64,
    pub chunks_copied: u64,
    pub total_rows_expected: u64,
}

#[async_trait]
pub trait Chunker: Send + Sync {
    /// Start a fresh pass over the key space.
    async fn open(&mut self) -> Result<()>;

    /// Resume from a serialized low watermark. `max_value` is the current
    /// maximum key of the table, used for progress estimation;
    /// `rows_copied` carries the advisory row count from the checkpoint.
    async fn open_at_watermark(
        &mut self,
        watermark: &str,
        max_value: Option<Datum>,
        rows_copied: u64,
    ) -> Result<()>;

    /// True once every chunk has been handed out.
    fn is_read(&self) -> bool;

    /// The next chunk, or `None` once the key space is exhausted.
    async fn next(&mut self) -> Result<Option<Chunk>>;

    /// Report chunk completion and observed timing. Also advances the
    /// low watermark.
    fn feedback(&mut self, chunk: &Chunk, elapsed: Duration, actual_rows: u64);

    /// Conservative test of whether `key` is above everything handed out
    /// so far. False negatives are fine; false positives are not.
    fn key_above_high_watermark(&self, key: &Datum) -> bool;

    fn progress(&self) -> ChunkerProgress;

    /// JSON form of the last contiguously-completed chunk, or `None` if
    /// no chunk has completed yet.
    fn get_low_watermark(&self) -> Result<Option<String>>;

    /// A cheap handle for the replication client to consult without
    /// taking the chunker lock.
    fn high_watermark_handle(&self) -> Arc<HighWatermark>;
}

/// Select the chunker variant for a table: optimistic iff the key is a
/// single auto_increment integer column.
pub fn new_chunker(
    ti: Arc<TableInfo>,
    pool: mysql_async::Pool,
    target: Duration,
) -> Box<dyn Chunker> {
    let target = if target.is_zero() {
        DEFAULT_TARGET_CHUNK_TIME
    } else {
        target
    };
    if ti.key_columns.len() == 1 && ti.key_is_auto_inc {
        Box::new(super::optimistic::OptimisticChunker::new(ti, target))
    } else {
        Box::new(super::composite::CompositeChunker::new(ti, pool, target))
    }
}

/// Always-composite construction, used by the checksum so both sides are
/// walked with index-friendly predicates regardless of the key shape.
pub fn new_composite_chunker(
    ti: Arc<TableInfo>,
    pool: mysql_async::Pool,
    target: Duration,
) -> Box<dyn Chunker> {
    let target = if target.is_zero() {
        DEFAULT_TARGET_CHUNK_TIME
    } else {
        target
    };
    Box::new(super::composite::CompositeChunker::new(ti, pool, target))
}

/// Shared, lock-cheap view of the highest key handed out, consulted by
/// the replication client on every upsert event. `try_lock` keeps the
/// check conservative under contention: if the chunker is mid-update we
/// simply answer "not above".
pub struct HighWatermark {
    highest: Mutex<Option<Datum>>,
    enabled: AtomicBool,
}

impl HighWatermark {
    pub fn new() -> HighWatermark {
        HighWatermark {
            highest: Mutex::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    pub(crate) fn advance(&self, datum: Datum) {
        let mut guard = self.highest.lock().unwrap();
        *guard = Some(datum);
    }

    /// Once the chunker is fully read (or the optimization is switched
    /// off for cutover) every key must be buffered.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_above(&self, key: &Datum) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        match self.highest.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(high) => matches!(
                    key.partial_cmp(high),
                    Some(std::cmp::Ordering::Greater)
                ),
                None => false,
            },
            Err(_) => false,
        }
    }
}

impl Default for HighWatermark {
    fn default() -> Self {
        Self::new()
    }
}

/// Feedback-driven chunk size calculation, shared by both chunker
/// variants and reused (with different clamps) by the replication
/// client's batch sizer.
pub(crate) struct ChunkSizer {
    pub chunk_size: u64,
    target: Duration,
    min_size: u64,
    max_size: u64,
    samples: Vec<Duration>,
}

impl ChunkSizer {
    pub fn new(target: Duration) -> ChunkSizer {
        ChunkSizer::with_bounds(target, STARTING_CHUNK_SIZE, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    /// The replication client reuses the same feedback loop for its
    /// flush batches, with its own starting size and clamps.
    pub fn with_bounds(target: Duration, start: u64, min_size: u64, max_size: u64) -> ChunkSizer {
        ChunkSizer {
            chunk_size: start,
            target,
            min_size,
            max_size,
            samples: Vec::with_capacity(FEEDBACK_WINDOW),
        }
    }

    /// Apply observed timing for a completed chunk of `observed_size`
    /// rows. Stale feedback (from before a resize) is ignored.
    pub fn feedback(&mut self, observed_size: u64, elapsed: Duration) {
        if observed_size != self.chunk_size {
            return;
        }
        if elapsed >= self.target * DYNAMIC_PANIC_FACTOR {
            // Way over target: halve immediately, drop the window.
            self.samples.clear();
            self.chunk_size = self.clamp(self.chunk_size / 2);
            return;
        }
        if elapsed < self.target / 2 {
            // Fast chunks are aggregated so noise does not cause
            // oscillation; only the p90 of a full window recomputes.
            self.samples.push(elapsed);
            if self.samples.len() >= FEEDBACK_WINDOW {
                let p90 = percentile_90(&mut self.samples);
                self.recalculate(p90);
                self.samples.clear();
            }
            return;
        }
        // Between 0.5x and 5x of target: adjust directly.
        self.samples.clear();
        self.recalculate(elapsed);
    }

    fn recalculate(&mut self, observed: Duration) {
        let observed = observed.max(Duration::from_micros(1));
        let ratio = self.target.as_secs_f64() / observed.as_secs_f64();
        let capped = ratio.min(MAX_DYNAMIC_STEP_FACTOR);
        let new_size = (self.chunk_size as f64 * capped) as u64;
        self.chunk_size = self.clamp(new_size);
    }

    fn clamp(&self, size: u64) -> u64 {
        size.clamp(self.min_size, self.max_size)
    }
}

fn percentile_90(samples: &mut [Duration]) -> Duration {
    samples.sort_unstable();
    let idx = (samples.len() as f64 * 0.9).ceil() as usize;
    samples[idx.saturating_sub(1).min(samples.len() - 1)]
}

/// Tracks the low watermark: the last chunk such that every earlier
/// chunk has reported completion. Workers complete chunks out of order,
/// so completions whose predecessor is still outstanding park in a
/// pending map keyed by their canonical lower bound.
pub(crate) struct WatermarkTracker {
    watermark: Option<Chunk>,
    pending: HashMap<String, Chunk>,
}

impl WatermarkTracker {
    pub fn new() -> WatermarkTracker {
        WatermarkTracker {
            watermark: None,
            pending: HashMap::new(),
        }
    }

    pub fn record_completion(&mut self, chunk: Chunk) {
        self.pending
            .insert(chunk.canonical_lower_bound(), chunk);
        // The first chunk (open lower bound) seeds the watermark.
        if self.watermark.is_none() {
            if let Some(first) = self.pending.remove("-inf") {
                self.watermark = Some(first);
            }
        }
        // Advance across every contiguous completion.
        while let Some(current) = &self.watermark {
            let next_key = current.canonical_upper_bound();
            match self.pending.remove(&next_key) {
                Some(next) => self.watermark = Some(next),
                None => break,
            }
        }
    }

    /// Seed the tracker after a resume so contiguity is measured from
    /// the restored position.
    pub fn restore(&mut self, watermark: Chunk) {
        self.watermark = Some(watermark);
        self.pending.clear();
    }

    pub fn watermark(&self) -> Option<&Chunk> {
        self.watermark.as_ref()
    }

    /// Serialized watermark carrying the chunker's current size so a
    /// resume starts from a warmed-up chunk size.
    pub fn serialize(&self, current_chunk_size: u64) -> Result<Option<String>> {
        match &self.watermark {
            None => Ok(None),
            Some(chunk) => {
                let mut chunk = chunk.clone();
                chunk.chunk_size = current_chunk_size;
                Ok(Some(chunk.as_json()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Boundary;

    fn chunk(lower: Option<u64>, upper: Option<u64>) -> Chunk {
        Chunk {
            key: vec!["id".to_string()],
            chunk_size: 1000,
            lower_bound: lower.map(|v| Boundary {
                values: vec![Datum::Unsigned(v)],
                inclusive: true,
            }),
            upper_bound: upper.map(|v| Boundary {
                values: vec![Datum::Unsigned(v)],
                inclusive: false,
            }),
        }
    }

    #[test]
    fn test_sizer_growth_is_capped() {
        let mut sizer = ChunkSizer::new(Duration::from_millis(100));
        // Ten fast samples trigger one p90 recalculation.
        for _ in 0..10 {
            sizer.feedback(sizer.chunk_size, Duration::from_millis(1));
        }
        assert_eq!(sizer.chunk_size, 1500); // 1000 * 1.5 cap
    }

    #[test]
    fn test_sizer_panic_factor_halves() {
        let mut sizer = ChunkSizer::new(Duration::from_millis(100));
        sizer.feedback(sizer.chunk_size, Duration::from_millis(500));
        assert_eq!(sizer.chunk_size, 500);
        sizer.feedback(sizer.chunk_size, Duration::from_secs(10));
        assert_eq!(sizer.chunk_size, 250);
    }

    #[test]
    fn test_sizer_bounds() {
        let mut sizer = ChunkSizer::new(Duration::from_millis(100));
        // Drive it down.
        for _ in 0..40 {
            sizer.feedback(sizer.chunk_size, Duration::from_secs(60));
            assert!(sizer.chunk_size >= MIN_CHUNK_SIZE);
        }
        assert_eq!(sizer.chunk_size, MIN_CHUNK_SIZE);
        // Drive it up.
        let mut prev = sizer.chunk_size;
        for _ in 0..400 {
            sizer.feedback(sizer.chunk_size, Duration::from_micros(10));
            assert!(sizer.chunk_size <= MAX_CHUNK_SIZE);
            // Consecutive ratio stays within the step factor.
            assert!(sizer.chunk_size as f64 <= prev as f64 * MAX_DYNAMIC_STEP_FACTOR + 1.0);
            prev = sizer.chunk_size;
        }
        assert_eq!(sizer.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_sizer_ignores_stale_feedback() {
        let mut sizer = ChunkSizer::new(Duration::from_millis(100));
        sizer.feedback(999, Duration::from_secs(60));
        assert_eq!(sizer.chunk_size, STARTING_CHUNK_SIZE);
    }

    #[test]
    fn test_sizer_direct_adjustment_shrinks() {
        let mut sizer = ChunkSizer::new(Duration::from_millis(100));
        // 2x target: direct shrink to ~half.
        sizer.feedback(sizer.chunk_size, Duration::from_millis(200));
        assert_eq!(sizer.chunk_size, 500);
    }

    #[test]
    fn test_watermark_in_order() {
        let mut wt = WatermarkTracker::new();
        wt.record_completion(chunk(None, Some(10)));
        assert_eq!(wt.watermark(), Some(&chunk(None, Some(10))));
        wt.record_completion(chunk(Some(10), Some(20)));
        assert_eq!(wt.watermark(), Some(&chunk(Some(10), Some(20))));
    }

    #[test]
    fn test_watermark_out_of_order_completion() {
        let mut wt = WatermarkTracker::new();
        // Chunks 3 and 2 complete before chunk 1.
        wt.record_completion(chunk(Some(20), Some(30)));
        wt.record_completion(chunk(Some(10), Some(20)));
        assert!(wt.watermark().is_none());
        // Completing the first chunk drains the whole pending map.
        wt.record_completion(chunk(None, Some(10)));
        assert_eq!(wt.watermark(), Some(&chunk(Some(20), Some(30))));
    }

    #[test]
    fn test_watermark_monotonic() {
        let mut wt = WatermarkTracker::new();
        let mut last: Option<u64> = None;
        for (lo, hi) in [(None, Some(10)), (Some(10), Some(20)), (Some(20), Some(30))] {
            wt.record_completion(chunk(lo, hi));
            let current = wt
                .watermark()
                .and_then(|c| c.upper_bound.as_ref())
                .and_then(|b| b.values[0].as_u64());
            if let (Some(prev), Some(cur)) = (last, current) {
                assert!(cur >= prev);
            }
            last = current;
        }
    }

    #[test]
    fn test_watermark_serialize_carries_current_size() {
        let mut wt = WatermarkTracker::new();
        wt.record_completion(chunk(None, Some(10)));
        let json = wt.serialize(4242).unwrap().unwrap();
        let restored = Chunk::from_json(&json).unwrap();
        assert_eq!(restored.chunk_size, 4242);
    }

    #[test]
    fn test_high_watermark_handle() {
        let hw = HighWatermark::new();
        // Nothing handed out yet: never above.
        assert!(!hw.is_above(&Datum::Unsigned(5)));
        hw.advance(Datum::Unsigned(100));
        assert!(hw.is_above(&Datum::Unsigned(101)));
        assert!(!hw.is_above(&Datum::Unsigned(100)));
        assert!(!hw.is_above(&Datum::Unsigned(99)));
        hw.disable();
        assert!(!hw.is_above(&Datum::Unsigned(101)));
    }
}
