//! Optimistic chunker for single-column auto_increment keys.
//!
//! Advances a cursor through the key space by `chunk_size` values without
//! querying the table, relying on feedback to correct for gaps in the
//! sequence. The first chunk is upper-bound-only and the final chunk is
//! lower-bound-only so the full key range (including anything inserted
//! while copying) is covered exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::table::chunker::{
    ChunkSizer, Chunker, ChunkerProgress, HighWatermark, WatermarkTracker,
};
use crate::table::{Boundary, Chunk, Datum, TableInfo};

pub struct OptimisticChunker {
    ti: Arc<TableInfo>,
    sizer: ChunkSizer,
    tracker: WatermarkTracker,
    high_watermark: Arc<HighWatermark>,

    /// Lower bound of the next chunk. `None` until the first chunk has
    /// been handed out.
    chunk_ptr: Option<Datum>,
    is_open: bool,
    done: bool,
    rows_read: u64,
    chunks_completed: u64,
}

impl OptimisticChunker {
    pub fn new(ti: Arc<TableInfo>, target: Duration) -> OptimisticChunker {
        OptimisticChunker {
            ti,
            sizer: ChunkSizer::new(target),
            tracker: WatermarkTracker::new(),
            high_watermark: Arc::new(HighWatermark::new()),
            chunk_ptr: None,
            is_open: false,
            done: false,
            rows_read: 0,
            chunks_completed: 0,
        }
    }

    fn key(&self) -> Vec<String> {
        self.ti.key_columns.clone()
    }

    fn final_chunk(&mut self, lower: Option<Datum>) -> Chunk {
        self.done = true;
        // Everything is now handed out; "above the high watermark" no
        // longer exists.
        self.high_watermark.disable();
        Chunk {
            key: self.key(),
            chunk_size: self.sizer.chunk_size,
            lower_bound: lower.map(|d| Boundary {
                values: vec![d],
                inclusive: true,
            }),
            upper_bound: None,
        }
    }
}

#[async_trait]
impl Chunker for OptimisticChunker {
    async fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Err(Error::Other("chunker is already open".into()));
        }
        self.is_open = true;
        Ok(())
    }

    async fn open_at_watermark(
        &mut self,
        watermark: &str,
        _max_value: Option<Datum>,
        rows_copied: u64,
    ) -> Result<()> {
        if self.is_open {
            return Err(Error::Other("chunker is already open".into()));
        }
        let chunk = Chunk::from_json(watermark)?;
        match &chunk.upper_bound {
            Some(upper) => {
                let resume_at = upper.values[0].clone();
                self.high_watermark.advance(resume_at.clone());
                self.chunk_ptr = Some(resume_at);
            }
            // The watermark chunk was the final chunk; nothing remains.
            None => self.done = true,
        }
        self.tracker.restore(chunk);
        self.rows_read = rows_copied;
        self.is_open = true;
        Ok(())
    }

    fn is_read(&self) -> bool {
        self.done
    }

    async fn next(&mut self) -> Result<Option<Chunk>> {
        if !self.is_open {
            return Err(Error::Other("chunker is not open".into()));
        }
        if self.done {
            return Ok(None);
        }
        let size = self.sizer.chunk_size;

        let lower = match self.chunk_ptr.clone() {
            None => {
                // Fresh start: anchor at the current minimum key.
                let min = match self.ti.min_value() {
                    Some(min) => min,
                    None => {
                        // Empty table: nothing to copy.
                        self.done = true;
                        self.high_watermark.disable();
                        return Ok(None);
                    }
                };
                match min.checked_add(size) {
                    Some(upper) => {
                        self.chunk_ptr = Some(upper.clone());
                        self.high_watermark.advance(upper.clone());
                        return Ok(Some(Chunk {
                            key: self.key(),
                            chunk_size: size,
                            lower_bound: None,
                            upper_bound: Some(Boundary {
                                values: vec![upper],
                                inclusive: false,
                            }),
                        }));
                    }
                    // min is already at the top of the key space.
                    None => return Ok(Some(self.final_chunk(None))),
                }
            }
            Some(ptr) => ptr,
        };

        // Past the observed maximum: one closed final chunk picks up the
        // tail, including rows inserted since the stats snapshot.
        if let Some(max) = self.ti.max_value() {
            if matches!(
                lower.partial_cmp(&max),
                Some(std::cmp::Ordering::Greater)
            ) {
                return Ok(Some(self.final_chunk(Some(lower))));
            }
        }
        match lower.checked_add(size) {
            Some(upper) => {
                self.chunk_ptr = Some(upper.clone());
                self.high_watermark.advance(upper.clone());
                Ok(Some(Chunk {
                    key: self.key(),
                    chunk_size: size,
                    lower_bound: Some(Boundary {
                        values: vec![lower],
                        inclusive: true,
                    }),
                    upper_bound: Some(Boundary {
                        values: vec![upper],
                        inclusive: false,
                    }),
                }))
            }
            // Integer key space exhausted at MAX_UINT64 / MAX_INT64.
            None => Ok(Some(self.final_chunk(Some(lower)))),
        }
    }

    fn feedback(&mut self, chunk: &Chunk, elapsed: Duration, actual_rows: u64) {
        self.sizer.feedback(chunk.chunk_size, elapsed);
        self.rows_read += actual_rows;
        self.chunks_completed += 1;
        self.tracker.record_completion(chunk.clone());
    }

    fn key_above_high_watermark(&self, key: &Datum) -> bool {
        self.high_watermark.is_above(key)
    }

    fn progress(&self) -> ChunkerProgress {
        ChunkerProgress {
            rows_read: self.rows_read,
            chunks_copied: self.chunks_completed,
            total_rows_expected: self.ti.estimated_rows().max(self.rows_read),
        }
    }

    fn get_low_watermark(&self) -> Result<Option<String>> {
        self.tracker.serialize(self.sizer.chunk_size)
    }

    fn high_watermark_handle(&self) -> Arc<HighWatermark> {
        Arc::clone(&self.high_watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::DatumType;

    fn test_table(min: u64, max: u64, rows: u64) -> Arc<TableInfo> {
        let mut ti = TableInfo::new("test", "t1");
        ti.columns = vec!["id".into(), "b".into()];
        ti.non_generated_columns = ti.columns.clone();
        ti.key_columns = vec!["id".into()];
        ti.key_column_types = vec![DatumType::Unsigned];
        ti.key_column_indexes = vec![0];
        ti.key_is_auto_inc = true;
        ti.set_statistics_for_test(Some(Datum::Unsigned(min)), Some(Datum::Unsigned(max)), rows);
        Arc::new(ti)
    }

    fn empty_table() -> Arc<TableInfo> {
        let mut ti = TableInfo::new("test", "t1");
        ti.key_columns = vec!["id".into()];
        ti.key_column_types = vec![DatumType::Unsigned];
        ti.key_column_indexes = vec![0];
        ti.key_is_auto_inc = true;
        Arc::new(ti)
    }

    #[tokio::test]
    async fn test_chunk_sequence() {
        let ti = test_table(1, 2500, 2500);
        let mut c = OptimisticChunker::new(ti, Duration::from_millis(100));
        c.open().await.unwrap();

        let c1 = c.next().await.unwrap().unwrap();
        assert_eq!(c1.to_predicate(), "`id` < 1001");
        let c2 = c.next().await.unwrap().unwrap();
        assert_eq!(c2.to_predicate(), "`id` >= 1001 AND `id` < 2001");
        let c3 = c.next().await.unwrap().unwrap();
        assert_eq!(c3.to_predicate(), "`id` >= 2001 AND `id` < 3001");
        // Cursor is now above max: the final chunk closes the range.
        let c4 = c.next().await.unwrap().unwrap();
        assert_eq!(c4.to_predicate(), "`id` >= 3001");
        assert!(c.is_read());
        assert!(c.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_table_is_done_immediately() {
        let mut c = OptimisticChunker::new(empty_table(), Duration::from_millis(100));
        c.open().await.unwrap();
        assert!(c.next().await.unwrap().is_none());
        assert!(c.is_read());
    }

    #[tokio::test]
    async fn test_single_row_table() {
        let ti = test_table(5, 5, 1);
        let mut c = OptimisticChunker::new(ti, Duration::from_millis(100));
        c.open().await.unwrap();
        let c1 = c.next().await.unwrap().unwrap();
        assert_eq!(c1.to_predicate(), "`id` < 1005");
        let c2 = c.next().await.unwrap().unwrap();
        assert_eq!(c2.to_predicate(), "`id` >= 1005");
        assert!(c.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_at_max_uint64_no_overflow() {
        let ti = test_table(u64::MAX - 100, u64::MAX, 100);
        let mut c = OptimisticChunker::new(ti, Duration::from_millis(100));
        c.open().await.unwrap();
        // min + 1000 overflows: the very first chunk is the final chunk.
        let c1 = c.next().await.unwrap().unwrap();
        assert_eq!(c1.upper_bound, None);
        assert!(c.is_read());
    }

    #[tokio::test]
    async fn test_high_watermark_tracking() {
        let ti = test_table(1, 10_000, 10_000);
        let mut c = OptimisticChunker::new(ti, Duration::from_millis(100));
        c.open().await.unwrap();
        let _ = c.next().await.unwrap().unwrap();
        // Handed out up to 1001; higher keys can be skipped by the
        // replication client.
        assert!(c.key_above_high_watermark(&Datum::Unsigned(5000)));
        assert!(!c.key_above_high_watermark(&Datum::Unsigned(500)));
    }

    /// A restored chunker continues with the same remaining chunk
    /// sequence the original would have produced.
    #[tokio::test]
    async fn test_open_at_watermark_roundtrip() {
        let ti = test_table(1, 5000, 5000);
        let mut original = OptimisticChunker::new(Arc::clone(&ti), Duration::from_millis(100));
        original.open().await.unwrap();
        let c1 = original.next().await.unwrap().unwrap();
        let c2 = original.next().await.unwrap().unwrap();
        original.feedback(&c1, Duration::from_millis(100), 1000);
        original.feedback(&c2, Duration::from_millis(100), 1000);
        let watermark = original.get_low_watermark().unwrap().unwrap();

        let mut restored = OptimisticChunker::new(Arc::clone(&ti), Duration::from_millis(100));
        restored
            .open_at_watermark(&watermark, ti.max_value(), 2000)
            .await
            .unwrap();

        let expected = original.next().await.unwrap().unwrap();
        let got = restored.next().await.unwrap().unwrap();
        assert_eq!(expected.to_predicate(), got.to_predicate());
        assert_eq!(restored.progress().rows_read, 2000);
    }

    #[tokio::test]
    async fn test_feedback_advances_low_watermark() {
        let ti = test_table(1, 5000, 5000);
        let mut c = OptimisticChunker::new(ti, Duration::from_millis(100));
        c.open().await.unwrap();
        assert!(c.get_low_watermark().unwrap().is_none());
        let c1 = c.next().await.unwrap().unwrap();
        let c2 = c.next().await.unwrap().unwrap();
        // Out-of-order completion parks in the pending map.
        c.feedback(&c2, Duration::from_millis(50), 1000);
        assert!(c.get_low_watermark().unwrap().is_none());
        c.feedback(&c1, Duration::from_millis(50), 1000);
        let wm = Chunk::from_json(&c.get_low_watermark().unwrap().unwrap()).unwrap();
        assert_eq!(wm.canonical_upper_bound(), c2.canonical_upper_bound());
    }
}
