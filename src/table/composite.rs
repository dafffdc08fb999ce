//! Composite chunker for keys that are not a single auto_increment
//! column.
//!
//! Instead of cursor arithmetic, each boundary is discovered by probing
//! the table: select the key found `chunk_size` rows above the cursor in
//! key order. Bounds render as OR-chain expansions of row-constructor
//! comparisons because MySQL does not index-optimize `(a,b) > (x,y)`.
//!
//! The checksum uses this chunker for every key shape, so it also handles
//! single integer keys.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Pool, Row};

use crate::error::{Error, Result};
use crate::table::chunk::expand_row_comparison;
use crate::table::chunker::{
    ChunkSizer, Chunker, ChunkerProgress, HighWatermark, WatermarkTracker,
};
use crate::table::{Boundary, Chunk, Datum, TableInfo};
use crate::utils::quote_columns;

pub struct CompositeChunker {
    ti: Arc<TableInfo>,
    pool: Pool,
    sizer: ChunkSizer,
    tracker: WatermarkTracker,
    high_watermark: Arc<HighWatermark>,

    /// Key values of the next chunk's lower bound; `None` before the
    /// first chunk.
    cursor: Option<Vec<Datum>>,
    is_open: bool,
    done: bool,
    rows_read: u64,
    chunks_completed: u64,
}

impl CompositeChunker {
    pub fn new(ti: Arc<TableInfo>, pool: Pool, target: Duration) -> CompositeChunker {
        CompositeChunker {
            ti,
            pool,
            sizer: ChunkSizer::new(target),
            tracker: WatermarkTracker::new(),
            high_watermark: Arc::new(HighWatermark::new()),
            cursor: None,
            is_open: false,
            done: false,
            rows_read: 0,
            chunks_completed: 0,
        }
    }

    /// Find the key exactly `chunk_size` rows above the cursor, which
    /// becomes the exclusive upper bound of the next chunk. `None` means
    /// fewer than `chunk_size` rows remain.
    async fn probe_upper_bound(&self, chunk_size: u64) -> Result<Option<Vec<Datum>>> {
        let key_list = quote_columns(&self.ti.key_columns);
        let where_clause = match &self.cursor {
            Some(values) => format!(
                "WHERE {}",
                expand_row_comparison(&self.ti.key_columns, ">=", values)
            ),
            None => String::new(),
        };
        let query = format!(
            "SELECT {key_list} FROM {} FORCE INDEX (PRIMARY) {where_clause} ORDER BY {key_list} LIMIT 1 OFFSET {chunk_size}",
            self.ti.quoted_name
        );
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn.query_first(query).await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let mut values = Vec::with_capacity(self.ti.key_columns.len());
                for (i, tp) in self.ti.key_column_types.iter().enumerate() {
                    let value = row
                        .as_ref(i)
                        .and_then(|v| Datum::from_mysql_value(v, *tp))
                        .ok_or_else(|| {
                            Error::Other("NULL or unreadable value in key column".into())
                        })?;
                    values.push(value);
                }
                Ok(Some(values))
            }
        }
    }

    fn bound(values: &Option<Vec<Datum>>, inclusive: bool) -> Option<Boundary> {
        values.as_ref().map(|v| Boundary {
            values: v.clone(),
            inclusive,
        })
    }
}

#[async_trait]
impl Chunker for CompositeChunker {
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
                self.high_watermark.advance(upper.values[0].clone());
                self.cursor = Some(upper.values.clone());
            }
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
        let upper = self.probe_upper_bound(size).await?;
        let chunk = Chunk {
            key: self.ti.key_columns.clone(),
            chunk_size: size,
            lower_bound: Self::bound(&self.cursor, true),
            upper_bound: Self::bound(&upper, false),
        };
        match upper {
            Some(values) => {
                self.high_watermark.advance(values[0].clone());
                self.cursor = Some(values);
            }
            None => {
                // Fewer than chunk_size rows remain: this chunk is final
                // and closed, covering everything to the end of the key
                // space.
                self.done = true;
                self.high_watermark.disable();
            }
        }
        Ok(Some(chunk))
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

    fn composite_table() -> Arc<TableInfo> {
        let mut ti = TableInfo::new("test", "t1");
        ti.columns = vec!["a".into(), "b".into(), "c".into()];
        ti.non_generated_columns = ti.columns.clone();
        ti.key_columns = vec!["a".into(), "b".into()];
        ti.key_column_types = vec![DatumType::Unsigned, DatumType::Binary];
        ti.key_column_indexes = vec![0, 1];
        Arc::new(ti)
    }

    #[test]
    fn test_watermark_restore_sets_cursor() {
        let chunk = Chunk {
            key: vec!["a".into(), "b".into()],
            chunk_size: 100,
            lower_bound: Some(Boundary {
                values: vec![Datum::Unsigned(1), Datum::Binary("a".into())],
                inclusive: true,
            }),
            upper_bound: Some(Boundary {
                values: vec![Datum::Unsigned(5), Datum::Binary("q".into())],
                inclusive: false,
            }),
        };
        let json = chunk.as_json().unwrap();

        let pool = Pool::new("mysql://root@localhost:3306/test");
        let mut c = CompositeChunker::new(composite_table(), pool, Duration::from_millis(100));
        futures::executor::block_on(c.open_at_watermark(&json, None, 500)).unwrap();
        assert_eq!(
            c.cursor,
            Some(vec![Datum::Unsigned(5), Datum::Binary("q".into())])
        );
        assert_eq!(c.progress().rows_read, 500);
        assert!(!c.is_read());
    }

    #[test]
    fn test_watermark_at_final_chunk_means_done() {
        let chunk = Chunk {
            key: vec!["a".into(), "b".into()],
            chunk_size: 100,
            lower_bound: Some(Boundary {
                values: vec![Datum::Unsigned(9), Datum::Binary("z".into())],
                inclusive: true,
            }),
            upper_bound: None,
        };
        let json = chunk.as_json().unwrap();
        let pool = Pool::new("mysql://root@localhost:3306/test");
        let mut c = CompositeChunker::new(composite_table(), pool, Duration::from_millis(100));
        futures::executor::block_on(c.open_at_watermark(&json, None, 0)).unwrap();
        assert!(c.is_read());
    }
}
