//! Row copier: drains the chunker with a worker pool and copies each
//! chunk in one short transaction.
//!
//! `INSERT IGNORE` makes a chunk copy idempotent, which resume from a
//! mid-flight watermark relies on. Duplicate-key warnings are filtered
//! for the same reason; any other warning aborts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mysql_async::Pool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::dbconn::{retryable_transaction, RetryOpts};
use crate::error::{Error, Result};
use crate::table::{new_chunker, Chunk, Chunker, ChunkerProgress, Datum, HighWatermark, TableInfo};
use crate::throttler::Throttler;
use crate::utils::intersect_non_generated_columns;

const THROTTLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct CopierConfig {
    pub concurrency: usize,
    pub target_chunk_time: Duration,
    pub max_retries: u32,
    pub throttler: Arc<dyn Throttler>,
}

pub struct Copier {
    pool: Pool,
    table: Arc<TableInfo>,
    new_table: Arc<TableInfo>,
    config: CopierConfig,
    chunker: Mutex<Box<dyn Chunker>>,
    high_watermark: Arc<HighWatermark>,
    chunker_open: AtomicBool,

    rows_copied: AtomicU64,
    chunks_copied: AtomicU64,
    pub start_time: Instant,
}

impl Copier {
    pub fn new(
        pool: Pool,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        config: CopierConfig,
    ) -> Copier {
        let chunker = new_chunker(
            Arc::clone(&table),
            pool.clone(),
            config.target_chunk_time,
        );
        let high_watermark = chunker.high_watermark_handle();
        Copier {
            pool,
            table,
            new_table,
            config,
            chunker: Mutex::new(chunker),
            high_watermark,
            chunker_open: AtomicBool::new(false),
            rows_copied: AtomicU64::new(0),
            chunks_copied: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Construct a copier resuming at a saved low watermark. The row
    /// count from the checkpoint is advisory, carried for progress
    /// reporting only.
    pub async fn new_from_checkpoint(
        pool: Pool,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        config: CopierConfig,
        watermark: &str,
        rows_copied: u64,
    ) -> Result<Copier> {
        let copier = Copier::new(pool, table, new_table, config);
        {
            let mut chunker = copier.chunker.lock().await;
            chunker
                .open_at_watermark(watermark, copier.table.max_value(), rows_copied)
                .await?;
        }
        copier.chunker_open.store(true, Ordering::SeqCst);
        copier.rows_copied.store(rows_copied, Ordering::Relaxed);
        Ok(copier)
    }

    /// Run the copy to completion with `concurrency` workers.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.chunker_open.swap(true, Ordering::SeqCst) {
            self.chunker.lock().await.open().await?;
        }
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            let copier = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { copier.worker(worker_id, shutdown).await });
        }
        let mut first_err: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        // One failed chunk invalidates the run; stop the
                        // other workers at their next chunk boundary.
                        workers.abort_all();
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Other(format!("copy worker panicked: {join_err}")));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(
                    rows = self.rows_copied.load(Ordering::Relaxed),
                    chunks = self.chunks_copied.load(Ordering::Relaxed),
                    "copy rows complete"
                );
                Ok(())
            }
        }
    }

    async fn worker(&self, worker_id: usize, shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            while self.config.throttler.is_throttled() {
                tokio::time::sleep(THROTTLE_CHECK_INTERVAL).await;
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            let chunk = {
                let mut chunker = self.chunker.lock().await;
                chunker.next().await?
            };
            let Some(chunk) = chunk else {
                debug!(worker_id, "chunker drained");
                return Ok(());
            };
            let started = Instant::now();
            let affected = self.copy_chunk(&chunk).await?;
            let elapsed = started.elapsed();
            self.rows_copied.fetch_add(affected, Ordering::Relaxed);
            self.chunks_copied.fetch_add(1, Ordering::Relaxed);
            self.chunker.lock().await.feedback(&chunk, elapsed, affected);
            debug!(worker_id, chunk = %chunk, rows = affected, ms = elapsed.as_millis() as u64, "chunk copied");
        }
    }

    async fn copy_chunk(&self, chunk: &Chunk) -> Result<u64> {
        let columns = intersect_non_generated_columns(&self.table, &self.new_table);
        let stmt = format!(
            "INSERT IGNORE INTO {} ({columns}) SELECT {columns} FROM {} FORCE INDEX (PRIMARY) WHERE {}",
            self.new_table.quoted_name,
            self.table.quoted_name,
            chunk.to_predicate(),
        );
        retryable_transaction(
            &self.pool,
            &RetryOpts::new(self.config.max_retries, true),
            &[stmt],
        )
        .await
    }

    /// Consulted by the replication client: true iff the key is above
    /// every chunk handed out so far.
    pub fn key_above_high_watermark(&self, key: &Datum) -> bool {
        self.high_watermark.is_above(key)
    }

    pub fn high_watermark_handle(&self) -> Arc<HighWatermark> {
        Arc::clone(&self.high_watermark)
    }

    pub async fn get_low_watermark(&self) -> Result<Option<String>> {
        self.chunker.lock().await.get_low_watermark()
    }

    pub async fn is_complete(&self) -> bool {
        self.chunker.lock().await.is_read()
    }

    pub fn rows_copied(&self) -> u64 {
        self.rows_copied.load(Ordering::Relaxed)
    }

    pub async fn progress(&self) -> ChunkerProgress {
        self.chunker.lock().await.progress()
    }

    /// Human-readable progress for the status line.
    pub async fn progress_summary(&self) -> String {
        let p = self.progress().await;
        if p.total_rows_expected == 0 {
            return "100.00%".to_string();
        }
        format!(
            "{}/{} {:.2}%",
            p.rows_read,
            p.total_rows_expected,
            (p.rows_read as f64 / p.total_rows_expected as f64) * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::DatumType;
    use crate::throttler::Noop;

    fn test_table() -> Arc<TableInfo> {
        let mut ti = TableInfo::new("test", "t1");
        ti.columns = vec!["id".into(), "b".into()];
        ti.non_generated_columns = ti.columns.clone();
        ti.key_columns = vec!["id".into()];
        ti.key_column_types = vec![DatumType::Unsigned];
        ti.key_column_indexes = vec![0];
        ti.key_is_auto_inc = true;
        Arc::new(ti)
    }

    fn shadow_table() -> Arc<TableInfo> {
        let mut ti = TableInfo::new("test", "_t1_new");
        ti.columns = vec!["id".into(), "b".into(), "c".into()];
        ti.non_generated_columns = ti.columns.clone();
        ti.key_columns = vec!["id".into()];
        ti.key_column_types = vec![DatumType::Unsigned];
        ti.key_column_indexes = vec![0];
        Arc::new(ti)
    }

    #[test]
    fn test_copy_statement_shape() {
        let pool = Pool::new("mysql://root@localhost:3306/test");
        let copier = Copier::new(
            pool,
            test_table(),
            shadow_table(),
            CopierConfig {
                concurrency: 4,
                target_chunk_time: Duration::from_millis(100),
                max_retries: 5,
                throttler: Arc::new(Noop),
            },
        );
        let chunk = Chunk {
            key: vec!["id".into()],
            chunk_size: 1000,
            lower_bound: Some(crate::table::Boundary {
                values: vec![Datum::Unsigned(1)],
                inclusive: true,
            }),
            upper_bound: Some(crate::table::Boundary {
                values: vec![Datum::Unsigned(1001)],
                inclusive: false,
            }),
        };
        let columns = intersect_non_generated_columns(&copier.table, &copier.new_table);
        assert_eq!(columns, "`id`, `b`");
        let stmt = format!(
            "INSERT IGNORE INTO {} ({columns}) SELECT {columns} FROM {} FORCE INDEX (PRIMARY) WHERE {}",
            copier.new_table.quoted_name,
            copier.table.quoted_name,
            chunk.to_predicate(),
        );
        assert_eq!(
            stmt,
            "INSERT IGNORE INTO `test`.`_t1_new` (`id`, `b`) SELECT `id`, `b` FROM `test`.`t1` FORCE INDEX (PRIMARY) WHERE `id` >= 1 AND `id` < 1001"
        );
    }
}
