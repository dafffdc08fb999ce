//! Chunk-parallel checksum of the source table against the shadow table.
//!
//! Each chunk is compared as `BIT_XOR(CRC32(...))` over the intersected
//! columns on a REPEATABLE READ consistent snapshot. Writes keep flowing
//! during the checksum, so before opening each snapshot the replication
//! client is driven past the server's current position and flushed; the
//! snapshot then sees at least everything the shadow table has.
//!
//! Always uses the composite chunker, so the predicates are
//! index-friendly for every key shape.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dbconn::{retryable_transaction, RetryOpts};
use crate::error::{Error, Result};
use crate::repl::Client;
use crate::table::{new_composite_chunker, Chunk, Chunker, TableInfo};
use crate::utils::{
    hash_key, intersect_non_generated_columns_as_slice, pks_to_row_value_constructor,
    quote_columns,
};

#[derive(Clone)]
pub struct CheckerConfig {
    pub concurrency: usize,
    pub target_chunk_time: Duration,
    /// Re-copy divergent rows instead of failing.
    pub fix_differences: bool,
    pub max_retries: u32,
}

pub struct Checker {
    pool: Pool,
    table: Arc<TableInfo>,
    new_table: Arc<TableInfo>,
    client: Arc<Client>,
    config: CheckerConfig,
    chunker: Mutex<Box<dyn Chunker>>,
    differences: AtomicUsize,
    fixed: AtomicUsize,
    recent_value: std::sync::Mutex<String>,
    pub start_time: Instant,
}

impl Checker {
    pub fn new(
        pool: Pool,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        client: Arc<Client>,
        config: CheckerConfig,
    ) -> Checker {
        let chunker = new_composite_chunker(
            Arc::clone(&table),
            pool.clone(),
            config.target_chunk_time,
        );
        Checker {
            pool,
            table,
            new_table,
            client,
            config,
            chunker: Mutex::new(chunker),
            differences: AtomicUsize::new(0),
            fixed: AtomicUsize::new(0),
            recent_value: std::sync::Mutex::new("TBD".to_string()),
            start_time: Instant::now(),
        }
    }

    /// Run the checksum over the whole key space (or from a saved
    /// watermark). Fails with `ChecksumMismatch` unless differences were
    /// repaired.
    pub async fn run(self: Arc<Self>, resume_watermark: Option<&str>) -> Result<()> {
        {
            let mut chunker = self.chunker.lock().await;
            match resume_watermark {
                Some(watermark) => {
                    chunker
                        .open_at_watermark(watermark, self.table.max_value(), 0)
                        .await?
                }
                None => chunker.open().await?,
            }
        }
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..self.config.concurrency.max(1) {
            let checker = Arc::clone(&self);
            workers.spawn(async move { checker.worker().await });
        }
        let mut first_err: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        workers.abort_all();
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err =
                            Some(Error::Other(format!("checksum worker panicked: {join_err}")));
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        let differences = self.differences.load(Ordering::Relaxed);
        let fixed = self.fixed.load(Ordering::Relaxed);
        if differences > 0 {
            if self.config.fix_differences && fixed == differences {
                warn!(differences, "checksum differences found and repaired");
                return Ok(());
            }
            return Err(Error::ChecksumMismatch { differences });
        }
        Ok(())
    }

    async fn worker(&self) -> Result<()> {
        loop {
            let chunk = {
                let mut chunker = self.chunker.lock().await;
                chunker.next().await?
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            let started = Instant::now();
            self.checksum_chunk(&chunk).await?;
            let elapsed = started.elapsed();
            {
                let mut chunker = self.chunker.lock().await;
                chunker.feedback(&chunk, elapsed, chunk.chunk_size);
            }
            if let Some(lower) = &chunk.lower_bound {
                *self.recent_value.lock().unwrap() = lower.canonical();
            }
        }
    }

    /// Checksum one chunk, repairing it when configured to.
    pub async fn checksum_chunk(&self, chunk: &Chunk) -> Result<()> {
        // The shadow table must be at least as current as the snapshot we
        // are about to open, or rows the copier has not reached yet but
        // the binlog has would look like differences.
        self.client.block_wait().await?;
        self.client.flush().await?;

        let predicate = chunk.to_predicate();
        let expr = self.checksum_expression();
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await?;
        conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT")
            .await?;
        let source: Option<i64> = conn
            .query_first(format!(
                "SELECT {expr} FROM {} WHERE {predicate}",
                self.table.quoted_name
            ))
            .await?;
        let target: Option<i64> = conn
            .query_first(format!(
                "SELECT {expr} FROM {} WHERE {predicate}",
                self.new_table.quoted_name
            ))
            .await?;
        conn.query_drop("COMMIT").await?;

        if source != target {
            self.differences.fetch_add(1, Ordering::Relaxed);
            warn!(chunk = %chunk, "checksum mismatch on chunk");
            if self.config.fix_differences {
                self.fix_chunk(chunk).await?;
                self.fixed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// `BIT_XOR(CRC32(CONCAT_WS(...)))` over the columns both tables
    /// share. The ISNULL flags keep NULL distinct from the empty string,
    /// which CONCAT_WS would otherwise conflate.
    fn checksum_expression(&self) -> String {
        let columns = intersect_non_generated_columns_as_slice(&self.table, &self.new_table);
        let mut parts: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
        parts.extend(columns.iter().map(|c| format!("ISNULL(`{c}`)")));
        format!(
            "BIT_XOR(CAST(CRC32(CONCAT_WS('#', {})) AS UNSIGNED))",
            parts.join(", ")
        )
    }

    /// Row-by-row repair: recompute per-row checksums keyed by primary
    /// key on both sides, then re-copy rows that are missing or differ
    /// and delete rows that should not exist.
    async fn fix_chunk(&self, chunk: &Chunk) -> Result<()> {
        let predicate = chunk.to_predicate();
        let key_list = quote_columns(&self.table.key_columns);
        let columns = intersect_non_generated_columns_as_slice(&self.table, &self.new_table);
        let mut crc_parts: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
        crc_parts.extend(columns.iter().map(|c| format!("ISNULL(`{c}`)")));
        let row_expr = format!("CRC32(CONCAT_WS('#', {}))", crc_parts.join(", "));

        let mut conn = self.pool.get_conn().await?;
        let source_rows = self
            .row_checksums(&mut conn, &self.table, &key_list, &row_expr, &predicate)
            .await?;
        let target_rows = self
            .row_checksums(&mut conn, &self.new_table, &key_list, &row_expr, &predicate)
            .await?;

        let mut replace_keys = Vec::new();
        for (key, crc) in &source_rows {
            if target_rows.get(key) != Some(crc) {
                replace_keys.push(key.clone());
            }
        }
        let mut delete_keys = Vec::new();
        for key in target_rows.keys() {
            if !source_rows.contains_key(key) {
                delete_keys.push(key.clone());
            }
        }
        info!(
            chunk = %chunk,
            replace = replace_keys.len(),
            delete = delete_keys.len(),
            "repairing chunk"
        );
        let mut stmts = Vec::new();
        if !delete_keys.is_empty() {
            stmts.push(format!(
                "DELETE FROM {} WHERE ({key_list}) IN ({})",
                self.new_table.quoted_name,
                pks_to_row_value_constructor(&delete_keys),
            ));
        }
        if !replace_keys.is_empty() {
            let cols = quote_columns(&columns);
            stmts.push(format!(
                "REPLACE INTO {} ({cols}) SELECT {cols} FROM {} FORCE INDEX (PRIMARY) WHERE ({key_list}) IN ({})",
                self.new_table.quoted_name,
                self.table.quoted_name,
                pks_to_row_value_constructor(&replace_keys),
            ));
        }
        if !stmts.is_empty() {
            retryable_transaction(
                &self.pool,
                &RetryOpts::new(self.config.max_retries, true),
                &stmts,
            )
            .await?;
        }
        Ok(())
    }

    async fn row_checksums(
        &self,
        conn: &mut mysql_async::Conn,
        table: &TableInfo,
        key_list: &str,
        row_expr: &str,
        predicate: &str,
    ) -> Result<std::collections::HashMap<String, u64>> {
        let rows: Vec<Row> = conn
            .query(format!(
                "SELECT {key_list}, {row_expr} FROM {} WHERE {predicate}",
                table.quoted_name
            ))
            .await?;
        let key_count = self.table.key_columns.len();
        let mut out = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let mut key_parts = Vec::with_capacity(key_count);
            for i in 0..key_count {
                let part: String = match row.as_ref(i) {
                    Some(mysql_async::Value::Bytes(b)) => String::from_utf8_lossy(b).to_string(),
                    Some(mysql_async::Value::Int(v)) => v.to_string(),
                    Some(mysql_async::Value::UInt(v)) => v.to_string(),
                    Some(other) => other.as_sql(true).trim_matches('\'').to_string(),
                    None => return Err(Error::Other("NULL in key column".into())),
                };
                key_parts.push(part);
            }
            let crc: u64 = row
                .get(key_count)
                .ok_or_else(|| Error::Other("missing row checksum".into()))?;
            out.insert(hash_key(&key_parts), crc);
        }
        Ok(out)
    }

    pub fn differences_found(&self) -> usize {
        self.differences.load(Ordering::Relaxed)
    }

    /// Most recently checksummed lower bound, for the status line.
    pub fn recent_value(&self) -> String {
        self.recent_value.lock().unwrap().clone()
    }

    pub async fn get_low_watermark(&self) -> Result<Option<String>> {
        self.chunker.lock().await.get_low_watermark()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::ClientConfig;
    use crate::table::DatumType;

    fn tables() -> (Arc<TableInfo>, Arc<TableInfo>) {
        let mut t = TableInfo::new("test", "t1");
        t.columns = vec!["a".into(), "b".into()];
        t.non_generated_columns = t.columns.clone();
        t.key_columns = vec!["a".into()];
        t.key_column_types = vec![DatumType::Signed];
        t.key_column_indexes = vec![0];
        let mut n = TableInfo::new("test", "_t1_new");
        n.columns = vec!["a".into(), "b".into()];
        n.non_generated_columns = n.columns.clone();
        n.key_columns = vec!["a".into()];
        n.key_column_types = vec![DatumType::Signed];
        n.key_column_indexes = vec![0];
        (Arc::new(t), Arc::new(n))
    }

    #[test]
    fn test_checksum_expression_distinguishes_null_from_empty() {
        let (t, n) = tables();
        let pool = Pool::new("mysql://root@localhost:3306/test");
        let client = Arc::new(Client::new(pool.clone(), ClientConfig::default()));
        let checker = Checker::new(
            pool,
            t,
            n,
            client,
            CheckerConfig {
                concurrency: 2,
                target_chunk_time: Duration::from_millis(100),
                fix_differences: false,
                max_retries: 5,
            },
        );
        let expr = checker.checksum_expression();
        // The ISNULL flags are what make '' and NULL hash differently.
        assert_eq!(
            expr,
            "BIT_XOR(CAST(CRC32(CONCAT_WS('#', `a`, `b`, ISNULL(`a`), ISNULL(`b`))) AS UNSIGNED))"
        );
    }
}
