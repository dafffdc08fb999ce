//! A subscription binds a source table to its shadow table and buffers
//! pending row changes until they are flushed.
//!
//! The delta store has two shapes. When the primary key is memory
//! comparable, a map keyed by the hashed key holds only the *last* kind
//! observed per key, which is all that matters for the final state. When
//! it is not, a FIFO queue preserves source order and adjacent same-kind
//! entries are merged into runs at flush time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use mysql_async::Pool;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::dbconn::{retryable_transaction, RetryOpts, TableLock};
use crate::error::{Error, Result};
use crate::repl::client::BatchSizer;
use crate::table::{Datum, HighWatermark, TableInfo};
use crate::utils::{
    hash_key, intersect_non_generated_columns, pks_to_row_value_constructor, quote_columns,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueuedChange {
    pub key: String,
    pub is_delete: bool,
}

/// Buffered change intents for one table.
pub(crate) enum DeltaStore {
    /// hashed key -> is_delete; later events overwrite earlier ones.
    Map(HashMap<String, bool>),
    /// Source-ordered change intents.
    Queue(Vec<QueuedChange>),
}

impl DeltaStore {
    fn len(&self) -> usize {
        match self {
            DeltaStore::Map(m) => m.len(),
            DeltaStore::Queue(q) => q.len(),
        }
    }

    fn clear(&mut self) {
        match self {
            DeltaStore::Map(m) => m.clear(),
            DeltaStore::Queue(q) => q.clear(),
        }
    }
}

/// A single flush statement and the number of keys it applies, for batch
/// size feedback.
struct FlushStatement {
    num_keys: usize,
    stmt: String,
}

pub struct Subscription {
    pub(crate) table: Arc<TableInfo>,
    pub(crate) new_table: Arc<TableInfo>,
    delta: Mutex<DeltaState>,
    /// Back-reference to the client's batch sizer; the subscription only
    /// needs the feedback interface, not the whole client.
    batch: Arc<BatchSizer>,
    /// Where the copier has handed out chunks up to, if the optimization
    /// is available.
    key_above: Option<Arc<HighWatermark>>,
}

struct DeltaState {
    store: DeltaStore,
    key_above_watermark_enabled: bool,
}

impl Subscription {
    pub(crate) fn new(
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        batch: Arc<BatchSizer>,
        key_above: Option<Arc<HighWatermark>>,
    ) -> Subscription {
        // The queue preserves binlog order for keys whose in-memory
        // ordering does not match SQL ordering.
        let store = if table.is_pk_memory_comparable() {
            DeltaStore::Map(HashMap::new())
        } else {
            DeltaStore::Queue(Vec::new())
        };
        Subscription {
            table,
            new_table,
            delta: Mutex::new(DeltaState {
                store,
                key_above_watermark_enabled: true,
            }),
            batch,
            key_above,
        }
    }

    pub async fn len(&self) -> usize {
        self.delta.lock().await.store.len()
    }

    /// Record a change intent for a key. Upserts above the copier's high
    /// watermark are dropped: the copier will read the current row of the
    /// source table when it gets there, so the binlog event is redundant.
    pub(crate) async fn key_has_changed(&self, key: Vec<String>, deleted: bool) {
        let mut state = self.delta.lock().await;
        if !deleted && state.key_above_watermark_enabled {
            if let (Some(handle), Some(first)) = (&self.key_above, key.first()) {
                if let Some(datum) =
                    Datum::from_key_string(first, self.table.key_column_types[0])
                {
                    if handle.is_above(&datum) {
                        debug!(key = %first, "key above high watermark, skipping");
                        return;
                    }
                }
            }
        }
        let hashed = hash_key(&key);
        match &mut state.store {
            DeltaStore::Map(map) => {
                map.insert(hashed, deleted);
            }
            DeltaStore::Queue(queue) => queue.push(QueuedChange {
                key: hashed,
                is_delete: deleted,
            }),
        }
    }

    pub(crate) async fn set_key_above_watermark_optimization(&self, enabled: bool) {
        self.delta.lock().await.key_above_watermark_enabled = enabled;
    }

    fn create_delete_stmt(&self, keys: &[String]) -> Option<FlushStatement> {
        if keys.is_empty() {
            return None;
        }
        Some(FlushStatement {
            num_keys: keys.len(),
            stmt: format!(
                "DELETE FROM {} WHERE ({}) IN ({})",
                self.new_table.quoted_name,
                quote_columns(&self.table.key_columns),
                pks_to_row_value_constructor(keys),
            ),
        })
    }

    fn create_replace_stmt(&self, keys: &[String]) -> Option<FlushStatement> {
        if keys.is_empty() {
            return None;
        }
        let columns = intersect_non_generated_columns(&self.table, &self.new_table);
        Some(FlushStatement {
            num_keys: keys.len(),
            stmt: format!(
                "REPLACE INTO {} ({columns}) SELECT {columns} FROM {} FORCE INDEX (PRIMARY) WHERE ({}) IN ({})",
                self.new_table.quoted_name,
                self.table.quoted_name,
                quote_columns(&self.table.key_columns),
                pks_to_row_value_constructor(keys),
            ),
        })
    }

    /// Flush all pending changes to the shadow table. The delta mutex is
    /// held for the duration so the store is only cleared once every
    /// statement has committed; ingestion briefly contends with this.
    pub(crate) async fn flush(
        &self,
        pool: &Pool,
        concurrency: usize,
        lock: Option<&mut TableLock>,
    ) -> Result<()> {
        let mut state = self.delta.lock().await;
        if state.store.len() == 0 {
            return Ok(());
        }
        let target = self.batch.target() as usize;
        match &state.store {
            DeltaStore::Map(map) => {
                let stmts = self.build_map_statements(map, target);
                match lock {
                    Some(lock) => {
                        let raw: Vec<String> = stmts.into_iter().map(|s| s.stmt).collect();
                        lock.exec_under_lock(&raw).await?;
                    }
                    None => self.execute_parallel(pool, concurrency, stmts).await?,
                }
            }
            DeltaStore::Queue(queue) => {
                let stmts = self.build_queue_statements(queue, target);
                let raw: Vec<String> = stmts.into_iter().map(|s| s.stmt).collect();
                match lock {
                    Some(lock) => lock.exec_under_lock(&raw).await?,
                    None => {
                        // Order matters: one transaction, statements in
                        // sequence.
                        retryable_transaction(pool, &RetryOpts::new(5, true), &raw).await?;
                    }
                }
            }
        }
        state.store.clear();
        Ok(())
    }

    /// Map-mode batches: distinct keys, so statements are independent and
    /// order-free.
    fn build_map_statements(&self, map: &HashMap<String, bool>, target: usize) -> Vec<FlushStatement> {
        let mut stmts = Vec::new();
        let mut delete_keys = Vec::new();
        let mut replace_keys = Vec::new();
        for (key, is_delete) in map {
            if *is_delete {
                delete_keys.push(key.clone());
            } else {
                replace_keys.push(key.clone());
            }
            if delete_keys.len() + replace_keys.len() >= target {
                stmts.extend(self.create_delete_stmt(&delete_keys));
                stmts.extend(self.create_replace_stmt(&replace_keys));
                delete_keys.clear();
                replace_keys.clear();
            }
        }
        stmts.extend(self.create_delete_stmt(&delete_keys));
        stmts.extend(self.create_replace_stmt(&replace_keys));
        stmts
    }

    /// Queue-mode batches: adjacent same-kind changes merge into runs,
    /// e.g. REPLACE<1>, REPLACE<2>, DELETE<3>, REPLACE<4> becomes
    /// REPLACE<1,2>, DELETE<3>, REPLACE<4>.
    fn build_queue_statements(&self, queue: &[QueuedChange], target: usize) -> Vec<FlushStatement> {
        let mut stmts = Vec::new();
        let mut buffer: Vec<String> = Vec::new();
        let mut buffer_is_delete = match queue.first() {
            Some(first) => first.is_delete,
            None => return stmts,
        };
        for change in queue {
            if change.is_delete != buffer_is_delete || buffer.len() >= target {
                let stmt = if buffer_is_delete {
                    self.create_delete_stmt(&buffer)
                } else {
                    self.create_replace_stmt(&buffer)
                };
                stmts.extend(stmt);
                buffer.clear();
                buffer_is_delete = change.is_delete;
            }
            buffer.push(change.key.clone());
        }
        let stmt = if buffer_is_delete {
            self.create_delete_stmt(&buffer)
        } else {
            self.create_replace_stmt(&buffer)
        };
        stmts.extend(stmt);
        stmts
    }

    async fn execute_parallel(
        &self,
        pool: &Pool,
        concurrency: usize,
        stmts: Vec<FlushStatement>,
    ) -> Result<()> {
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut pending = stmts.into_iter();
        let mut first_err: Option<Error> = None;
        loop {
            while join_set.len() < concurrency.max(1) {
                let Some(FlushStatement { num_keys, stmt }) = pending.next() else {
                    break;
                };
                let pool = pool.clone();
                let batch = Arc::clone(&self.batch);
                join_set.spawn(async move {
                    let start = Instant::now();
                    let result =
                        retryable_transaction(&pool, &RetryOpts::new(5, true), &[stmt]).await;
                    batch.feedback(num_keys, start.elapsed());
                    result.map(|_| ())
                });
            }
            match join_set.join_next().await {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    // Drain remaining tasks before surfacing.
                    pending.by_ref().for_each(drop);
                }
                Some(Err(join_err)) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Other(format!("flush task panicked: {join_err}")));
                    }
                    pending.by_ref().for_each(drop);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::DatumType;

    fn tables() -> (Arc<TableInfo>, Arc<TableInfo>) {
        let mut t = TableInfo::new("test", "t1");
        t.columns = vec!["id".into(), "b".into()];
        t.non_generated_columns = t.columns.clone();
        t.key_columns = vec!["id".into()];
        t.key_column_types = vec![DatumType::Unsigned];
        t.key_column_indexes = vec![0];
        let mut n = TableInfo::new("test", "_t1_new");
        n.columns = vec!["id".into(), "b".into(), "c".into()];
        n.non_generated_columns = n.columns.clone();
        n.key_columns = vec!["id".into()];
        n.key_column_types = vec![DatumType::Unsigned];
        n.key_column_indexes = vec![0];
        (Arc::new(t), Arc::new(n))
    }

    fn queue_tables() -> (Arc<TableInfo>, Arc<TableInfo>) {
        let (t, n) = tables();
        let mut t = TableInfo::new("test", &t.table_name);
        t.columns = vec!["id".into(), "b".into()];
        t.non_generated_columns = t.columns.clone();
        t.key_columns = vec!["id".into()];
        t.key_column_types = vec![DatumType::Decimal];
        t.key_column_indexes = vec![0];
        (Arc::new(t), n)
    }

    fn subscription() -> Subscription {
        let (t, n) = tables();
        Subscription::new(t, n, Arc::new(BatchSizer::default()), None)
    }

    #[tokio::test]
    async fn test_map_mode_collapses_same_key() {
        let sub = subscription();
        sub.key_has_changed(vec!["1".into()], false).await;
        sub.key_has_changed(vec!["1".into()], false).await;
        assert_eq!(sub.len().await, 1);
        // A later delete wins over the earlier upsert.
        sub.key_has_changed(vec!["1".into()], true).await;
        assert_eq!(sub.len().await, 1);
        let state = sub.delta.lock().await;
        match &state.store {
            DeltaStore::Map(m) => assert_eq!(m.get("1"), Some(&true)),
            DeltaStore::Queue(_) => panic!("expected map mode"),
        }
    }

    #[tokio::test]
    async fn test_queue_mode_preserves_order() {
        let (t, n) = queue_tables();
        let sub = Subscription::new(t, n, Arc::new(BatchSizer::default()), None);
        sub.key_has_changed(vec!["1.5".into()], false).await;
        sub.key_has_changed(vec!["1.5".into()], true).await;
        sub.key_has_changed(vec!["2.5".into()], false).await;
        assert_eq!(sub.len().await, 3);
        let state = sub.delta.lock().await;
        match &state.store {
            DeltaStore::Queue(q) => {
                assert_eq!(q[0], QueuedChange { key: "1.5".into(), is_delete: false });
                assert_eq!(q[1], QueuedChange { key: "1.5".into(), is_delete: true });
                assert_eq!(q[2], QueuedChange { key: "2.5".into(), is_delete: false });
            }
            DeltaStore::Map(_) => panic!("expected queue mode"),
        }
    }

    #[tokio::test]
    async fn test_queue_statements_merge_runs() {
        let (t, n) = queue_tables();
        let sub = Subscription::new(t, n, Arc::new(BatchSizer::default()), None);
        let queue = vec![
            QueuedChange { key: "1".into(), is_delete: false },
            QueuedChange { key: "2".into(), is_delete: false },
            QueuedChange { key: "3".into(), is_delete: true },
            QueuedChange { key: "4".into(), is_delete: false },
        ];
        let stmts = sub.build_queue_statements(&queue, 1000);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].stmt.starts_with("REPLACE INTO"));
        assert!(stmts[0].stmt.contains("('1'),('2')"));
        assert!(stmts[1].stmt.starts_with("DELETE FROM"));
        assert!(stmts[2].stmt.starts_with("REPLACE INTO"));
        assert!(stmts[2].stmt.contains("('4')"));
    }

    #[tokio::test]
    async fn test_map_statements_respect_target_batch() {
        let sub = subscription();
        let mut map = HashMap::new();
        for i in 0..10 {
            map.insert(i.to_string(), i % 2 == 0);
        }
        let stmts = sub.build_map_statements(&map, 4);
        // Batches of <= 4 keys, each batch producing up to two statements.
        assert!(stmts.len() >= 4);
        for stmt in &stmts {
            assert!(stmt.num_keys <= 4);
        }
    }

    #[tokio::test]
    async fn test_replace_statement_uses_intersected_columns() {
        let sub = subscription();
        let stmt = sub.create_replace_stmt(&["7".into()]).unwrap();
        // Column `c` exists only on the new table and must not appear.
        assert_eq!(
            stmt.stmt,
            "REPLACE INTO `test`.`_t1_new` (`id`, `b`) SELECT `id`, `b` FROM `test`.`t1` FORCE INDEX (PRIMARY) WHERE (`id`) IN (('7'))"
        );
    }

    #[tokio::test]
    async fn test_upsert_above_high_watermark_is_dropped() {
        let (t, n) = tables();
        let hw = Arc::new(HighWatermark::new());
        hw.advance(Datum::Unsigned(100));
        let sub = Subscription::new(t, n, Arc::new(BatchSizer::default()), Some(Arc::clone(&hw)));

        sub.key_has_changed(vec!["500".into()], false).await;
        assert_eq!(sub.len().await, 0);
        // Deletes are always buffered.
        sub.key_has_changed(vec!["500".into()], true).await;
        assert_eq!(sub.len().await, 1);
        // Below the watermark is buffered.
        sub.key_has_changed(vec!["50".into()], false).await;
        assert_eq!(sub.len().await, 2);
        // Once the optimization is off, everything is buffered.
        sub.set_key_above_watermark_optimization(false).await;
        sub.key_has_changed(vec!["600".into()], false).await;
        assert_eq!(sub.len().await, 3);
    }
}
