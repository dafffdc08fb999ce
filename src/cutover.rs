//! The final cutover: swap the shadow table into place.
//!
//! Algorithm (MySQL 8.0.13+, which allows RENAME under LOCK TABLES):
//! lock both tables, flush the remaining deltas on the lock's own
//! connection, assert nothing is left, rename atomically, unlock. Each
//! attempt flushes once *outside* the lock first so the in-lock delta is
//! as small as possible.

use std::sync::Arc;

use mysql_async::Pool;
use tracing::{error, warn};

use crate::dbconn::TableLock;
use crate::error::{Error, Result};
use crate::repl::Client;
use crate::table::TableInfo;

pub struct CutOver {
    pool: Pool,
    table: Arc<TableInfo>,
    new_table: Arc<TableInfo>,
    old_table_name: String,
    client: Arc<Client>,
    max_retries: u32,
}

impl CutOver {
    pub fn new(
        pool: Pool,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        old_table_name: String,
        client: Arc<Client>,
        max_retries: u32,
    ) -> CutOver {
        CutOver {
            pool,
            table,
            new_table,
            old_table_name,
            client,
            max_retries,
        }
    }

    pub async fn run(&self) -> Result<()> {
        for attempt in 1..=self.max_retries {
            // Catch up before taking the lock, so the flush under the
            // lock has as little as possible to do.
            self.client.flush().await?;
            warn!(attempt, max = self.max_retries, "attempting final cut over operation");
            match self.rename_under_lock().await {
                Ok(()) => {
                    warn!("final cut over operation complete");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "cutover attempt failed");
                }
            }
        }
        error!("cutover failed, and retries exhausted");
        Err(Error::CutoverRetriesExhausted)
    }

    async fn rename_under_lock(&self) -> Result<()> {
        let mut lock = TableLock::new(&self.pool, &[&self.table, &self.new_table]).await?;
        let result = self.flush_and_rename(&mut lock).await;
        match result {
            Ok(()) => lock.close().await,
            Err(e) => {
                // Best effort: releasing the lock matters more than the
                // unlock result on this failed attempt.
                let _ = lock.close().await;
                Err(e)
            }
        }
    }

    async fn flush_and_rename(&self, lock: &mut TableLock) -> Result<()> {
        self.client.flush_under_lock(lock).await?;
        if !self.client.all_changes_flushed().await {
            return Err(Error::Other(
                "not all changes flushed, final flush might be broken".into(),
            ));
        }
        let old_quoted = format!("`{}`.`{}`", self.table.schema_name, self.old_table_name);
        let rename = format!(
            "RENAME TABLE {} TO {}, {} TO {}",
            self.table.quoted_name, old_quoted, self.new_table.quoted_name, self.table.quoted_name,
        );
        lock.exec_under_lock(&[rename]).await
    }
}
