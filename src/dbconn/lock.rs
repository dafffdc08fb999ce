//! Server-wide table locks via `LOCK TABLES ... WRITE`.
//!
//! The lock lives on a dedicated connection so its scope survives across
//! statements; any statement that must run "under the lock" (the final
//! flush, the rename) has to go through that same connection. Acquisition
//! does not retry: the caller retries, which gives it the chance to catch
//! up on replication apply between attempts.

use mysql_async::prelude::*;
use mysql_async::{Conn, Pool};
use tracing::warn;

use crate::error::Result;
use crate::table::TableInfo;

pub struct TableLock {
    conn: Conn,
}

impl TableLock {
    /// Acquire `LOCK TABLES t1 WRITE, t2 WRITE, ...` on a dedicated
    /// connection.
    pub async fn new(pool: &Pool, tables: &[&TableInfo]) -> Result<TableLock> {
        let mut conn = pool.get_conn().await?;
        let stmt = tables
            .iter()
            .map(|t| format!("{} WRITE", t.quoted_name))
            .collect::<Vec<_>>()
            .join(", ");
        warn!(tables = %stmt, "trying to acquire table locks");
        conn.query_drop(format!("LOCK TABLES {stmt}")).await?;
        warn!("table lock(s) acquired");
        Ok(TableLock { conn })
    }

    /// Execute statements on the lock's connection, inside its scope.
    pub async fn exec_under_lock(&mut self, stmts: &[String]) -> Result<()> {
        for stmt in stmts {
            if stmt.is_empty() {
                continue;
            }
            self.conn.query_drop(stmt).await?;
        }
        Ok(())
    }

    /// Release the lock. Dropping the struct also releases it because the
    /// connection returns to the pool, but an explicit unlock keeps the
    /// window deterministic.
    pub async fn close(mut self) -> Result<()> {
        self.conn.query_drop("UNLOCK TABLES").await?;
        warn!("table lock released");
        Ok(())
    }
}
