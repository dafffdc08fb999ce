//! Checkpointing and the resume protocol.
//!
//! Every 50 seconds during copy/checksum, one row is appended to
//! `_<table>_chkpnt` with the copier's low watermark, the checksum's
//! watermark (when one is running), and the replication client's
//! *flushed* binlog position. Using the flushed position rather than the
//! buffered one means a resume replays a little extra binlog instead of
//! leaving a gap.

use std::sync::Arc;
use std::time::Duration;

use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::checksum::Checker;
use crate::copier::Copier;
use crate::error::{Error, Result};
use crate::repl::{BinlogPosition, Client};
use crate::utils::checkpoint_table_name;

/// How often a checkpoint row is written.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(50);

/// One row of the checkpoint table. Latest row by id wins.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub copier_watermark: String,
    pub checksum_watermark: Option<String>,
    pub binlog: BinlogPosition,
    pub rows_copied: u64,
    pub statement: String,
}

/// Create (or re-create) the checkpoint table.
pub async fn create_checkpoint_table(pool: &Pool, schema: &str, table: &str) -> Result<()> {
    let name = checkpoint_table_name(table);
    let mut conn = pool.get_conn().await?;
    conn.query_drop(format!("DROP TABLE IF EXISTS `{schema}`.`{name}`"))
        .await?;
    conn.query_drop(format!(
        "CREATE TABLE `{schema}`.`{name}` (
            id INT NOT NULL AUTO_INCREMENT PRIMARY KEY,
            copier_watermark TEXT,
            checksum_watermark TEXT,
            binlog_name VARCHAR(255),
            binlog_pos INT,
            rows_copied BIGINT,
            statement TEXT
        )"
    ))
    .await?;
    Ok(())
}

pub async fn drop_checkpoint_table(pool: &Pool, schema: &str, table: &str) -> Result<()> {
    let name = checkpoint_table_name(table);
    let mut conn = pool.get_conn().await?;
    conn.query_drop(format!("DROP TABLE IF EXISTS `{schema}`.`{name}`"))
        .await?;
    Ok(())
}

/// Read the newest checkpoint row, if any.
pub async fn read_latest_checkpoint(
    pool: &Pool,
    schema: &str,
    table: &str,
) -> Result<Option<CheckpointRecord>> {
    let name = checkpoint_table_name(table);
    let mut conn = pool.get_conn().await?;
    let row: Option<Row> = conn
        .query_first(format!(
            "SELECT copier_watermark, checksum_watermark, binlog_name, binlog_pos, rows_copied, statement
             FROM `{schema}`.`{name}` ORDER BY id DESC LIMIT 1"
        ))
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let copier_watermark: String = row
        .get(0)
        .ok_or_else(|| Error::Other("checkpoint row missing watermark".into()))?;
    let checksum_watermark: Option<String> = row.get::<Option<String>, _>(1).flatten();
    let binlog_name: String = row
        .get(2)
        .ok_or_else(|| Error::Other("checkpoint row missing binlog name".into()))?;
    let binlog_pos: u64 = row
        .get(3)
        .ok_or_else(|| Error::Other("checkpoint row missing binlog pos".into()))?;
    let rows_copied: u64 = row.get(4).unwrap_or(0);
    let statement: String = row.get(5).unwrap_or_default();
    Ok(Some(CheckpointRecord {
        copier_watermark,
        checksum_watermark,
        binlog: BinlogPosition {
            name: binlog_name,
            pos: binlog_pos,
        },
        rows_copied,
        statement,
    }))
}

/// Whether the saved binlog file is still listed by the server; a purged
/// file means the checkpoint cannot be resumed from.
pub async fn binlog_file_exists(pool: &Pool, file: &str) -> Result<bool> {
    let mut conn = pool.get_conn().await?;
    let rows: Vec<Row> = conn.query("SHOW BINARY LOGS").await?;
    for row in rows {
        let name: String = row.get(0).unwrap_or_default();
        if name == file {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Periodically persists resumable state while copy/checksum runs.
pub struct Checkpointer {
    pool: Pool,
    schema: String,
    table: String,
    alter: String,
    copier: Arc<Copier>,
    client: Arc<Client>,
    /// Filled in once the checksum phase starts.
    checker: Arc<RwLock<Option<Arc<Checker>>>>,
}

impl Checkpointer {
    pub fn new(
        pool: Pool,
        schema: &str,
        table: &str,
        alter: &str,
        copier: Arc<Copier>,
        client: Arc<Client>,
        checker: Arc<RwLock<Option<Arc<Checker>>>>,
    ) -> Checkpointer {
        Checkpointer {
            pool,
            schema: schema.to_string(),
            table: table.to_string(),
            alter: alter.to_string(),
            copier,
            client,
            checker,
        }
    }

    /// Write one checkpoint row. Skips while the copier has no watermark
    /// yet (no contiguous chunk has completed).
    pub async fn write_checkpoint(&self) -> Result<()> {
        let Some(watermark) = self.copier.get_low_watermark().await? else {
            return Ok(());
        };
        let Some(binlog) = self.client.get_binlog_apply_position() else {
            return Ok(());
        };
        let checksum_watermark = match self.checker.read().await.as_ref() {
            Some(checker) => checker.get_low_watermark().await?,
            None => None,
        };
        let rows_copied = self.copier.rows_copied();
        info!(
            watermark = %watermark,
            binlog = %binlog,
            rows_copied,
            "checkpoint"
        );
        let name = checkpoint_table_name(&self.table);
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            format!(
                "INSERT INTO `{}`.`{name}`
                 (copier_watermark, checksum_watermark, binlog_name, binlog_pos, rows_copied, statement)
                 VALUES (?, ?, ?, ?, ?, ?)",
                self.schema
            ),
            (
                watermark,
                checksum_watermark,
                binlog.name,
                binlog.pos,
                rows_copied,
                &self.alter,
            ),
        )
        .await?;
        Ok(())
    }

    /// Spawn the checkpoint timer task. A final checkpoint is attempted
    /// on shutdown so a clean stop loses nothing.
    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; wait for the first real period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.write_checkpoint().await {
                            error!(error = %e, "error writing checkpoint");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = self.write_checkpoint().await {
                            error!(error = %e, "error writing final checkpoint");
                        }
                        return;
                    }
                }
            }
        })
    }
}
