//! The migration runner: a state machine driving preflight, setup or
//! resume, copy, checksum, cutover and cleanup.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mysql_async::prelude::*;
use mysql_async::Pool;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::checkpoint::{
    binlog_file_exists, create_checkpoint_table, drop_checkpoint_table, read_latest_checkpoint,
    Checkpointer,
};
use crate::checksum::{Checker, CheckerConfig};
use crate::copier::{Copier, CopierConfig};
use crate::cutover::CutOver;
use crate::dbconn::{self, DbConfig};
use crate::error::{Error, Result};
use crate::repl::{new_server_id, Client, ClientConfig, DEFAULT_FLUSH_INTERVAL};
use crate::statement;
use crate::table::TableInfo;
use crate::throttler::{Noop, ReplicationLagThrottler, Throttler};
use crate::utils::{checkpoint_table_name, old_table_name, shadow_table_name, trim_alter};
use crate::Migration;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const TABLE_STAT_UPDATE_INTERVAL: Duration = Duration::from_secs(300);

/// MySQL identifiers are limited to 64 characters; `_<t>_chkpnt` is the
/// longest derived name.
const MAX_TABLE_NAME_LENGTH: usize = 64 - "_".len() - "_chkpnt".len();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
enum MigrationState {
    Initial = 0,
    CopyRows,
    ApplyChangeset,
    AnalyzeTable,
    Checksum,
    PostChecksum,
    CutOver,
    Close,
    ErrCleanup,
}

impl MigrationState {
    fn from_i32(v: i32) -> MigrationState {
        match v {
            1 => MigrationState::CopyRows,
            2 => MigrationState::ApplyChangeset,
            3 => MigrationState::AnalyzeTable,
            4 => MigrationState::Checksum,
            5 => MigrationState::PostChecksum,
            6 => MigrationState::CutOver,
            7 => MigrationState::Close,
            8 => MigrationState::ErrCleanup,
            _ => MigrationState::Initial,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Initial => "initial",
            MigrationState::CopyRows => "copyRows",
            MigrationState::ApplyChangeset => "applyChangeset",
            MigrationState::AnalyzeTable => "analyzeTable",
            MigrationState::Checksum => "checksum",
            MigrationState::PostChecksum => "postChecksum",
            MigrationState::CutOver => "cutOver",
            MigrationState::Close => "close",
            MigrationState::ErrCleanup => "errCleanup",
        }
    }
}

struct MigrationParts {
    new_table: Arc<TableInfo>,
    client: Arc<Client>,
    copier: Arc<Copier>,
    checksum_watermark: Option<String>,
}

pub struct Runner {
    migration: Migration,
    db_config: DbConfig,
    state: Arc<AtomicI32>,
    shutdown_tx: watch::Sender<bool>,
    start_time: Instant,
    checksum_required: bool,

    pub used_instant_ddl: bool,
    pub used_inplace_ddl: bool,
    pub used_resume_from_checkpoint: bool,
}

impl Runner {
    pub fn new(migration: Migration) -> Result<Runner> {
        if migration.host.is_empty() {
            return Err(Error::InvalidConfig("host is required".into()));
        }
        if migration.database.is_empty() {
            return Err(Error::InvalidConfig("schema name is required".into()));
        }
        if migration.table.is_empty() {
            return Err(Error::InvalidConfig("table name is required".into()));
        }
        if migration.alter.is_empty() {
            return Err(Error::InvalidConfig("alter statement is required".into()));
        }
        let db_config = DbConfig {
            lock_wait_timeout: migration.lock_wait_timeout.as_secs().max(1),
            ..DbConfig::default()
        };
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Runner {
            migration,
            db_config,
            state: Arc::new(AtomicI32::new(MigrationState::Initial as i32)),
            shutdown_tx,
            start_time: Instant::now(),
            checksum_required: false,
            used_instant_ddl: false,
            used_inplace_ddl: false,
            used_resume_from_checkpoint: false,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.start_time = Instant::now();
        let m = self.migration.clone();
        info!(
            threads = m.threads,
            target_chunk_time = ?m.target_chunk_time,
            table = %format!("{}.{}", m.database, m.table),
            alter = %m.alter,
            "starting migration"
        );
        let pool = dbconn::new_pool(
            &m.host,
            &m.username,
            &m.password,
            &m.database,
            &self.db_config,
        );

        let mut table = TableInfo::new(&m.database, &m.table);
        table.set_info(&pool).await?;
        let table = Arc::new(table);

        // MySQL's own DDL is faster whenever it is compatible; let the
        // server decide instead of maintaining a compatibility matrix.
        if self.attempt_mysql_ddl(&pool, &table).await {
            info!(
                instant_ddl = self.used_instant_ddl,
                inplace_ddl = self.used_inplace_ddl,
                "apply complete"
            );
            pool.disconnect().await?;
            return Ok(());
        }

        self.preflight_checks(&pool, &table).await?;

        // A stray _old table from an earlier failed run blocks the
        // rename later; clear it now.
        self.drop_old_table(&pool).await?;

        let throttler: Arc<dyn Throttler> = match &m.replica_dsn {
            Some(dsn) => {
                let replica = dbconn::new_pool_from_url(dsn, &self.db_config)?;
                Arc::new(ReplicationLagThrottler::new(replica, m.replica_max_lag).await?)
            }
            None => Arc::new(Noop),
        };
        throttler.open().await?;

        let parts = self.setup(&pool, &table, Arc::clone(&throttler)).await?;
        let MigrationParts {
            new_table,
            client,
            copier,
            checksum_watermark,
        } = parts;

        // Background tasks: statistics refresh, periodic delta flush,
        // status reporting and checkpointing.
        self.spawn_table_stats_task(&pool, &table);
        Arc::clone(&client).start_periodic_flush(DEFAULT_FLUSH_INTERVAL);
        self.spawn_status_reporter(&copier, &client);
        let checker_slot: Arc<RwLock<Option<Arc<Checker>>>> = Arc::new(RwLock::new(None));
        let checkpointer = Arc::new(Checkpointer::new(
            pool.clone(),
            &m.database,
            &m.table,
            &trim_alter(&m.alter),
            Arc::clone(&copier),
            Arc::clone(&client),
            Arc::clone(&checker_slot),
        ));
        let checkpoint_task = checkpointer.run(self.shutdown_tx.subscribe());

        // The main copy.
        self.set_state(MigrationState::CopyRows, &client).await;
        let copy_result = self
            .guard(
                &pool,
                &client,
                Arc::clone(&copier).run(self.shutdown_tx.subscribe()),
            )
            .await;
        if let Err(e) = copy_result {
            self.fail(&pool, &client, &throttler).await;
            return Err(e);
        }

        // Copy is done: every key now exists in the shadow table's key
        // space, so the skip-above-watermark optimization must be off.
        self.set_state(MigrationState::ApplyChangeset, &client).await;
        if let Err(e) = self
            .prepare_for_cutover(&pool, &table, &new_table, &client, &checker_slot, &checksum_watermark)
            .await
        {
            self.fail(&pool, &client, &throttler).await;
            return Err(e);
        }

        // Final cutover under lock.
        self.set_state(MigrationState::CutOver, &client).await;
        let old_name = old_table_name(&m.table);
        self.drop_old_table(&pool).await?;
        let cutover = CutOver::new(
            pool.clone(),
            Arc::clone(&table),
            Arc::clone(&new_table),
            old_name.clone(),
            Arc::clone(&client),
            self.db_config.max_retries,
        );
        if let Err(e) = self.guard(&pool, &client, cutover.run()).await {
            self.fail(&pool, &client, &throttler).await;
            return Err(e);
        }

        self.set_state(MigrationState::Close, &client).await;
        let _ = self.shutdown_tx.send(true);
        let _ = checkpoint_task.await;
        if !m.skip_drop_old_table {
            self.drop_old_table(&pool).await?;
        } else {
            info!(table = %old_name, "keeping old table as requested");
        }
        drop_checkpoint_table(&pool, &m.database, &m.table).await?;
        client.close();
        throttler.close();

        info!(
            instant_ddl = self.used_instant_ddl,
            inplace_ddl = self.used_inplace_ddl,
            resumed = self.used_resume_from_checkpoint,
            rows_copied = copier.rows_copied(),
            total_time = ?self.start_time.elapsed(),
            "apply complete"
        );
        pool.disconnect().await?;
        Ok(())
    }

    /// Race a phase against schema-change and replication-fatal signals.
    /// Once the cutover state is reached, schema-change notifications are
    /// ignored: the cutover's own RENAME (and the old-table drop) appear
    /// in the binlog like any other DDL.
    async fn guard<F>(&self, pool: &Pool, client: &Arc<Client>, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let mut table_changed = client.table_changed_rx();
        let mut fatal = client.fatal_rx();
        // A notification sent before this phase started would otherwise
        // be missed: receivers only wake on changes after subscription.
        if table_changed.borrow().is_some() && self.current_state() < MigrationState::CutOver {
            let _ = drop_checkpoint_table(pool, &self.migration.database, &self.migration.table)
                .await;
            return Err(Error::TableChangedDuringMigration);
        }
        if let Some(msg) = fatal.borrow().clone() {
            return Err(Error::Replication(msg));
        }
        tokio::pin!(fut);
        loop {
            tokio::select! {
                res = &mut fut => return res,
                _ = table_changed.changed() => {
                    if self.current_state() >= MigrationState::CutOver {
                        continue;
                    }
                    let query = table_changed.borrow().clone().unwrap_or_default();
                    error!(query = %query, "table definition changed during migration");
                    // Invalidate the checkpoint: resuming against a
                    // changed definition would be permanently wedged,
                    // starting over is the better outcome.
                    let _ = drop_checkpoint_table(
                        pool,
                        &self.migration.database,
                        &self.migration.table,
                    )
                    .await;
                    return Err(Error::TableChangedDuringMigration);
                }
                _ = fatal.changed() => {
                    let msg = fatal.borrow().clone().unwrap_or_default();
                    return Err(Error::Replication(msg));
                }
            }
        }
    }

    fn current_state(&self) -> MigrationState {
        MigrationState::from_i32(self.state.load(Ordering::SeqCst))
    }

    async fn fail(&self, _pool: &Pool, client: &Arc<Client>, throttler: &Arc<dyn Throttler>) {
        self.state
            .store(MigrationState::ErrCleanup as i32, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        client.close();
        throttler.close();
        // The checkpoint and shadow tables are deliberately left behind
        // so the migration can resume.
    }

    async fn attempt_mysql_ddl(&mut self, pool: &Pool, table: &TableInfo) -> bool {
        let alter = trim_alter(&self.migration.alter);
        let instant = format!(
            "ALTER TABLE {} {alter}, ALGORITHM=INSTANT",
            table.quoted_name
        );
        if self.exec_silent(pool, &instant).await {
            self.used_instant_ddl = true;
            return true;
        }
        // INPLACE is gated because it can block replicas for the full
        // duration of the operation.
        if self.migration.force_inplace {
            let inplace = format!(
                "ALTER TABLE {} {alter}, ALGORITHM=INPLACE, LOCK=NONE",
                table.quoted_name
            );
            if self.exec_silent(pool, &inplace).await {
                self.used_inplace_ddl = true;
                return true;
            }
        }
        false
    }

    async fn exec_silent(&self, pool: &Pool, stmt: &str) -> bool {
        match pool.get_conn().await {
            Ok(mut conn) => conn.query_drop(stmt).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn preflight_checks(&mut self, pool: &Pool, _table: &TableInfo) -> Result<()> {
        let alter = trim_alter(&self.migration.alter);
        statement::assert_alter_supported(&alter)?;
        if statement::alter_contains_add_unique(&alter) {
            info!("ALTER adds a UNIQUE index; checksum is now required");
            self.checksum_required = true;
        }
        if self.migration.table.len() > MAX_TABLE_NAME_LENGTH {
            return Err(Error::InvalidConfig(format!(
                "table name '{}' is too long; derived table names would exceed 64 characters",
                self.migration.table
            )));
        }
        let mut conn = pool.get_conn().await?;
        let version: String = conn
            .query_first("SELECT VERSION()")
            .await?
            .unwrap_or_default();
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if major < 8 {
            return Err(Error::InvalidConfig(format!(
                "MySQL 8.0 or newer is required, server reports {version}"
            )));
        }
        let log_bin: String = conn
            .query_first("SELECT @@global.log_bin")
            .await?
            .unwrap_or_default();
        if log_bin != "1" && log_bin.to_uppercase() != "ON" {
            return Err(Error::InvalidConfig(
                "binary logging (log_bin) must be enabled".into(),
            ));
        }
        let format: String = conn
            .query_first("SELECT @@global.binlog_format")
            .await?
            .unwrap_or_default();
        if format.to_uppercase() != "ROW" {
            return Err(Error::InvalidConfig(format!(
                "binlog_format must be ROW, found {format}"
            )));
        }
        let row_image: String = conn
            .query_first("SELECT @@global.binlog_row_image")
            .await?
            .unwrap_or_default();
        if row_image.to_uppercase() != "FULL" {
            return Err(Error::InvalidConfig(format!(
                "binlog_row_image must be FULL, found {row_image}"
            )));
        }
        Ok(())
    }

    /// Resume from a checkpoint when possible; otherwise start fresh.
    /// In strict mode the distinguishable resume failures surface
    /// instead of falling through.
    async fn setup(
        &mut self,
        pool: &Pool,
        table: &Arc<TableInfo>,
        throttler: Arc<dyn Throttler>,
    ) -> Result<MigrationParts> {
        match self
            .resume_from_checkpoint(pool, table, Arc::clone(&throttler))
            .await
        {
            Ok(parts) => {
                // Partially re-applied chunks make duplicate key errors
                // expected; only the checksum can prove the result, so
                // it is no longer optional.
                self.checksum_required = true;
                self.used_resume_from_checkpoint = true;
                Ok(parts)
            }
            Err(e) => {
                if self.migration.strict
                    && matches!(e, Error::MismatchedAlter | Error::BinlogNotFound { .. })
                {
                    return Err(e);
                }
                info!(reason = %e, "could not resume from checkpoint, starting fresh migration");
                self.fresh_setup(pool, table, throttler).await
            }
        }
    }

    async fn fresh_setup(
        &mut self,
        pool: &Pool,
        table: &Arc<TableInfo>,
        throttler: Arc<dyn Throttler>,
    ) -> Result<MigrationParts> {
        let m = &self.migration;
        let new_name = shadow_table_name(&m.table);
        let mut conn = pool.get_conn().await?;
        conn.query_drop(format!(
            "DROP TABLE IF EXISTS `{}`.`{new_name}`",
            m.database
        ))
        .await?;
        conn.query_drop(format!(
            "CREATE TABLE `{}`.`{new_name}` LIKE {}",
            m.database, table.quoted_name
        ))
        .await?;
        conn.query_drop(format!(
            "ALTER TABLE `{}`.`{new_name}` {}",
            m.database,
            trim_alter(&m.alter)
        ))
        .await?;
        drop(conn);

        let mut new_table = TableInfo::new(&m.database, &new_name);
        new_table.set_info(pool).await?;
        let new_table = Arc::new(new_table);

        create_checkpoint_table(pool, &m.database, &m.table).await?;

        let copier = Arc::new(Copier::new(
            pool.clone(),
            Arc::clone(table),
            Arc::clone(&new_table),
            CopierConfig {
                concurrency: m.threads,
                target_chunk_time: m.target_chunk_time,
                max_retries: self.db_config.max_retries,
                throttler,
            },
        ));
        let client = Arc::new(Client::new(
            pool.clone(),
            ClientConfig {
                concurrency: m.threads,
                server_id: new_server_id(),
                ..ClientConfig::default()
            },
        ));
        client.add_subscription(
            Arc::clone(table),
            Arc::clone(&new_table),
            Some(copier.high_watermark_handle()),
        );
        // Start the binlog feed now, before any rows are copied.
        client.run().await?;
        Ok(MigrationParts {
            new_table,
            client,
            copier,
            checksum_watermark: None,
        })
    }

    async fn resume_from_checkpoint(
        &mut self,
        pool: &Pool,
        table: &Arc<TableInfo>,
        throttler: Arc<dyn Throttler>,
    ) -> Result<MigrationParts> {
        let m = &self.migration;
        let new_name = shadow_table_name(&m.table);

        let mut conn = pool.get_conn().await?;
        conn.query_drop(format!(
            "SELECT 1 FROM `{}`.`{new_name}` LIMIT 1",
            m.database
        ))
        .await
        .map_err(|_| Error::Other(format!("could not read from table '{new_name}'")))?;
        drop(conn);

        let record = read_latest_checkpoint(pool, &m.database, &m.table)
            .await
            .map_err(|_| {
                Error::Other(format!(
                    "could not read from table '{}'",
                    checkpoint_table_name(&m.table)
                ))
            })?
            .ok_or_else(|| Error::Other("checkpoint table is empty".into()))?;

        if trim_alter(&record.statement) != trim_alter(&m.alter) {
            return Err(Error::MismatchedAlter);
        }
        if !binlog_file_exists(pool, &record.binlog.name).await? {
            return Err(Error::BinlogNotFound {
                file: record.binlog.name.clone(),
            });
        }

        let mut new_table = TableInfo::new(&m.database, &new_name);
        new_table.set_info(pool).await?;
        let new_table = Arc::new(new_table);

        let copier = Arc::new(
            Copier::new_from_checkpoint(
                pool.clone(),
                Arc::clone(table),
                Arc::clone(&new_table),
                CopierConfig {
                    concurrency: m.threads,
                    target_chunk_time: m.target_chunk_time,
                    max_retries: self.db_config.max_retries,
                    throttler,
                },
                &record.copier_watermark,
                record.rows_copied,
            )
            .await?,
        );
        let client = Arc::new(Client::new(
            pool.clone(),
            ClientConfig {
                concurrency: m.threads,
                server_id: new_server_id(),
                ..ClientConfig::default()
            },
        ));
        client.add_subscription(
            Arc::clone(table),
            Arc::clone(&new_table),
            Some(copier.high_watermark_handle()),
        );
        client.set_pos(record.binlog.clone());
        // A race remains: the file existed a moment ago but could be
        // purged before the stream opens. The error is the same.
        if let Err(e) = client.run().await {
            warn!(
                file = %record.binlog.name,
                pos = record.binlog.pos,
                "resuming from checkpoint failed because the previous binlog position could not be acquired"
            );
            return Err(e);
        }
        warn!(
            watermark = %record.copier_watermark,
            file = %record.binlog.name,
            pos = record.binlog.pos,
            rows_copied = record.rows_copied,
            "resuming from checkpoint"
        );
        Ok(MigrationParts {
            new_table,
            client,
            copier,
            checksum_watermark: record.checksum_watermark,
        })
    }

    /// Flush, analyze and (optionally) checksum before the cutover.
    async fn prepare_for_cutover(
        &mut self,
        pool: &Pool,
        table: &Arc<TableInfo>,
        new_table: &Arc<TableInfo>,
        client: &Arc<Client>,
        checker_slot: &Arc<RwLock<Option<Arc<Checker>>>>,
        checksum_watermark: &Option<String>,
    ) -> Result<()> {
        // Periodic flushing stops here: ANALYZE and the table lock must
        // not race a background flush. The checksum drives its own
        // flushes per chunk.
        client.stop_periodic_flush();
        client.flush().await?;

        self.set_state(MigrationState::AnalyzeTable, client).await;
        // Bulk loading leaves the statistics stale enough to send
        // post-cutover query plans sideways.
        let analyze = format!("ANALYZE TABLE {}", new_table.quoted_name);
        info!(query = %analyze, "running");
        let mut conn = pool.get_conn().await?;
        conn.query_drop(analyze).await?;
        drop(conn);

        if self.migration.checksum || self.checksum_required {
            self.set_state(MigrationState::Checksum, client).await;
            let checker = Arc::new(Checker::new(
                pool.clone(),
                Arc::clone(table),
                Arc::clone(new_table),
                Arc::clone(client),
                CheckerConfig {
                    concurrency: self.migration.threads,
                    target_chunk_time: self.migration.target_chunk_time,
                    fix_differences: self.migration.fix_differences,
                    max_retries: self.db_config.max_retries,
                },
            ));
            *checker_slot.write().await = Some(Arc::clone(&checker));
            self.guard(
                pool,
                client,
                Arc::clone(&checker).run(checksum_watermark.as_deref()),
            )
            .await?;
            info!("checksum passed");
            // A long checksum accumulates fresh deltas; apply them
            // before the cutover takes its lock.
            self.set_state(MigrationState::PostChecksum, client).await;
            client.flush().await?;
        }
        Ok(())
    }

    async fn drop_old_table(&self, pool: &Pool) -> Result<()> {
        let old_name = old_table_name(&self.migration.table);
        let mut conn = pool.get_conn().await?;
        conn.query_drop(format!(
            "DROP TABLE IF EXISTS `{}`.`{old_name}`",
            self.migration.database
        ))
        .await?;
        Ok(())
    }

    async fn set_state(&self, state: MigrationState, client: &Arc<Client>) {
        self.state.store(state as i32, Ordering::SeqCst);
        // Past the copy phase every key must be buffered: the copier
        // will never revisit the key space.
        if state > MigrationState::CopyRows {
            client.set_key_above_watermark_optimization(false).await;
        }
    }

    fn spawn_table_stats_task(&self, pool: &Pool, table: &Arc<TableInfo>) {
        let pool = pool.clone();
        let table = Arc::clone(table);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TABLE_STAT_UPDATE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = table.update_table_statistics(&pool).await {
                            warn!(error = %e, "could not update table statistics");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    fn spawn_status_reporter(&self, copier: &Arc<Copier>, client: &Arc<Client>) {
        let copier = Arc::clone(copier);
        let client = Arc::clone(client);
        let state = Arc::clone(&self.state);
        let start_time = self.start_time;
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let current = MigrationState::from_i32(state.load(Ordering::SeqCst));
                if current > MigrationState::CutOver {
                    return;
                }
                let deltas = client.delta_len().await;
                match current {
                    MigrationState::CopyRows => {
                        let progress = copier.progress_summary().await;
                        info!(
                            state = current.as_str(),
                            copy_progress = %progress,
                            binlog_deltas = deltas,
                            total_time = ?start_time.elapsed(),
                            "migration status"
                        );
                    }
                    MigrationState::ApplyChangeset
                    | MigrationState::Checksum
                    | MigrationState::PostChecksum => {
                        info!(
                            state = current.as_str(),
                            binlog_deltas = deltas,
                            total_time = ?start_time.elapsed(),
                            "migration status"
                        );
                    }
                    _ => {}
                }
            }
        });
    }
}
