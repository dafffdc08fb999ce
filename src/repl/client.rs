//! Binlog replication client.
//!
//! Tails the server's binary log on a dedicated connection, converts row
//! events into change intents buffered per subscription, and flushes them
//! to the shadow table with at-least-once, key-idempotent semantics.
//! Replay runs from the moment the client starts until cutover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Pool, Row};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dbconn::TableLock;
use crate::error::{Error, Result};
use crate::repl::subscription::Subscription;
use crate::table::{ChunkSizer, HighWatermark, TableInfo};

/// Starting batch size for delta flushes.
pub const DEFAULT_BATCH_SIZE: u64 = 1000;
/// Flush batch clamps; wider than the chunker's because a batch of key
/// lookups is much cheaper than a range scan.
pub const MIN_BATCH_SIZE: u64 = 5;
pub const MAX_BATCH_SIZE: u64 = 50_000;
/// Target wall-clock time per flush batch.
pub const DEFAULT_TARGET_BATCH_TIME: Duration = Duration::from_millis(500);
/// How often the periodic flusher drains the delta stores.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

const ER_MASTER_FATAL_READ: u16 = 1236;
const RECONNECT_RETRIES: u32 = 5;

/// A `(file, offset)` pair in the server's write history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogPosition {
    pub name: String,
    pub pos: u64,
}

impl BinlogPosition {
    /// Binlog files carry a numeric suffix (`binlog.000123`); compare by
    /// that, then by offset.
    fn file_index(&self) -> u64 {
        self.name
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.file_index(), self.pos).cmp(&(other.file_index(), other.pos))
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

/// A unique server_id for the replication connection, in a range far
/// away from real replicas.
pub fn new_server_id() -> u32 {
    rand::thread_rng().gen_range(1_000_000..2_000_000)
}

/// Feedback-tuned flush batch size, shared with subscriptions through an
/// `Arc` so they never need a reference to the whole client.
pub struct BatchSizer {
    sizer: Mutex<ChunkSizer>,
}

impl BatchSizer {
    pub fn new(target: Duration) -> BatchSizer {
        BatchSizer {
            sizer: Mutex::new(ChunkSizer::with_bounds(
                target,
                DEFAULT_BATCH_SIZE,
                MIN_BATCH_SIZE,
                MAX_BATCH_SIZE,
            )),
        }
    }

    pub fn target(&self) -> u64 {
        self.sizer.lock().unwrap().chunk_size
    }

    pub fn feedback(&self, _num_keys: usize, elapsed: Duration) {
        let mut sizer = self.sizer.lock().unwrap();
        let current = sizer.chunk_size;
        sizer.feedback(current, elapsed);
    }
}

impl Default for BatchSizer {
    fn default() -> BatchSizer {
        BatchSizer::new(DEFAULT_TARGET_BATCH_TIME)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub concurrency: usize,
    pub target_batch_time: Duration,
    pub server_id: u32,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            concurrency: 4,
            target_batch_time: DEFAULT_TARGET_BATCH_TIME,
            server_id: new_server_id(),
        }
    }
}

#[derive(Default)]
struct Positions {
    /// Last position acknowledged from the stream.
    buffered: Option<BinlogPosition>,
    /// Last position whose pre-flush delta stores are fully persisted.
    /// Invariant: flushed <= buffered.
    flushed: Option<BinlogPosition>,
}

pub struct Client {
    db: Pool,
    config: ClientConfig,
    batch: Arc<BatchSizer>,
    subscriptions: Arc<RwLock<HashMap<String, Arc<Subscription>>>>,
    positions: Arc<Mutex<Positions>>,
    start_pos: Mutex<Option<BinlogPosition>>,

    /// Set when a DDL statement touching a subscribed table is observed.
    table_changed_tx: watch::Sender<Option<String>>,
    /// Set when the stream dies unrecoverably.
    fatal_tx: watch::Sender<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    periodic_flush_enabled: Arc<AtomicBool>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(db: Pool, config: ClientConfig) -> Client {
        let (table_changed_tx, _) = watch::channel(None);
        let (fatal_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Client {
            db,
            batch: Arc::new(BatchSizer::new(config.target_batch_time)),
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            positions: Arc::new(Mutex::new(Positions::default())),
            start_pos: Mutex::new(None),
            table_changed_tx,
            fatal_tx,
            shutdown_tx,
            periodic_flush_enabled: Arc::new(AtomicBool::new(true)),
            stream_task: Mutex::new(None),
            flush_task: Mutex::new(None),
        }
    }

    /// Bind a source table to its shadow table. Must be called before
    /// `run`. The high-watermark handle enables dropping upserts the
    /// copier has not reached yet.
    pub fn add_subscription(
        &self,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        key_above: Option<Arc<HighWatermark>>,
    ) {
        let key = format!("{}.{}", table.schema_name, table.table_name);
        let sub = Arc::new(Subscription::new(
            table,
            new_table,
            Arc::clone(&self.batch),
            key_above,
        ));
        self.subscriptions.write().unwrap().insert(key, sub);
    }

    /// Start streaming from a known position instead of the server's
    /// current one (resume from checkpoint).
    pub fn set_pos(&self, pos: BinlogPosition) {
        *self.start_pos.lock().unwrap() = Some(pos);
    }

    /// Open the binlog stream and start the reader task. Fails with
    /// `BinlogNotFound` if the requested position has been purged, which
    /// lets a resume fall back to a fresh migration.
    pub async fn run(&self) -> Result<()> {
        let pos = match self.start_pos.lock().unwrap().clone() {
            Some(pos) => pos,
            None => self.master_position().await?,
        };
        {
            let mut positions = self.positions.lock().unwrap();
            positions.buffered = Some(pos.clone());
            positions.flushed = Some(pos.clone());
        }
        let stream = self.connect_stream(&pos).await?;
        info!(position = %pos, server_id = self.config.server_id, "binlog reader started");

        let schemas: Vec<String> = {
            let subs = self.subscriptions.read().unwrap();
            let mut schemas: Vec<String> =
                subs.values().map(|s| s.table.schema_name.clone()).collect();
            schemas.sort();
            schemas.dedup();
            schemas
        };
        let ctx = StreamContext {
            db: self.db.clone(),
            server_id: self.config.server_id,
            subscriptions: Arc::clone(&self.subscriptions),
            schemas,
            positions: Arc::clone(&self.positions),
            table_changed_tx: self.table_changed_tx.clone(),
            fatal_tx: self.fatal_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            current_file: pos.name.clone(),
        };
        let handle = tokio::spawn(ctx.event_loop(stream));
        *self.stream_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn connect_stream(&self, pos: &BinlogPosition) -> Result<BinlogStream> {
        let conn = self.db.get_conn().await?;
        let request = BinlogStreamRequest::new(self.config.server_id)
            .with_filename(pos.name.as_bytes())
            .with_pos(pos.pos);
        conn.get_binlog_stream(request)
            .await
            .map_err(|e| map_stream_error(e, &pos.name))
    }

    pub async fn master_position(&self) -> Result<BinlogPosition> {
        let mut conn = self.db.get_conn().await?;
        let row: Option<Row> = conn.query_first("SHOW MASTER STATUS").await?;
        let row = row.ok_or_else(|| {
            Error::Replication("SHOW MASTER STATUS returned no rows; is log_bin enabled?".into())
        })?;
        let name: String = row
            .get(0)
            .ok_or_else(|| Error::Replication("missing binlog file name".into()))?;
        let pos: u64 = row
            .get(1)
            .ok_or_else(|| Error::Replication("missing binlog position".into()))?;
        Ok(BinlogPosition { name, pos })
    }

    pub fn get_buffered_position(&self) -> Option<BinlogPosition> {
        self.positions.lock().unwrap().buffered.clone()
    }

    /// The position that is safe to checkpoint: everything up to it has
    /// been flushed to the shadow table.
    pub fn get_binlog_apply_position(&self) -> Option<BinlogPosition> {
        self.positions.lock().unwrap().flushed.clone()
    }

    pub async fn delta_len(&self) -> usize {
        let subs: Vec<Arc<Subscription>> =
            self.subscriptions.read().unwrap().values().cloned().collect();
        let mut total = 0;
        for sub in subs {
            total += sub.len().await;
        }
        total
    }

    /// Block until the reader has buffered past the server's current
    /// binlog position. Used before checksum chunks and by tests.
    pub async fn block_wait(&self) -> Result<()> {
        let target = self.master_position().await?;
        for _ in 0..600 {
            self.check_fatal()?;
            if let Some(buffered) = self.get_buffered_position() {
                if buffered >= target {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::Replication(format!(
            "timed out waiting for binlog reader to reach {target}"
        )))
    }

    /// Catch the reader up to the server's current position, then drain
    /// every subscription's delta store to the shadow table. The flushed
    /// position advances to the pre-drain buffered position, which never
    /// exceeds what is actually durable.
    pub async fn flush(&self) -> Result<()> {
        self.block_wait().await?;
        let pre_flush = self.get_buffered_position();
        self.drain(None).await?;
        if let Some(pos) = pre_flush {
            self.positions.lock().unwrap().flushed = Some(pos);
        }
        Ok(())
    }

    /// Final flush executed on the lock's own connection, so the writes
    /// land inside the `LOCK TABLES` scope. The subscribed tables cannot
    /// change while locked, so after the drain the buffered position is
    /// fully applied for them and becomes the flushed position.
    pub async fn flush_under_lock(&self, lock: &mut TableLock) -> Result<()> {
        self.block_wait().await?;
        self.drain(Some(lock)).await?;
        let mut positions = self.positions.lock().unwrap();
        positions.flushed = positions.buffered.clone();
        Ok(())
    }

    async fn drain(&self, mut lock: Option<&mut TableLock>) -> Result<()> {
        self.check_fatal()?;
        let subs: Vec<Arc<Subscription>> =
            self.subscriptions.read().unwrap().values().cloned().collect();
        for sub in subs {
            sub.flush(&self.db, self.config.concurrency, lock.as_deref_mut())
                .await?;
        }
        Ok(())
    }

    /// True when the flushed position has caught the buffered position
    /// and no deltas are pending. Cutover asserts this under the lock.
    pub async fn all_changes_flushed(&self) -> bool {
        if self.delta_len().await != 0 {
            return false;
        }
        let positions = self.positions.lock().unwrap();
        positions.flushed == positions.buffered
    }

    pub async fn set_key_above_watermark_optimization(&self, enabled: bool) {
        let subs: Vec<Arc<Subscription>> =
            self.subscriptions.read().unwrap().values().cloned().collect();
        for sub in subs {
            sub.set_key_above_watermark_optimization(enabled).await;
        }
    }

    /// Spawn the periodic flusher. It can be paused before cutover
    /// preparation without tearing the task down.
    pub fn start_periodic_flush(self: Arc<Self>, interval: Duration) {
        let enabled = Arc::clone(&self.periodic_flush_enabled);
        let mut shutdown = self.shutdown_tx.subscribe();
        let client = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }
                if let Err(e) = client.flush().await {
                    warn!(error = %e, "periodic flush failed");
                }
            }
        });
        *self.flush_task.lock().unwrap() = Some(handle);
    }

    pub fn stop_periodic_flush(&self) {
        self.periodic_flush_enabled.store(false, Ordering::Relaxed);
    }

    /// Receiver that fires when a DDL statement touched a subscribed
    /// table; the value is the offending query.
    pub fn table_changed_rx(&self) -> watch::Receiver<Option<String>> {
        self.table_changed_tx.subscribe()
    }

    pub fn fatal_rx(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    fn check_fatal(&self) -> Result<()> {
        let fatal = self.fatal_tx.borrow().clone();
        match fatal {
            Some(msg) => Err(Error::Replication(msg)),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.stream_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.flush_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn map_stream_error(e: mysql_async::Error, file: &str) -> Error {
    if let mysql_async::Error::Server(server) = &e {
        if server.code == ER_MASTER_FATAL_READ {
            return Error::BinlogNotFound {
                file: file.to_string(),
            };
        }
    }
    Error::Mysql(e)
}

/// Everything the reader task needs, detached from the client so the
/// client itself stays borrow-free.
struct StreamContext {
    db: Pool,
    server_id: u32,
    subscriptions: Arc<RwLock<HashMap<String, Arc<Subscription>>>>,
    /// Schemas the subscribed tables live in; DDL anywhere in these is
    /// surfaced.
    schemas: Vec<String>,
    positions: Arc<Mutex<Positions>>,
    table_changed_tx: watch::Sender<Option<String>>,
    fatal_tx: watch::Sender<Option<String>>,
    shutdown_rx: watch::Receiver<bool>,
    current_file: String,
}

/// Whether a statement event is DDL. Row-based replication still logs
/// these as statements.
fn is_ddl_statement(query: &str) -> bool {
    let upper = query.trim_start().to_uppercase();
    [
        "ALTER TABLE",
        "CREATE TABLE",
        "DROP TABLE",
        "RENAME TABLE",
        "TRUNCATE",
    ]
    .iter()
    .any(|prefix| upper.starts_with(prefix))
}

impl StreamContext {
    async fn event_loop(mut self, mut stream: BinlogStream) {
        let mut reconnects = 0u32;
        loop {
            let disconnected = self.drain_stream(&mut stream).await;
            if !disconnected {
                return; // clean shutdown
            }
            // Reconnect from the buffered position with bounded retries.
            loop {
                reconnects += 1;
                if reconnects > RECONNECT_RETRIES {
                    let _ = self
                        .fatal_tx
                        .send(Some("binlog stream disconnected and retries exhausted".into()));
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1) * reconnects).await;
                let pos = match self.positions.lock().unwrap().buffered.clone() {
                    Some(pos) => pos,
                    None => {
                        let _ = self.fatal_tx.send(Some("no position to reconnect from".into()));
                        return;
                    }
                };
                warn!(position = %pos, attempt = reconnects, "reconnecting binlog stream");
                let conn = match self.db.get_conn().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!(error = %e, "reconnect failed");
                        continue;
                    }
                };
                let request = BinlogStreamRequest::new(self.server_id)
                    .with_filename(pos.name.as_bytes())
                    .with_pos(pos.pos);
                match conn.get_binlog_stream(request).await {
                    Ok(new_stream) => {
                        self.current_file = pos.name.clone();
                        stream = new_stream;
                        reconnects = 0;
                        break;
                    }
                    Err(e) => {
                        if let mysql_async::Error::Server(server) = &e {
                            if server.code == ER_MASTER_FATAL_READ {
                                let _ = self.fatal_tx.send(Some(format!(
                                    "binlog file {} no longer available",
                                    pos.name
                                )));
                                return;
                            }
                        }
                        debug!(error = %e, "reconnect failed");
                    }
                }
            }
        }
    }

    /// Process events until shutdown (returns false) or disconnect
    /// (returns true).
    async fn drain_stream(&mut self, stream: &mut BinlogStream) -> bool {
        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = shutdown_rx.changed() => return false,
                event = stream.next() => {
                    match event {
                        None => {
                            warn!("binlog stream ended");
                            return true;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "binlog stream error");
                            return true;
                        }
                        Some(Ok(event)) => {
                            if let Err(e) = self.process_event(stream, event).await {
                                error!(error = %e, "fatal error processing binlog event");
                                let _ = self.fatal_tx.send(Some(e.to_string()));
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn process_event(
        &mut self,
        stream: &BinlogStream,
        event: mysql_async::binlog::events::Event,
    ) -> Result<()> {
        let log_pos = event.header().log_pos() as u64;
        let data = match event.read_data() {
            Ok(Some(data)) => data,
            // Events we cannot decode are skipped; row events for our
            // tables always decode.
            Ok(None) | Err(_) => {
                self.advance(log_pos);
                return Ok(());
            }
        };
        match data {
            EventData::RotateEvent(rotate) => {
                self.current_file = rotate.name().to_string();
            }
            EventData::QueryEvent(query_event) => {
                let schema = query_event.schema().to_string();
                let query = query_event.query().to_string();
                if self.is_schema_change(&schema, &query) {
                    warn!(schema = %schema, query = %query, "schema change observed in binlog");
                    let _ = self.table_changed_tx.send(Some(query));
                }
            }
            EventData::RowsEvent(rows_event) => {
                self.process_rows_event(stream, &rows_event).await?;
            }
            _ => {}
        }
        self.advance(log_pos);
        Ok(())
    }

    fn advance(&self, log_pos: u64) {
        if log_pos == 0 {
            return;
        }
        let mut positions = self.positions.lock().unwrap();
        positions.buffered = Some(BinlogPosition {
            name: self.current_file.clone(),
            pos: log_pos,
        });
    }

    /// Statement events are mostly uninteresting (we are row-based), but
    /// every DDL statement in a subscribed schema is surfaced. The
    /// runner decides what to do with it; it cannot make that call if
    /// the client pre-filters.
    fn is_schema_change(&self, schema: &str, query: &str) -> bool {
        is_ddl_statement(query) && self.schemas.iter().any(|s| s == schema)
    }

    async fn process_rows_event(
        &self,
        stream: &BinlogStream,
        rows_event: &RowsEventData<'_>,
    ) -> Result<()> {
        let table_id = match rows_event {
            RowsEventData::WriteRowsEvent(e) => e.table_id(),
            RowsEventData::UpdateRowsEvent(e) => e.table_id(),
            RowsEventData::DeleteRowsEvent(e) => e.table_id(),
            RowsEventData::WriteRowsEventV1(e) => e.table_id(),
            RowsEventData::UpdateRowsEventV1(e) => e.table_id(),
            RowsEventData::DeleteRowsEventV1(e) => e.table_id(),
            _ => return Ok(()),
        };
        let Some(tme) = stream.get_tme(table_id) else {
            return Ok(());
        };
        let key = format!("{}.{}", tme.database_name(), tme.table_name());
        let sub = {
            let subs = self.subscriptions.read().unwrap();
            subs.get(&key).cloned()
        };
        let Some(sub) = sub else {
            return Ok(());
        };

        for row in rows_event.rows(tme) {
            let (before, after) = match row {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, table = %key, "undecodable row event, skipping row");
                    continue;
                }
            };
            let before_key = before
                .and_then(|r| mysql_async::Row::try_from(r).ok())
                .and_then(|r| sub.table.extract_key_from_row(&r.unwrap()));
            let after_key = after
                .and_then(|r| mysql_async::Row::try_from(r).ok())
                .and_then(|r| sub.table.extract_key_from_row(&r.unwrap()));
            match (before_key, after_key) {
                // INSERT
                (None, Some(key)) => sub.key_has_changed(key, false).await,
                // DELETE
                (Some(key), None) => sub.key_has_changed(key, true).await,
                // UPDATE; a key change is a delete of the old key plus an
                // upsert of the new one.
                (Some(old), Some(new)) => {
                    if old != new {
                        sub.key_has_changed(old, true).await;
                    }
                    sub.key_has_changed(new, false).await;
                }
                (None, None) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_ordering() {
        let a = BinlogPosition { name: "binlog.000001".into(), pos: 1000 };
        let b = BinlogPosition { name: "binlog.000001".into(), pos: 2000 };
        let c = BinlogPosition { name: "binlog.000002".into(), pos: 4 };
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_server_id_range() {
        for _ in 0..100 {
            let id = new_server_id();
            assert!((1_000_000..2_000_000).contains(&id));
        }
    }

    #[test]
    fn test_ddl_statement_detection() {
        assert!(is_ddl_statement("ALTER TABLE t1 ADD COLUMN c INT"));
        assert!(is_ddl_statement("  create table ddl_t3 (a int primary key)"));
        assert!(is_ddl_statement("DROP TABLE t1"));
        assert!(is_ddl_statement("RENAME TABLE t1 TO t2"));
        assert!(is_ddl_statement("TRUNCATE t1"));
        assert!(!is_ddl_statement("INSERT INTO t1 VALUES (1)"));
        assert!(!is_ddl_statement("BEGIN"));
        assert!(!is_ddl_statement("ANALYZE TABLE t1"));
    }

    #[test]
    fn test_batch_sizer_clamps() {
        let sizer = BatchSizer::new(Duration::from_millis(500));
        assert_eq!(sizer.target(), DEFAULT_BATCH_SIZE);
        // Very slow batches shrink toward the minimum.
        for _ in 0..50 {
            sizer.feedback(100, Duration::from_secs(30));
        }
        assert_eq!(sizer.target(), MIN_BATCH_SIZE);
        // Very fast batches grow toward the maximum.
        for _ in 0..600 {
            sizer.feedback(100, Duration::from_micros(5));
        }
        assert_eq!(sizer.target(), MAX_BATCH_SIZE);
    }
}
