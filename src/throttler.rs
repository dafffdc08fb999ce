//! Copy throttling.
//!
//! The copier polls `is_throttled()` before requesting each chunk. The
//! replication-lag implementation watches a replica on a timer and trips
//! while lag exceeds the configured maximum; binlog apply is never
//! throttled, because falling behind there only grows the final flush.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const LAG_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Throttler: Send + Sync {
    /// Start any background polling.
    async fn open(&self) -> Result<()>;
    fn is_throttled(&self) -> bool;
    fn close(&self);
}

/// The default: never throttles.
pub struct Noop;

#[async_trait]
impl Throttler for Noop {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    fn is_throttled(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// Throttles the copier while a replica reports lag above the maximum.
pub struct ReplicationLagThrottler {
    replica: Pool,
    max_lag: Duration,
    current_lag_secs: Arc<AtomicU64>,
    throttled: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl ReplicationLagThrottler {
    pub async fn new(replica: Pool, max_lag: Duration) -> Result<ReplicationLagThrottler> {
        let (shutdown, _) = watch::channel(false);
        let throttler = ReplicationLagThrottler {
            replica,
            max_lag,
            current_lag_secs: Arc::new(AtomicU64::new(0)),
            throttled: Arc::new(AtomicBool::new(false)),
            shutdown,
        };
        // Fail fast if the replica is not actually replicating; a user
        // who asked for lag-based throttling should not silently run
        // without it.
        throttler.update_lag().await?;
        Ok(throttler)
    }

    /// Most recently observed replica lag.
    pub fn current_lag(&self) -> Duration {
        Duration::from_secs(self.current_lag_secs.load(Ordering::Relaxed))
    }

    async fn update_lag(&self) -> Result<()> {
        let mut conn = self.replica.get_conn().await?;
        let row: Option<Row> = conn.query_first("SHOW REPLICA STATUS").await?;
        let row = row.ok_or_else(|| {
            Error::InvalidConfig("replica DSN does not point at a replica".to_string())
        })?;
        // Seconds_Behind_Source is NULL while the SQL thread is stopped;
        // treat that as unbounded lag.
        let lag: Option<u64> = row.get::<Option<u64>, _>("Seconds_Behind_Source").flatten();
        match lag {
            Some(secs) => {
                self.current_lag_secs.store(secs, Ordering::Relaxed);
                let throttled = Duration::from_secs(secs) > self.max_lag;
                if throttled && !self.throttled.swap(throttled, Ordering::Relaxed) {
                    warn!(lag_secs = secs, "replica lag above threshold, throttling copy");
                } else {
                    self.throttled.store(throttled, Ordering::Relaxed);
                }
            }
            None => {
                warn!("replica SQL thread not running; throttling copy");
                self.current_lag_secs.store(u64::MAX, Ordering::Relaxed);
                self.throttled.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Throttler for ReplicationLagThrottler {
    async fn open(&self) -> Result<()> {
        let replica = self.replica.clone();
        let max_lag = self.max_lag;
        let lag = Arc::clone(&self.current_lag_secs);
        let throttled = Arc::clone(&self.throttled);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LAG_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let Ok(mut conn) = replica.get_conn().await else {
                    // Can't see the replica: assume the worst.
                    throttled.store(true, Ordering::Relaxed);
                    continue;
                };
                let row: Option<Row> = match conn.query_first("SHOW REPLICA STATUS").await {
                    Ok(row) => row,
                    Err(e) => {
                        debug!(error = %e, "replica status poll failed");
                        throttled.store(true, Ordering::Relaxed);
                        continue;
                    }
                };
                let secs: Option<u64> = row
                    .and_then(|r| r.get::<Option<u64>, _>("Seconds_Behind_Source"))
                    .flatten();
                match secs {
                    Some(secs) => {
                        lag.store(secs, Ordering::Relaxed);
                        throttled.store(Duration::from_secs(secs) > max_lag, Ordering::Relaxed);
                    }
                    None => throttled.store(true, Ordering::Relaxed),
                }
            }
        });
        Ok(())
    }

    fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Relaxed)
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_never_throttles() {
        let t = Noop;
        t.open().await.unwrap();
        assert!(!t.is_throttled());
        t.close();
    }
}
