//! Retryable transactions.
//!
//! All chunk copies and delta flushes run through here. A transaction is
//! retried as a whole on transient errors; partial retry gets complicated
//! when a statement succeeds and a later deadlock rolls everything back.

use std::time::Duration;

use mysql_async::prelude::*;
use mysql_async::{IsolationLevel, Pool, Row, TxOpts};
use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};

const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
const ER_DEADLOCK: u16 = 1213;
const ER_READ_ONLY: u16 = 1290;
const ER_QUERY_KILLED: u16 = 1836;
const ER_DUP_ENTRY: u16 = 1062;
const ER_CAPACITY_EXCEEDED: u16 = 3170;

#[derive(Debug, Clone)]
pub struct RetryOpts {
    pub max_retries: u32,
    /// Duplicate-key warnings are expected when re-applying work after a
    /// resume (the copier uses INSERT IGNORE); everything else is fatal.
    pub ignore_dup_key_warnings: bool,
}

impl RetryOpts {
    pub fn new(max_retries: u32, ignore_dup_key_warnings: bool) -> RetryOpts {
        RetryOpts {
            max_retries,
            ignore_dup_key_warnings,
        }
    }
}

/// Whether an error is worth rolling back and retrying: deadlocks, lock
/// wait timeouts, read-only replicas mid-failover, killed queries and
/// connection loss.
pub fn is_retryable_error(err: &mysql_async::Error) -> bool {
    match err {
        mysql_async::Error::Server(server) => matches!(
            server.code,
            ER_LOCK_WAIT_TIMEOUT | ER_DEADLOCK | ER_READ_ONLY | ER_QUERY_KILLED
        ),
        mysql_async::Error::Io(_) => true,
        mysql_async::Error::Driver(_) => false,
        _ => false,
    }
}

/// Execute `stmts` in one READ COMMITTED transaction, retrying the whole
/// transaction with jittered exponential backoff on transient errors.
/// Returns the total affected-row count.
///
/// After every statement `SHOW WARNINGS` is inspected: duplicate-key
/// warnings pass when `ignore_dup_key_warnings` is set, range-optimizer
/// capacity warnings always pass (the query still ran, just unoptimized),
/// anything else aborts. An out-of-range warning here would mean silently
/// divergent data, which the checksum would only catch much later.
pub async fn retryable_transaction(
    pool: &Pool,
    opts: &RetryOpts,
    stmts: &[String],
) -> Result<u64> {
    let mut last_err: Option<Error> = None;
    for attempt in 0..opts.max_retries {
        if attempt > 0 {
            backoff(attempt).await;
        }
        match attempt_transaction(pool, opts, stmts).await {
            Ok(rows) => return Ok(rows),
            Err(Error::Mysql(e)) if is_retryable_error(&e) => {
                debug!(attempt, error = %e, "retrying transaction");
                last_err = Some(Error::Mysql(e));
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Other("transaction retries exhausted".into())))
}

async fn attempt_transaction(pool: &Pool, opts: &RetryOpts, stmts: &[String]) -> Result<u64> {
    let mut conn = pool.get_conn().await?;
    let mut tx_opts = TxOpts::default();
    tx_opts.with_isolation_level(IsolationLevel::ReadCommitted);
    let mut tx = conn.start_transaction(tx_opts).await?;
    let mut rows_affected = 0u64;
    for stmt in stmts {
        if stmt.is_empty() {
            continue;
        }
        tx.query_drop(stmt).await?;
        rows_affected += tx.affected_rows();
        check_warnings(&mut tx, opts, stmt).await?;
    }
    tx.commit().await?;
    Ok(rows_affected)
}

async fn check_warnings<'a>(
    tx: &mut mysql_async::Transaction<'a>,
    opts: &RetryOpts,
    stmt: &str,
) -> Result<()> {
    let warnings: Vec<Row> = tx.query("SHOW WARNINGS").await?;
    for warning in warnings {
        let code: u16 = warning.get(1).unwrap_or(0);
        let message: String = warning.get(2).unwrap_or_default();
        if code == ER_DUP_ENTRY && opts.ignore_dup_key_warnings {
            continue;
        }
        if code == ER_CAPACITY_EXCEEDED {
            continue;
        }
        return Err(Error::UnsafeWarning {
            message,
            query: stmt.to_string(),
        });
    }
    Ok(())
}

async fn backoff(attempt: u32) {
    let base = 50u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: u16) -> mysql_async::Error {
        mysql_async::Error::Server(mysql_async::ServerError {
            code,
            message: "test".into(),
            state: "HY000".into(),
        })
    }

    #[test]
    fn test_retryable_error_codes() {
        assert!(is_retryable_error(&server_error(ER_DEADLOCK)));
        assert!(is_retryable_error(&server_error(ER_LOCK_WAIT_TIMEOUT)));
        assert!(is_retryable_error(&server_error(ER_READ_ONLY)));
        assert!(is_retryable_error(&server_error(ER_QUERY_KILLED)));
        // Syntax errors and duplicate keys are not transient.
        assert!(!is_retryable_error(&server_error(1064)));
        assert!(!is_retryable_error(&server_error(ER_DUP_ENTRY)));
    }
}
