//! Database connection plumbing: standardized pools, retryable
//! transactions and the table lock primitive.

mod lock;
mod trx;

pub use lock::TableLock;
pub use trx::{is_retryable_error, retryable_transaction, RetryOpts};

use mysql_async::{Opts, OptsBuilder, Pool};

/// Connection-level settings applied to every pooled connection.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub lock_wait_timeout: u64,
    pub innodb_lock_wait_timeout: u64,
    pub max_retries: u32,
}

impl Default for DbConfig {
    fn default() -> DbConfig {
        DbConfig {
            lock_wait_timeout: 30,
            innodb_lock_wait_timeout: 3,
            max_retries: 5,
        }
    }
}

/// Session statements run on every new connection. The SQL mode is
/// cleared so historical values (e.g. zero dates) copy verbatim, and the
/// time zone is pinned so temporal values render identically on both
/// sides of the copy. mysqldump does the same.
fn session_setup(config: &DbConfig) -> Vec<String> {
    vec![
        "SET time_zone='+00:00'".to_string(),
        "SET sql_mode=''".to_string(),
        "SET NAMES binary".to_string(),
        format!(
            "SET innodb_lock_wait_timeout={}",
            config.innodb_lock_wait_timeout
        ),
        format!("SET lock_wait_timeout={}", config.lock_wait_timeout),
    ]
}

/// Build a standardized pool from host/credential parts. `host` may carry
/// an explicit `:port`; 3306 is assumed otherwise.
pub fn new_pool(
    host: &str,
    username: &str,
    password: &str,
    database: &str,
    config: &DbConfig,
) -> Pool {
    let (hostname, port) = split_host_port(host);
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(hostname)
        .tcp_port(port)
        .user(Some(username))
        .pass(Some(password))
        .db_name(Some(database))
        .setup(session_setup(config))
        .into();
    Pool::new(opts)
}

/// Build a standardized pool from a DSN/URL, for the replica connection.
pub fn new_pool_from_url(url: &str, config: &DbConfig) -> crate::error::Result<Pool> {
    let opts = Opts::from_url(url).map_err(mysql_async::Error::from)?;
    let opts: Opts = OptsBuilder::from_opts(opts)
        .setup(session_setup(config))
        .into();
    Ok(Pool::new(opts))
}

pub fn split_host_port(host: &str) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => (h.to_string(), port),
            Err(_) => (host.to_string(), 3306),
        },
        None => (host.to_string(), 3306),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db.example.com"), ("db.example.com".into(), 3306));
        assert_eq!(split_host_port("db.example.com:3307"), ("db.example.com".into(), 3307));
        assert_eq!(split_host_port("127.0.0.1:4000"), ("127.0.0.1".into(), 4000));
    }

    #[test]
    fn test_session_setup_pins_environment() {
        let setup = session_setup(&DbConfig::default());
        assert!(setup.iter().any(|s| s == "SET sql_mode=''"));
        assert!(setup.iter().any(|s| s == "SET time_zone='+00:00'"));
        assert!(setup.iter().any(|s| s.contains("lock_wait_timeout=30")));
    }
}
