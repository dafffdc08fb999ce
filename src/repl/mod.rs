//! Binlog replication: client, subscriptions and delta stores.

mod client;
mod subscription;

pub use client::{
    new_server_id, BatchSizer, BinlogPosition, Client, ClientConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_TARGET_BATCH_TIME, MAX_BATCH_SIZE, MIN_BATCH_SIZE,
};
pub use subscription::Subscription;
