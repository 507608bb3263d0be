//! Per-topic message history: an append-only JSONL log on disk fronted by
//! a time-bounded in-memory cache.
//!
//! The log is authoritative. The cache only holds the most recent suffix of
//! it, so eviction changes how fast [`TopicStore::read_from`] answers, never
//! what it answers.

mod cache;
mod error;
mod log;
mod store;

pub use error::StoreError;
pub use log::{EPOCH_FILE_NAME, LOG_FILE_NAME, LogRecord};
pub use store::{list_topics, Backlog, TopicStore};
