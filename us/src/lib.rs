//! understore - embedded record store for Undercity
//!
//! A single SQLite database (WAL mode) holds every persistent collection as
//! JSON payloads plus an index table for field-equality queries. Domain
//! types implement [`Record`] to declare their collection and indexed
//! fields; the store is otherwise schema-free.
//!
//! Side-state that external tools read (rate-limit snapshots, live metrics)
//! stays in JSON files written atomically via temp-file + rename; see
//! [`json`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

pub mod json;
mod store;

pub use json::{read_json_opt, read_json_or_default, write_json_atomic};
pub use store::Store;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value that can be stored in a record index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexValue {
    String(String),
    Int(i64),
}

impl std::fmt::Display for IndexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Filter operation for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// A single query filter over an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter on an indexed field
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

/// A persistable record with indexed fields
pub trait Record: Serialize + DeserializeOwned + Clone {
    /// Unique record ID
    fn id(&self) -> &str;

    /// Last-update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Table name for this record type (lowercase alphanumeric + underscore)
    fn collection_name() -> &'static str;

    /// Fields to index for list() queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

/// Errors from store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_recent() {
        let ts = now_ms();
        // After 2020-01-01 and before 2100-01-01
        assert!(ts > 1_577_836_800_000);
        assert!(ts < 4_102_444_800_000);
    }

    #[test]
    fn test_index_value_display() {
        assert_eq!(IndexValue::String("pending".into()).to_string(), "pending");
        assert_eq!(IndexValue::Int(42).to_string(), "42");
    }

    #[test]
    fn test_filter_eq_constructor() {
        let f = Filter::eq("status", "pending");
        assert_eq!(f.field, "status");
        assert_eq!(f.op, FilterOp::Eq);
        assert_eq!(f.value, IndexValue::String("pending".into()));
    }
}
