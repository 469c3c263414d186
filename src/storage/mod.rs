//! Row storage for partitions
//!
//! Each partition owns one [`RowStore`] exclusively; only that partition's
//! executor touches it. Records are flat JSON objects keyed by table and a
//! canonical primary-key string.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryRowStore;
pub use sled_store::SledRowStore;

use crate::core::errors::Result;
use serde_json::Value;
use std::sync::Arc;

/// A stored row: field name -> value
pub type Record = serde_json::Map<String, Value>;

/// Builds the row store for a partition
pub type StoreFactory = Arc<dyn Fn(usize) -> Result<Arc<dyn RowStore>> + Send + Sync>;

/// Result of an insert-only put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyExists,
}

/// Result of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
}

/// Keyed record store owned by one partition
pub trait RowStore: Send + Sync {
    /// Fetch a row
    fn get(&self, table: &str, key: &str) -> Result<Option<Record>>;

    /// Insert a row; never overwrites an existing one
    fn put(&self, table: &str, key: &str, record: Record) -> Result<PutOutcome>;

    /// Merge `fields` into an existing row; never creates one
    fn update(&self, table: &str, key: &str, fields: Record) -> Result<UpdateOutcome>;

    /// Remove a row; returns whether it existed
    fn delete(&self, table: &str, key: &str) -> Result<bool>;

    /// Total number of rows across all tables
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Canonical lookup key for a primary-key value.
///
/// Strings are used verbatim, every other value by its JSON text, so `1` and
/// `"1"` address the same row.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Factory producing a fresh in-memory store per partition
pub fn memory_factory() -> StoreFactory {
    Arc::new(|_| Ok(Arc::new(MemoryRowStore::new()) as Arc<dyn RowStore>))
}

/// Factory producing temporary sled stores, one per partition
pub fn temporary_sled_factory() -> StoreFactory {
    Arc::new(|_| Ok(Arc::new(SledRowStore::temporary()?) as Arc<dyn RowStore>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_string() {
        assert_eq!(key_string(&json!("abc")), "abc");
        assert_eq!(key_string(&json!(1)), "1");
        assert_eq!(key_string(&json!(1)), key_string(&json!("1")));
        assert_eq!(key_string(&json!(true)), "true");
    }
}
