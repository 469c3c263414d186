use super::{PutOutcome, Record, RowStore, UpdateOutcome};
use crate::core::errors::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// In-memory row store keyed by `(table, key)`
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    rows: DashMap<(String, String), Record>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl RowStore for MemoryRowStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Record>> {
        Ok(self
            .rows
            .get(&(table.to_string(), key.to_string()))
            .map(|row| row.value().clone()))
    }

    fn put(&self, table: &str, key: &str, record: Record) -> Result<PutOutcome> {
        match self.rows.entry((table.to_string(), key.to_string())) {
            Entry::Occupied(_) => Ok(PutOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn update(&self, table: &str, key: &str, fields: Record) -> Result<UpdateOutcome> {
        match self.rows.get_mut(&(table.to_string(), key.to_string())) {
            Some(mut row) => {
                row.value_mut().extend(fields);
                Ok(UpdateOutcome::Updated)
            }
            None => Ok(UpdateOutcome::NotFound),
        }
    }

    fn delete(&self, table: &str, key: &str) -> Result<bool> {
        Ok(self.rows.remove(&(table.to_string(), key.to_string())).is_some())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_put_is_insert_only() {
        let store = MemoryRowStore::new();
        let first = record(json!({"name": "John Doe"}));
        assert_eq!(store.put("Users", "1", first.clone()).unwrap(), PutOutcome::Inserted);
        assert_eq!(
            store.put("Users", "1", record(json!({"name": "Other"}))).unwrap(),
            PutOutcome::AlreadyExists
        );
        assert_eq!(store.get("Users", "1").unwrap(), Some(first));
        // same key in another table is a different row
        assert_eq!(store.put("Workouts", "1", Record::new()).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_update_merges_and_never_creates() {
        let store = MemoryRowStore::new();
        assert_eq!(
            store.update("Users", "1", record(json!({"a": 1}))).unwrap(),
            UpdateOutcome::NotFound
        );
        assert!(store.is_empty());

        store.put("Users", "1", record(json!({"a": 1, "b": 2}))).unwrap();
        assert_eq!(
            store.update("Users", "1", record(json!({"b": 3, "c": 4}))).unwrap(),
            UpdateOutcome::Updated
        );
        assert_eq!(
            store.get("Users", "1").unwrap(),
            Some(record(json!({"a": 1, "b": 3, "c": 4})))
        );
    }

    #[test]
    fn test_delete() {
        let store = MemoryRowStore::new();
        store.put("Users", "1", record(json!({"a": 1}))).unwrap();
        assert!(store.delete("Users", "1").unwrap());
        assert!(!store.delete("Users", "1").unwrap());
        assert!(store.is_empty());
        // a deleted key can be inserted again
        assert_eq!(store.put("Users", "1", Record::new()).unwrap(), PutOutcome::Inserted);
    }
}
