use super::{PutOutcome, Record, RowStore, UpdateOutcome};
use crate::core::errors::{Result, RouterError};
use std::path::Path;
use tracing::debug;

const DEFAULT_TREE: &[u8] = b"__sled__default";

/// Sled-backed row store: one tree per table, JSON-encoded records
pub struct SledRowStore {
    db: sled::Db,
}

impl SledRowStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = ?path.as_ref(), "Opened sled row store");
        Ok(Self { db })
    }

    /// A store that is deleted when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, table: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(table)?)
    }

    fn encode(record: &Record) -> Result<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| RouterError::serialization("json", e))
    }

    fn decode(bytes: &[u8]) -> Result<Record> {
        serde_json::from_slice(bytes).map_err(|e| RouterError::serialization("json", e))
    }
}

impl RowStore for SledRowStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Record>> {
        match self.tree(table)?.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, table: &str, key: &str, record: Record) -> Result<PutOutcome> {
        let bytes = Self::encode(&record)?;
        let swapped = self
            .tree(table)?
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(bytes))?;
        Ok(match swapped {
            Ok(()) => PutOutcome::Inserted,
            Err(_) => PutOutcome::AlreadyExists,
        })
    }

    fn update(&self, table: &str, key: &str, fields: Record) -> Result<UpdateOutcome> {
        // single writer per partition, so read-merge-write cannot race
        let tree = self.tree(table)?;
        let Some(bytes) = tree.get(key.as_bytes())? else {
            return Ok(UpdateOutcome::NotFound);
        };
        let mut row = Self::decode(&bytes)?;
        row.extend(fields);
        tree.insert(key.as_bytes(), Self::encode(&row)?)?;
        Ok(UpdateOutcome::Updated)
    }

    fn delete(&self, table: &str, key: &str) -> Result<bool> {
        Ok(self.tree(table)?.remove(key.as_bytes())?.is_some())
    }

    fn len(&self) -> usize {
        self.db
            .tree_names()
            .into_iter()
            .filter(|name| name.as_ref() != DEFAULT_TREE)
            .filter_map(|name| self.db.open_tree(name).ok())
            .map(|tree| tree.len())
            .sum()
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
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
    fn test_sled_round_trip_and_policies() {
        let store = SledRowStore::temporary().unwrap();
        assert!(store.is_empty());

        let row = record(json!({"workout_id": 101, "duration": 30}));
        assert_eq!(store.put("Workouts", "101", row.clone()).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put("Workouts", "101", row.clone()).unwrap(), PutOutcome::AlreadyExists);
        assert_eq!(store.get("Workouts", "101").unwrap(), Some(row));
        assert_eq!(store.get("Workouts", "102").unwrap(), None);

        assert_eq!(
            store.update("Workouts", "101", record(json!({"duration": 45}))).unwrap(),
            UpdateOutcome::Updated
        );
        assert_eq!(
            store.update("Users", "1", record(json!({"x": 1}))).unwrap(),
            UpdateOutcome::NotFound
        );
        let updated = store.get("Workouts", "101").unwrap().unwrap();
        assert_eq!(updated["duration"], json!(45));
        assert_eq!(updated["workout_id"], json!(101));
        assert_eq!(store.len(), 1);

        assert!(store.delete("Workouts", "101").unwrap());
        assert!(!store.delete("Workouts", "101").unwrap());
        assert!(store.is_empty());
        store.flush().unwrap();
    }
}
