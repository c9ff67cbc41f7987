use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::ForwarderError;

const CONSUMERS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("consumers");

/// Durable, per-queue consumer configuration. Unique by `queue` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSpec {
  pub queue: String,
  pub webhook: String,
  pub min_interval_ms: u64,
  pub max_interval_ms: u64,
  pub business_hours_start: u8,
  pub business_hours_end: u8,
  pub paused: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Durable `queue -> ConsumerSpec` map on top of `redb`.
///
/// Every mutation commits one write transaction before returning
/// (synchronous durability, spec §4.A). `redb::Database::create` replays
/// its own internal redo log before returning, so "WAL consolidated before
/// the first read" holds by construction of `Store::open` — there is no
/// separate consolidation step to invoke.
pub struct Store {
  db: Database,
}

impl Store {
  /// Opens (creating if absent) the database file at `path`. Any I/O
  /// failure here is fatal per spec §4.A and should be handled by the
  /// caller via `error::fatal_exit`.
  pub fn open(path: &str) -> Result<Self, ForwarderError> {
    let db = Database::create(path)?;
    // Ensure the table exists so a fresh file is immediately queryable.
    let txn = db.begin_write()?;
    {
      txn.open_table(CONSUMERS_TABLE)?;
    }
    txn.commit()?;
    Ok(Store { db })
  }

  pub fn upsert(&self, spec: &ConsumerSpec) -> Result<(), ForwarderError> {
    let bytes = serde_json::to_vec(spec)?;
    let txn = self.db.begin_write()?;
    {
      let mut table = txn.open_table(CONSUMERS_TABLE)?;
      table.insert(spec.queue.as_str(), bytes)?;
    }
    txn.commit()?;
    Ok(())
  }

  pub fn delete(&self, queue: &str) -> Result<(), ForwarderError> {
    let txn = self.db.begin_write()?;
    {
      let mut table = txn.open_table(CONSUMERS_TABLE)?;
      table.remove(queue)?;
    }
    txn.commit()?;
    Ok(())
  }

  /// Sets `paused` and bumps `updated_at`, persisted before returning
  /// (invariant 5, spec §3): the control API only reports success to the
  /// caller after this commits.
  pub fn set_paused(&self, queue: &str, paused: bool) -> Result<Option<ConsumerSpec>, ForwarderError> {
    let txn = self.db.begin_write()?;
    let updated = {
      let mut table = txn.open_table(CONSUMERS_TABLE)?;
      let existing = table
        .get(queue)?
        .map(|guard| serde_json::from_slice::<ConsumerSpec>(&guard.value()))
        .transpose()?;

      match existing {
        Some(mut spec) => {
          spec.paused = paused;
          spec.updated_at = Utc::now();
          let bytes = serde_json::to_vec(&spec)?;
          table.insert(queue, bytes)?;
          Some(spec)
        }
        None => None,
      }
    };
    txn.commit()?;
    Ok(updated)
  }

  pub fn load_all(&self) -> Result<Vec<ConsumerSpec>, ForwarderError> {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(CONSUMERS_TABLE)?;
    let mut specs = Vec::new();
    for entry in table.iter()? {
      let (_, value) = entry?;
      specs.push(serde_json::from_slice(&value.value())?);
    }
    Ok(specs)
  }

  pub fn get(&self, queue: &str) -> Result<Option<ConsumerSpec>, ForwarderError> {
    let txn = self.db.begin_read()?;
    let table = txn.open_table(CONSUMERS_TABLE)?;
    match table.get(queue)? {
      Some(guard) => Ok(Some(serde_json::from_slice(&guard.value())?)),
      None => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spec(queue: &str) -> ConsumerSpec {
    let now = Utc::now();
    ConsumerSpec {
      queue: queue.to_string(),
      webhook: "http://example.com/hook".to_string(),
      min_interval_ms: 1000,
      max_interval_ms: 1000,
      business_hours_start: 0,
      business_hours_end: 24,
      paused: false,
      created_at: now,
      updated_at: now,
    }
  }

  fn temp_store() -> (Store, tempfile::TempPath) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.into_temp_path();
    let store = Store::open(path.to_str().unwrap()).unwrap();
    (store, path)
  }

  #[test]
  fn upsert_then_load_all_contains_spec_exactly_once() {
    let (store, _path) = temp_store();
    let s = spec("q1");
    store.upsert(&s).unwrap();
    store.upsert(&s).unwrap();

    let all = store.load_all().unwrap();
    assert_eq!(all.iter().filter(|x| x.queue == "q1").count(), 1);
  }

  #[test]
  fn delete_then_load_all_has_no_row() {
    let (store, _path) = temp_store();
    let s = spec("q1");
    store.upsert(&s).unwrap();
    store.delete("q1").unwrap();
    assert!(store.load_all().unwrap().is_empty());
  }

  #[test]
  fn pause_then_resume_leaves_paused_false() {
    let (store, _path) = temp_store();
    store.upsert(&spec("q1")).unwrap();

    store.set_paused("q1", true).unwrap();
    assert!(store.get("q1").unwrap().unwrap().paused);

    store.set_paused("q1", false).unwrap();
    assert!(!store.get("q1").unwrap().unwrap().paused);
  }

  #[test]
  fn restart_restores_all_specs_with_paused_flags() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.into_temp_path();

    {
      let store = Store::open(path.to_str().unwrap()).unwrap();
      store.upsert(&spec("q1")).unwrap();
      let mut s2 = spec("q2");
      s2.paused = true;
      store.upsert(&s2).unwrap();
    }
    // store dropped here, simulating process restart

    let reopened = Store::open(path.to_str().unwrap()).unwrap();
    let mut all = reopened.load_all().unwrap();
    all.sort_by(|a, b| a.queue.cmp(&b.queue));
    assert_eq!(all.len(), 2);
    assert!(!all[0].paused);
    assert!(all[1].paused);
  }
}
