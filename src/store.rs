// Storage module - local cache of buckets and tasks
//
// A single SQLite file holds the last applied registry state so that the
// agent can rebuild its pipelines on restart before talking to the registry.
//
// # Tables
// - `buckets(name UNIQUE, state)`
// - `tasks(bucket INDEX, key UNIQUE, version, collect_bytes, target_bytes)`
//
// Config and target blobs use the registry wire encoding (JSON), so the store
// never depends on the in-memory layout of the task types.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::now_ms;
use crate::task::{Bucket, CollectConfig, CollectTarget, CollectTask, Interner};

/// Errors that can occur while reading or writing the task cache
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("cannot prepare store directory: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS buckets (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    gmt_create   INTEGER NOT NULL,
    gmt_modified INTEGER NOT NULL,
    name         TEXT NOT NULL UNIQUE,
    state        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    gmt_create    INTEGER NOT NULL,
    gmt_modified  INTEGER NOT NULL,
    bucket        TEXT NOT NULL,
    key           TEXT NOT NULL UNIQUE,
    version       TEXT NOT NULL,
    collect_bytes BLOB NOT NULL,
    target_bytes  BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_bucket ON tasks(bucket);
";

/// SQLite-backed task store. Every operation is its own transaction.
pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        info!("Opened task store at {}", path.display());
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch(SCHEMA)?;
        Ok(TaskStore { db: Mutex::new(db) })
    }

    /// Loads every bucket with its tasks hydrated.
    ///
    /// Configs and targets are interned, so tasks referencing the same key and
    /// version share one instance.
    pub fn get_all(&self) -> Result<HashMap<String, Bucket>, StoreError> {
        let db = self.db.lock();

        let mut buckets: HashMap<String, Bucket> = HashMap::new();
        let mut stmt = db.prepare("SELECT name, state FROM buckets")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let state: String = row.get(1)?;
            buckets.insert(name.clone(), Bucket::new(name, state));
        }

        let mut interner = Interner::new();
        let mut stmt = db.prepare("SELECT bucket, key, collect_bytes, target_bytes FROM tasks")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let bucket: String = row.get(0)?;
            let key: String = row.get(1)?;
            let collect_bytes: Vec<u8> = row.get(2)?;
            let target_bytes: Vec<u8> = row.get(3)?;

            let Some(bucket) = buckets.get_mut(&bucket) else {
                debug!(task = %key, "dropping task row of an unknown bucket");
                continue;
            };
            let config = interner.config(serde_json::from_slice::<CollectConfig>(&collect_bytes)?);
            let target = interner.target(serde_json::from_slice::<CollectTarget>(&target_bytes)?);
            bucket.insert(Arc::new(CollectTask::new(key, config, target)));
        }

        Ok(buckets)
    }

    /// Writes a bucket and its task set atomically.
    ///
    /// Task rows of the bucket that are not in `bucket.tasks` are deleted; the
    /// others are upserted by key.
    pub fn upsert_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        let now = now_ms();
        let mut db = self.db.lock();
        let tx = db.transaction()?;

        tx.execute(
            "INSERT INTO buckets(gmt_create, gmt_modified, name, state) VALUES (?1, ?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET state = excluded.state, gmt_modified = excluded.gmt_modified",
            params![now, bucket.key, bucket.state],
        )?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare("SELECT key FROM tasks WHERE bucket = ?1")?;
            let keys = stmt
                .query_map([&bucket.key], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            keys.into_iter().filter(|k| !bucket.tasks.contains_key(k)).collect()
        };
        for key in &stale {
            tx.execute("DELETE FROM tasks WHERE key = ?1", [key])?;
        }

        for task in bucket.tasks.values() {
            let collect_bytes = serde_json::to_vec(task.config.as_ref())?;
            let target_bytes = serde_json::to_vec(task.target.as_ref())?;
            tx.execute(
                "INSERT INTO tasks(gmt_create, gmt_modified, bucket, key, version, collect_bytes, target_bytes)
                 VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    gmt_modified = excluded.gmt_modified,
                    bucket = excluded.bucket,
                    version = excluded.version,
                    collect_bytes = excluded.collect_bytes,
                    target_bytes = excluded.target_bytes",
                params![now, bucket.key, task.key, task.version, collect_bytes, target_bytes],
            )?;
        }

        tx.commit()?;
        debug!(
            bucket = %bucket.key,
            tasks = bucket.tasks.len(),
            removed = stale.len(),
            "bucket persisted"
        );
        Ok(())
    }

    /// Deletes a bucket row and every task row of that bucket.
    pub fn remove_bucket(&self, key: &str) -> Result<(), StoreError> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM tasks WHERE bucket = ?1", [key])?;
        tx.execute("DELETE FROM buckets WHERE name = ?1", [key])?;
        tx.commit()?;
        debug!(bucket = %key, "bucket removed from store");
        Ok(())
    }

    /// Stored state of one bucket, if any.
    pub fn bucket_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let db = self.db.lock();
        let state = db
            .query_row("SELECT state FROM buckets WHERE name = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(state)
    }

    pub fn task_count(&self) -> Result<usize, StoreError> {
        let db = self.db.lock();
        let count: i64 = db.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{config, target};

    fn bucket(key: &str, state: &str, tasks: &[(&str, &Arc<CollectConfig>, &Arc<CollectTarget>)]) -> Bucket {
        let mut b = Bucket::new(key, state);
        for (task_key, c, t) in tasks {
            b.insert(Arc::new(CollectTask::new(*task_key, (*c).clone(), (*t).clone())));
        }
        b
    }

    #[test]
    fn test_get_all_interns_shared_config() {
        let store = TaskStore::open_in_memory().unwrap();
        let c1 = Arc::new(config("C1", "1", "httpcheck"));
        let v1 = Arc::new(target("V1", "1", "localhost"));
        let v2 = Arc::new(target("V2", "1", "pod"));

        store.upsert_bucket(&bucket("A", "s1", &[("T1", &c1, &v1)])).unwrap();
        store.upsert_bucket(&bucket("B", "s2", &[("T2", &c1, &v2)])).unwrap();

        let loaded = store.get_all().unwrap();
        assert_eq!(loaded.len(), 2);
        let t1 = &loaded["A"].tasks["T1"];
        let t2 = &loaded["B"].tasks["T2"];
        assert!(Arc::ptr_eq(&t1.config, &t2.config));
        assert!(!Arc::ptr_eq(&t1.target, &t2.target));
        assert_eq!(t1.version, "1/1");
    }

    #[test]
    fn test_upsert_replaces_task_set() {
        let store = TaskStore::open_in_memory().unwrap();
        let c1 = Arc::new(config("C1", "1", "httpcheck"));
        let c2 = Arc::new(config("C2", "1", "dialcheck"));
        let v1 = Arc::new(target("V1", "1", "localhost"));

        store
            .upsert_bucket(&bucket("A", "s1", &[("T1", &c1, &v1), ("T2", &c1, &v1)]))
            .unwrap();
        store
            .upsert_bucket(&bucket("A", "s3", &[("T2", &c2, &v1), ("T3", &c2, &v1)]))
            .unwrap();

        let loaded = store.get_all().unwrap();
        let a = &loaded["A"];
        assert_eq!(a.state, "s3");
        assert!(!a.tasks.contains_key("T1"));
        assert_eq!(a.tasks["T2"].config.key, "C2");
        assert_eq!(store.task_count().unwrap(), 2);
    }

    #[test]
    fn test_remove_bucket() {
        let store = TaskStore::open_in_memory().unwrap();
        let c1 = Arc::new(config("C1", "1", "httpcheck"));
        let v1 = Arc::new(target("V1", "1", "localhost"));
        store.upsert_bucket(&bucket("A", "s1", &[("T1", &c1, &v1)])).unwrap();
        store.upsert_bucket(&bucket("B", "s2", &[("T2", &c1, &v1)])).unwrap();

        store.remove_bucket("B").unwrap();

        assert_eq!(store.bucket_state("B").unwrap(), None);
        assert_eq!(store.bucket_state("A").unwrap().as_deref(), Some("s1"));
        assert_eq!(store.task_count().unwrap(), 1);
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.db");
        let c1 = Arc::new(config("C1", "1", "httpcheck"));
        let v1 = Arc::new(target("V1", "1", "localhost"));
        {
            let store = TaskStore::open(&path).unwrap();
            store.upsert_bucket(&bucket("A", "s1", &[("T1", &c1, &v1)])).unwrap();
        }
        let store = TaskStore::open(&path).unwrap();
        let loaded = store.get_all().unwrap();
        assert_eq!(loaded["A"].tasks["T1"].config.as_ref(), c1.as_ref());
    }
}
