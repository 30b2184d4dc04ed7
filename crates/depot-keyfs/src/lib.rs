#![deny(clippy::all, warnings)]

//! Transactional key/value store backing the artifact file store.
//!
//! Two namespaces live in one sqlite database: `records` holds small
//! JSON-serialized metadata keyed by string, `blobs` holds raw byte payloads.
//! All mutation happens inside an immediate write transaction; a record
//! committed before a transaction boundary is visible, bit-for-bit, to any
//! later read of the same key.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Handle to a key/value store on disk. Cheap to clone paths from; every
/// write transaction opens its own connection.
#[derive(Debug, Clone)]
pub struct KeyFs {
    path: PathBuf,
}

impl KeyFs {
    /// Open (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// schema cannot be initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create keyfs directory {}", parent.display())
            })?;
        }
        let keyfs = Self {
            path: path.to_path_buf(),
        };
        let conn = keyfs.connection()?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "keyfs open");
        Ok(keyfs)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin an immediate write transaction. Dropping the returned handle
    /// without committing rolls every change back.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or is locked beyond
    /// the busy timeout.
    pub fn begin_write_transaction(&self) -> Result<WriteTransaction> {
        let conn = self.connection()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("failed to begin keyfs write transaction")?;
        Ok(WriteTransaction { conn })
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open keyfs at {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for keyfs")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for keyfs")?;
        Ok(conn)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            key TEXT PRIMARY KEY,
            record TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS blobs (
            key TEXT PRIMARY KEY,
            bytes BLOB NOT NULL
        );
        "#,
    )
    .context("failed to initialize keyfs schema")?;
    Ok(())
}

/// An open write transaction. Reads observe the transaction's own writes;
/// nothing is visible to other connections until [`commit`](Self::commit).
pub struct WriteTransaction {
    conn: Connection,
}

impl WriteTransaction {
    /// Fetch and deserialize the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or if the stored record does not
    /// deserialize into `T`.
    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read keyfs record {key}"))?;
        match raw {
            Some(raw) => {
                let record = serde_json::from_str(&raw)
                    .with_context(|| format!("keyfs record {key} failed to deserialize"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Serialize and store `record` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or if `record` cannot be
    /// serialized.
    pub fn set_record<T: Serialize>(&mut self, key: &str, record: &T) -> Result<()> {
        let raw = serde_json::to_string(record)
            .with_context(|| format!("keyfs record {key} failed to serialize"))?;
        self.conn
            .execute(
                "INSERT INTO records(key, record) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET record = excluded.record",
                params![key, raw],
            )
            .with_context(|| format!("failed to write keyfs record {key}"))?;
        Ok(())
    }

    /// Remove the record under `key`; returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn delete_record(&mut self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM records WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete keyfs record {key}"))?;
        Ok(deleted > 0)
    }

    /// Fetch the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT bytes FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read keyfs blob {key}"))
    }

    /// Store `bytes` under `key`, replacing any previous blob.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn put_blob(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO blobs(key, bytes) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET bytes = excluded.bytes",
                params![key, bytes],
            )
            .with_context(|| format!("failed to write keyfs blob {key}"))?;
        Ok(())
    }

    /// Remove the blob under `key`; returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn delete_blob(&mut self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM blobs WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete keyfs blob {key}"))?;
        Ok(deleted > 0)
    }

    /// Whether a blob is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn blob_exists(&self, key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to probe keyfs blob {key}"))?;
        Ok(found.is_some())
    }

    /// Commit the current transaction and immediately begin a fresh one on
    /// the same connection. Everything committed is visible to reads in the
    /// new transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit or the restart fails.
    pub fn restart(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT; BEGIN IMMEDIATE")
            .context("failed to restart keyfs write transaction")?;
        Ok(())
    }

    /// Commit and close the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn commit(self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("failed to commit keyfs write transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        size: u64,
    }

    fn new_keyfs() -> Result<(tempfile::TempDir, KeyFs)> {
        let temp = tempdir()?;
        let keyfs = KeyFs::open(&temp.path().join("keyfs.sqlite"))?;
        Ok((temp, keyfs))
    }

    #[test]
    fn record_roundtrip_across_restart() -> Result<()> {
        let (_temp, keyfs) = new_keyfs()?;
        let mut tx = keyfs.begin_write_transaction()?;
        let sample = Sample {
            name: "demo-1.0.zip".to_string(),
            size: 7,
        };
        tx.set_record("root/pypi/demo-1.0.zip", &sample)?;
        tx.restart()?;
        let read: Option<Sample> = tx.get_record("root/pypi/demo-1.0.zip")?;
        assert_eq!(read, Some(sample));
        tx.commit()?;
        Ok(())
    }

    #[test]
    fn committed_data_visible_to_later_transactions() -> Result<()> {
        let (_temp, keyfs) = new_keyfs()?;
        let mut tx = keyfs.begin_write_transaction()?;
        tx.put_blob("+files/root/pypi/demo-1.0.zip", b"123")?;
        tx.commit()?;

        let tx = keyfs.begin_write_transaction()?;
        assert!(tx.blob_exists("+files/root/pypi/demo-1.0.zip")?);
        assert_eq!(
            tx.get_blob("+files/root/pypi/demo-1.0.zip")?,
            Some(b"123".to_vec())
        );
        Ok(())
    }

    #[test]
    fn dropped_transaction_rolls_back() -> Result<()> {
        let (_temp, keyfs) = new_keyfs()?;
        {
            let mut tx = keyfs.begin_write_transaction()?;
            tx.put_blob("+files/root/pypi/lost.zip", b"junk")?;
            // dropped without commit
        }
        let tx = keyfs.begin_write_transaction()?;
        assert!(!tx.blob_exists("+files/root/pypi/lost.zip")?);
        Ok(())
    }

    #[test]
    fn delete_reports_whether_row_existed() -> Result<()> {
        let (_temp, keyfs) = new_keyfs()?;
        let mut tx = keyfs.begin_write_transaction()?;
        tx.put_blob("+files/root/pypi/gone.zip", b"x")?;
        assert!(tx.delete_blob("+files/root/pypi/gone.zip")?);
        assert!(!tx.delete_blob("+files/root/pypi/gone.zip")?);
        assert!(!tx.delete_record("root/pypi/gone.zip")?);
        Ok(())
    }
}
