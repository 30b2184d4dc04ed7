use anyhow::{Context, Result};
use depot_keyfs::WriteTransaction;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::FileStoreError;
use crate::fetch::{Headers, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use crate::link::Identity;

/// Hex md5 digest of `bytes`; the content-hash convention shared by cache
/// entries and attachments.
#[must_use]
pub fn content_md5(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

pub(crate) fn payload_key(relpath: &str) -> String {
    format!("+files/{relpath}")
}

/// Persistent metadata for one cache slot. Exists independently of the
/// payload: a mapped-but-unfetched entry has metadata and no bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub basename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eggfragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Raw response header set, replayed on cached reads.
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
}

/// One cache slot: a relpath key plus its metadata record. Equality is value
/// equality over relpath and metadata, never object identity.
///
/// Payload bytes are stored separately; [`file_exists`](Self::file_exists)
/// is the sole authority on their presence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    relpath: String,
    meta: FileMeta,
}

impl FileEntry {
    /// Load the entry stored at `relpath`, or create a fresh one with empty
    /// metadata. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn get_or_create(tx: &mut WriteTransaction, relpath: &str) -> Result<Self> {
        if let Some(entry) = Self::load(tx, relpath)? {
            return Ok(entry);
        }
        let entry = Self {
            relpath: relpath.to_string(),
            meta: FileMeta::default(),
        };
        tx.set_record(relpath, &entry.meta)?;
        Ok(entry)
    }

    /// Load the entry stored at `relpath`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn load(tx: &WriteTransaction, relpath: &str) -> Result<Option<Self>> {
        let meta: Option<FileMeta> = tx.get_record(relpath)?;
        Ok(meta.map(|meta| Self {
            relpath: relpath.to_string(),
            meta,
        }))
    }

    #[must_use]
    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    #[must_use]
    pub fn basename(&self) -> &str {
        &self.meta.basename
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.meta.url
    }

    #[must_use]
    pub fn md5(&self) -> Option<&str> {
        self.meta.md5.as_deref()
    }

    #[must_use]
    pub fn eggfragment(&self) -> Option<&str> {
        self.meta.eggfragment.as_deref()
    }

    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.meta.size
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<&str> {
        self.meta.last_modified.as_deref()
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.meta.content_type.as_deref()
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.meta.headers
    }

    /// The identity driving this entry's cache key, if it has one. At most
    /// one of a trustworthy hash or a fragment identity, never both.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        match (&self.meta.md5, &self.meta.eggfragment) {
            (_, Some(name)) => Some(Identity::Fragment(name.clone())),
            (Some(digest), None) => Some(Identity::Hashed(digest.clone())),
            (None, None) => None,
        }
    }

    /// Update one or more metadata fields transactionally. Never touches the
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn update(
        &mut self,
        tx: &mut WriteTransaction,
        apply: impl FnOnce(&mut FileMeta),
    ) -> Result<()> {
        apply(&mut self.meta);
        tx.set_record(&self.relpath, &self.meta)
    }

    /// Record the transport header set: stores the raw headers and extracts
    /// `content-length` (absent or `unknown` means size stays unknown),
    /// `last-modified` and `content-type`. Does not fetch or verify payload.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn set_transport_headers(
        &mut self,
        tx: &mut WriteTransaction,
        headers: &Headers,
    ) -> Result<()> {
        let size = headers.get(CONTENT_LENGTH).and_then(|value| {
            if value.eq_ignore_ascii_case("unknown") {
                None
            } else {
                value.parse::<u64>().ok()
            }
        });
        let last_modified = headers.get(LAST_MODIFIED).cloned();
        let content_type = headers.get(CONTENT_TYPE).cloned();
        self.update(tx, |meta| {
            meta.size = size;
            if last_modified.is_some() {
                meta.last_modified = last_modified;
            }
            if content_type.is_some() {
                meta.content_type = content_type;
            }
            meta.headers = headers.clone();
        })
    }

    /// Write the payload directly, updating `size` and `md5` to match the
    /// written bytes. Bypasses remote fetch and its verification.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn set_file_content(&mut self, tx: &mut WriteTransaction, bytes: &[u8]) -> Result<()> {
        tx.put_blob(&payload_key(&self.relpath), bytes)?;
        let digest = content_md5(bytes);
        let size = bytes.len() as u64;
        self.update(tx, |meta| {
            meta.md5 = Some(digest);
            meta.size = Some(size);
        })
    }

    /// Whether a payload is present for this entry.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn file_exists(&self, tx: &WriteTransaction) -> Result<bool> {
        tx.blob_exists(&payload_key(&self.relpath))
    }

    /// Read the payload bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`FileStoreError::NotFound`] if no payload is present.
    pub fn file_get(&self, tx: &WriteTransaction) -> Result<Vec<u8>> {
        tx.get_blob(&payload_key(&self.relpath))?
            .ok_or_else(|| {
                FileStoreError::NotFound {
                    key: self.relpath.clone(),
                }
                .into()
            })
    }

    /// Remove the payload only; path metadata (hash, url) persists. The
    /// recorded size is cleared since no bytes back it anymore.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn file_delete(&mut self, tx: &mut WriteTransaction) -> Result<()> {
        tx.delete_blob(&payload_key(&self.relpath))?;
        self.update(tx, |meta| {
            meta.size = None;
        })
    }

    /// Remove metadata and payload. A subsequent lookup of this relpath
    /// reports non-existence.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn delete(self, tx: &mut WriteTransaction) -> Result<()> {
        tx.delete_blob(&payload_key(&self.relpath))?;
        tx.delete_record(&self.relpath)
            .with_context(|| format!("failed to delete entry {}", self.relpath))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_keyfs::KeyFs;
    use tempfile::tempdir;

    fn new_tx() -> Result<(tempfile::TempDir, KeyFs)> {
        let temp = tempdir()?;
        let keyfs = KeyFs::open(&temp.path().join("keyfs.sqlite"))?;
        Ok((temp, keyfs))
    }

    #[test]
    fn transport_headers_extract_recognized_fields() -> Result<()> {
        let (_temp, keyfs) = new_tx()?;
        let mut tx = keyfs.begin_write_transaction()?;
        let mut entry = FileEntry::get_or_create(&mut tx, "root/pypi/abc/def/p.zip")?;
        let mut headers = Headers::new();
        headers.insert(CONTENT_LENGTH.to_string(), "3".to_string());
        headers.insert(
            LAST_MODIFIED.to_string(),
            "Thu, 25 Nov 2010 20:00:27 GMT".to_string(),
        );
        headers.insert(CONTENT_TYPE.to_string(), "application/zip".to_string());
        entry.set_transport_headers(&mut tx, &headers)?;
        assert_eq!(entry.size(), Some(3));
        assert_eq!(entry.last_modified(), Some("Thu, 25 Nov 2010 20:00:27 GMT"));
        assert_eq!(entry.content_type(), Some("application/zip"));
        assert_eq!(entry.headers(), &headers);
        Ok(())
    }

    #[test]
    fn unknown_content_length_keeps_size_unset() -> Result<()> {
        let (_temp, keyfs) = new_tx()?;
        let mut tx = keyfs.begin_write_transaction()?;
        let mut entry = FileEntry::get_or_create(&mut tx, "root/pypi/abc/def/q.zip")?;
        let mut headers = Headers::new();
        headers.insert(CONTENT_LENGTH.to_string(), "unknown".to_string());
        entry.set_transport_headers(&mut tx, &headers)?;
        assert_eq!(entry.size(), None);
        Ok(())
    }

    #[test]
    fn set_file_content_updates_hash_and_size() -> Result<()> {
        let (_temp, keyfs) = new_tx()?;
        let mut tx = keyfs.begin_write_transaction()?;
        let mut entry = FileEntry::get_or_create(&mut tx, "root/pypi/abc/def/r.zip")?;
        assert!(!entry.file_exists(&tx)?);
        entry.set_file_content(&mut tx, b"content")?;
        assert!(entry.file_exists(&tx)?);
        assert_eq!(entry.md5(), Some(content_md5(b"content").as_str()));
        assert_eq!(entry.size(), Some(7));
        assert_eq!(entry.file_get(&tx)?, b"content");

        entry.file_delete(&mut tx)?;
        assert!(!entry.file_exists(&tx)?);
        assert_eq!(entry.size(), None);
        // hash survives payload deletion
        assert!(entry.md5().is_some());
        Ok(())
    }

    #[test]
    fn entry_equality_is_value_equality() -> Result<()> {
        let (_temp, keyfs) = new_tx()?;
        let mut tx = keyfs.begin_write_transaction()?;
        let entry1 = FileEntry::get_or_create(&mut tx, "root/pypi/abc/def/s.zip")?;
        let entry2 = FileEntry::get_or_create(&mut tx, "root/pypi/abc/def/s.zip")?;
        assert_eq!(entry1, entry2);
        Ok(())
    }
}
