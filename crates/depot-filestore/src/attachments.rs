//! Attachment namespace: blobs keyed by `(content_hash, kind, index)`,
//! append-only per key. Attachments are independent of file entries; a hash
//! may have attachments without any entry existing for it.

use anyhow::Result;
use depot_keyfs::WriteTransaction;
use tracing::debug;

use crate::error::FileStoreError;

fn attachment_key(content_hash: &str, kind: &str, index: u32) -> String {
    format!("+attach/{content_hash}/{kind}/{index}")
}

/// Store `data` under the next unused index for `(content_hash, kind)`.
/// Indices start at 0, grow monotonically and are never reused; an occupied
/// slot is never overwritten.
pub(crate) fn add_attachment(
    tx: &mut WriteTransaction,
    content_hash: &str,
    kind: &str,
    data: &[u8],
) -> Result<u32> {
    let mut index = 0;
    while tx.blob_exists(&attachment_key(content_hash, kind, index))? {
        index += 1;
    }
    tx.put_blob(&attachment_key(content_hash, kind, index), data)?;
    debug!(%content_hash, %kind, index, "attachment stored");
    Ok(index)
}

/// Retrieve the attachment at an exact `(content_hash, kind, index)` key.
pub(crate) fn get_attachment(
    tx: &WriteTransaction,
    content_hash: &str,
    kind: &str,
    index: u32,
) -> Result<Vec<u8>> {
    let key = attachment_key(content_hash, kind, index);
    tx.get_blob(&key)?
        .ok_or_else(|| FileStoreError::NotFound { key }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_keyfs::KeyFs;
    use tempfile::tempdir;

    #[test]
    fn indices_are_assigned_in_order() -> Result<()> {
        let temp = tempdir()?;
        let keyfs = KeyFs::open(&temp.path().join("keyfs.sqlite"))?;
        let mut tx = keyfs.begin_write_transaction()?;
        assert_eq!(add_attachment(&mut tx, "abc123", "toxresult", b"first")?, 0);
        assert_eq!(add_attachment(&mut tx, "abc123", "toxresult", b"second")?, 1);
        // a different kind gets its own sequence
        assert_eq!(add_attachment(&mut tx, "abc123", "log", b"third")?, 0);
        assert_eq!(get_attachment(&tx, "abc123", "toxresult", 0)?, b"first");
        assert_eq!(get_attachment(&tx, "abc123", "toxresult", 1)?, b"second");
        Ok(())
    }

    #[test]
    fn missing_index_is_not_found() -> Result<()> {
        let temp = tempdir()?;
        let keyfs = KeyFs::open(&temp.path().join("keyfs.sqlite"))?;
        let tx = keyfs.begin_write_transaction()?;
        let err = get_attachment(&tx, "abc123", "toxresult", 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FileStoreError>(),
            Some(FileStoreError::NotFound { .. })
        ));
        Ok(())
    }
}
