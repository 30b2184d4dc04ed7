use anyhow::{Context, Result};
use depot_keyfs::WriteTransaction;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::attachments;
use crate::entry::FileEntry;
use crate::error::FileStoreError;
use crate::fetch::{fetch_verified, Headers, Transport};
use crate::link::{Identity, Link};

/// Facade over one mirror location's cache namespace. Holds no connection
/// state; every operation takes the caller's write-transaction session.
#[derive(Debug, Clone)]
pub struct FileStore {
    user: String,
    index: String,
}

impl FileStore {
    #[must_use]
    pub fn new(user: &str, index: &str) -> Self {
        Self {
            user: user.to_string(),
            index: index.to_string(),
        }
    }

    /// Derive the cache-relative path for `link`. Pure and deterministic:
    /// equal links always map to equal relpaths.
    ///
    /// Hash-identified links shard into `<hash[..3]>/<hash[3..]>` so no
    /// single directory's fan-out grows with the corpus. Links without a
    /// trustworthy hash (egg links included) key under a slug of their
    /// fragment-stripped URL instead.
    fn link_relpath(&self, link: &Link) -> String {
        let basename = link.basename();
        match link.identity() {
            Some(Identity::Hashed(digest)) => format!(
                "{}/{}/{}/{}/{}",
                self.user,
                self.index,
                &digest[..3],
                &digest[3..],
                basename
            ),
            _ => {
                let nofrag = link.url_nofrag();
                let dirname = url_dirname_slug(&nofrag, basename);
                format!("{}/{}/{}/{}", self.user, self.index, dirname, basename)
            }
        }
    }

    /// Map a remote link onto its cache entry, creating the entry on first
    /// sight and reconciling a changed declared hash.
    ///
    /// If the link declares a hash that disagrees with the entry's stored
    /// one, the stored hash is updated in place; any payload cached under
    /// the old hash is invalidated first, so callers never observe bytes
    /// under a hash that no longer matches the link's declaration.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn maplink(&self, tx: &mut WriteTransaction, link: &Link) -> Result<FileEntry> {
        let relpath = self.link_relpath(link);
        let mut entry = FileEntry::get_or_create(tx, &relpath)?;

        if let Some(declared) = link.md5() {
            let changed = entry
                .md5()
                .is_some_and(|stored| !stored.eq_ignore_ascii_case(declared));
            if changed && entry.file_exists(tx)? {
                warn!(%relpath, "declared hash changed; invalidating cached payload");
                entry.file_delete(tx)?;
            }
        }

        let basename = link.basename().to_string();
        let url = link.url_nofrag();
        let declared = link.md5().map(str::to_string);
        let fragment = link.eggfragment().map(str::to_string);
        entry.update(tx, |meta| {
            meta.basename = basename;
            meta.url = url;
            if declared.is_some() {
                meta.md5 = declared;
            }
            meta.eggfragment = fragment;
        })?;
        debug!(relpath = %entry.relpath(), "maplink");
        Ok(entry)
    }

    /// Look up the entry previously mapped or stored at `relpath`.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn get_file_entry(
        &self,
        tx: &WriteTransaction,
        relpath: &str,
    ) -> Result<Option<FileEntry>> {
        FileEntry::load(tx, relpath)
    }

    /// Read the entry's bytes, fetching through the transport on a miss.
    ///
    /// A cached payload is returned together with its stored header set
    /// without touching the transport, so `transport` may be `None` for
    /// already-cached reads. On a miss the remote bytes are streamed in
    /// chunks of at most `chunksize`, verified against the declared size and
    /// hash, and committed; nothing partial is ever persisted.
    ///
    /// # Errors
    ///
    /// Fails with [`FileStoreError::NotFound`] for an unmapped relpath,
    /// [`FileStoreError::TransportUnavailable`] for an uncached read without
    /// a transport, and the [`FileStoreError`] fetch taxonomy for
    /// verification or transport failures.
    pub fn getfile(
        &self,
        tx: &mut WriteTransaction,
        relpath: &str,
        transport: Option<&dyn Transport>,
        chunksize: usize,
    ) -> Result<(Headers, Vec<u8>)> {
        let mut entry =
            FileEntry::load(tx, relpath)?.ok_or_else(|| FileStoreError::NotFound {
                key: relpath.to_string(),
            })?;
        if entry.file_exists(tx)? {
            debug!(%relpath, "file hit");
            let bytes = entry.file_get(tx)?;
            return Ok((entry.headers().clone(), bytes));
        }
        let transport = transport.ok_or_else(|| FileStoreError::TransportUnavailable {
            relpath: relpath.to_string(),
        })?;
        self.fetch_into(tx, &mut entry, transport, chunksize)
    }

    /// Discard any cached payload for `relpath` and fetch it again.
    ///
    /// Fragment-identified entries have no declared hash to disambiguate
    /// upstream content that changes over time; re-fetching them fails with
    /// [`FileStoreError::FragmentRefetchUnsupported`] rather than guessing.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`getfile`](Self::getfile).
    pub fn refetch(
        &self,
        tx: &mut WriteTransaction,
        relpath: &str,
        transport: &dyn Transport,
        chunksize: usize,
    ) -> Result<(Headers, Vec<u8>)> {
        let mut entry =
            FileEntry::load(tx, relpath)?.ok_or_else(|| FileStoreError::NotFound {
                key: relpath.to_string(),
            })?;
        if entry.eggfragment().is_some() {
            return Err(FileStoreError::FragmentRefetchUnsupported {
                relpath: relpath.to_string(),
            }
            .into());
        }
        if entry.file_exists(tx)? {
            entry.file_delete(tx)?;
        }
        self.fetch_into(tx, &mut entry, transport, chunksize)
    }

    fn fetch_into(
        &self,
        tx: &mut WriteTransaction,
        entry: &mut FileEntry,
        transport: &dyn Transport,
        chunksize: usize,
    ) -> Result<(Headers, Vec<u8>)> {
        let url = entry.url().to_string();
        let expected = entry.md5().map(str::to_string);
        let outcome = fetch_verified(
            entry.relpath(),
            &url,
            expected.as_deref(),
            transport,
            chunksize,
        )?;
        entry.set_file_content(tx, &outcome.bytes)?;
        entry.set_transport_headers(tx, &outcome.headers)?;
        debug!(relpath = %entry.relpath(), size = outcome.bytes.len(), "fetch committed");
        Ok((outcome.headers, outcome.bytes))
    }

    /// Store a locally-originated artifact under `<user>/<index>/<basename>`
    /// in one step: no remote link, no pre-declared hash to verify against.
    /// The content hash is computed from the bytes themselves.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn store(
        &self,
        tx: &mut WriteTransaction,
        user: &str,
        index: &str,
        basename: &str,
        content: &[u8],
    ) -> Result<FileEntry> {
        let relpath = format!("{user}/{index}/{basename}");
        let mut entry = FileEntry::get_or_create(tx, &relpath)?;
        let name = basename.to_string();
        entry.update(tx, |meta| {
            meta.basename = name;
        })?;
        entry.set_file_content(tx, content)?;
        let now = OffsetDateTime::now_utc()
            .format(&Rfc2822)
            .context("failed to format last-modified timestamp")?;
        entry.update(tx, |meta| {
            meta.last_modified = Some(now);
        })?;
        debug!(%relpath, size = content.len(), "direct store");
        Ok(entry)
    }

    /// Store `data` under the next unused index for `(content_hash, kind)`.
    ///
    /// # Errors
    ///
    /// Returns an error on metadata store failure.
    pub fn add_attachment(
        &self,
        tx: &mut WriteTransaction,
        content_hash: &str,
        kind: &str,
        data: &[u8],
    ) -> Result<u32> {
        attachments::add_attachment(tx, content_hash, kind, data)
    }

    /// Retrieve the attachment at `(content_hash, kind, index)`.
    ///
    /// # Errors
    ///
    /// Fails with [`FileStoreError::NotFound`] if that index was never
    /// assigned.
    pub fn get_attachment(
        &self,
        tx: &WriteTransaction,
        content_hash: &str,
        kind: &str,
        index: u32,
    ) -> Result<Vec<u8>> {
        attachments::get_attachment(tx, content_hash, kind, index)
    }
}

/// Slug of the URL with its trailing basename removed; keeps hashless links
/// deterministic while staying safe as a single path segment.
fn url_dirname_slug(url_nofrag: &str, basename: &str) -> String {
    let trimmed = url_nofrag
        .strip_suffix(basename)
        .map_or(url_nofrag, |rest| rest.trim_end_matches('/'));
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
