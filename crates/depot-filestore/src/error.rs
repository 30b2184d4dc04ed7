use thiserror::Error;

/// Failures surfaced by the file store. None of these are retried
/// internally; retry policy belongs to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileStoreError {
    /// The requested relpath or attachment key has no record. Recoverable;
    /// callers usually treat it as a cache miss.
    #[error("no record exists for {key}")]
    NotFound { key: String },

    /// The upstream declared a content length that disagrees with the bytes
    /// actually received.
    #[error("size mismatch for {relpath}: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        relpath: String,
        expected: u64,
        actual: u64,
    },

    /// The received payload hashes differently from the link's declared
    /// digest. Treated as a trust violation, never accepted.
    #[error("md5 mismatch for {relpath}: expected {expected}, received {actual}")]
    HashMismatch {
        relpath: String,
        expected: String,
        actual: String,
    },

    /// Non-success status or stream error from the transport.
    #[error("transport failure for {url}: {detail}")]
    TransportFailure { url: String, detail: String },

    /// An uncached read was attempted without supplying a transport.
    #[error("no transport available to fetch {relpath}")]
    TransportUnavailable { relpath: String },

    /// Re-fetching a fragment-identified entry is ambiguous: its upstream
    /// content changes over time and no declared hash disambiguates it.
    #[error("cannot re-fetch fragment-identified entry {relpath}")]
    FragmentRefetchUnsupported { relpath: String },
}
