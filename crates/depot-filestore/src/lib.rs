#![deny(clippy::all, warnings)]

//! Content-addressed cache for package artifacts mirrored from an upstream
//! index, plus a hash-keyed attachment namespace for ad-hoc blobs.
//!
//! The core reconciles three loosely consistent sources of truth — the
//! upstream link string, its declared checksum and the bytes actually
//! received — while staying deterministic and replay-safe across process
//! restarts. Metadata lives in a [`depot_keyfs`] write transaction; payloads
//! commit only after size and hash verification pass.

mod attachments;
mod entry;
mod error;
mod fetch;
mod link;
mod store;

pub use entry::{content_md5, FileEntry, FileMeta};
pub use error::FileStoreError;
pub use fetch::{
    Headers, HttpTransport, StaticTransport, Transport, TransportResponse, CONTENT_LENGTH,
    CONTENT_TYPE, LAST_MODIFIED,
};
pub use link::{Identity, Link};
pub use store::FileStore;
