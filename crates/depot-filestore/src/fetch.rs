use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use tracing::debug;

use crate::error::FileStoreError;

/// Response header mapping with lowercase string keys.
pub type Headers = BTreeMap<String, String>;

pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_TYPE: &str = "content-type";
pub const LAST_MODIFIED: &str = "last-modified";

const USER_AGENT: &str = concat!("depot-filestore/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// One response from a transport GET: status, header mapping and a byte
/// stream readable in caller-chosen chunk sizes.
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Box<dyn Read + Send>,
}

/// Remote byte source for the fetch-through engine. Implementations report
/// the raw status code; deciding that a status is a failure belongs to the
/// engine.
pub trait Transport {
    /// Issue a GET for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be performed at all.
    fn get(&self, url: &str) -> Result<TransportResponse>;
}

/// Everything the engine hands back after a verified fetch.
#[derive(Debug)]
pub(crate) struct FetchOutcome {
    pub headers: Headers,
    pub bytes: Vec<u8>,
}

/// Stream `url` through `transport` in chunks of at most `chunksize` bytes,
/// maintaining a running byte count and md5. Verifies the declared
/// content-length (when present and not the `unknown` sentinel) and the
/// expected digest (case-insensitive) once the stream ends. Nothing is
/// persisted here; on any failure the caller's payload slot is untouched.
pub(crate) fn fetch_verified(
    relpath: &str,
    url: &str,
    expected_md5: Option<&str>,
    transport: &dyn Transport,
    chunksize: usize,
) -> Result<FetchOutcome> {
    let mut response = transport.get(url)?;
    if !(200..300).contains(&response.status) {
        return Err(FileStoreError::TransportFailure {
            url: url.to_string(),
            detail: format!("status {}", response.status),
        }
        .into());
    }

    let declared_len = response.headers.get(CONTENT_LENGTH).and_then(|value| {
        if value.eq_ignore_ascii_case("unknown") {
            None
        } else {
            value.parse::<u64>().ok()
        }
    });

    let mut bytes = Vec::new();
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; chunksize.max(1)];
    loop {
        let read = response.body.read(&mut buf).map_err(|err| {
            FileStoreError::TransportFailure {
                url: url.to_string(),
                detail: err.to_string(),
            }
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        bytes.extend_from_slice(&buf[..read]);
    }
    let actual_len = bytes.len() as u64;

    if let Some(expected) = declared_len {
        if actual_len != expected {
            return Err(FileStoreError::SizeMismatch {
                relpath: relpath.to_string(),
                expected,
                actual: actual_len,
            }
            .into());
        }
    }

    let actual_md5 = hex::encode(hasher.finalize());
    if let Some(expected) = expected_md5 {
        if !expected.eq_ignore_ascii_case(&actual_md5) {
            return Err(FileStoreError::HashMismatch {
                relpath: relpath.to_string(),
                expected: expected.to_string(),
                actual: actual_md5,
            }
            .into());
        }
    }

    // The remote may omit every header; content-length is still derivable
    // from the bytes actually transferred.
    let mut headers = response.headers;
    headers.insert(CONTENT_LENGTH.to_string(), actual_len.to_string());
    debug!(%relpath, size = actual_len, "fetch verified");
    Ok(FetchOutcome { headers, bytes })
}

/// Production transport: a blocking reqwest client with rustls.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build the client with the store's user agent and timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be constructed.
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<TransportResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        Ok(TransportResponse {
            status,
            headers,
            body: Box::new(response),
        })
    }
}

/// Programmable in-memory transport for tests: canned responses are queued
/// per URL and consumed in order.
#[derive(Default)]
pub struct StaticTransport {
    responses: Mutex<HashMap<String, VecDeque<CannedResponse>>>,
}

struct CannedResponse {
    status: u16,
    headers: Headers,
    body: Vec<u8>,
}

impl StaticTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `url`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn add_response(&self, url: &str, status: u16, headers: Headers, body: &[u8]) {
        self.responses
            .lock()
            .expect("static transport lock poisoned")
            .entry(url.to_string())
            .or_default()
            .push_back(CannedResponse {
                status,
                headers,
                body: body.to_vec(),
            });
    }
}

impl Transport for StaticTransport {
    fn get(&self, url: &str) -> Result<TransportResponse> {
        let canned = self
            .responses
            .lock()
            .expect("static transport lock poisoned")
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        match canned {
            Some(canned) => Ok(TransportResponse {
                status: canned.status,
                headers: canned.headers,
                body: Box::new(Cursor::new(canned.body)),
            }),
            None => Err(FileStoreError::TransportFailure {
                url: url.to_string(),
                detail: "no response configured".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canned(transport: &StaticTransport, url: &str, body: &[u8], length: Option<&str>) {
        let mut headers = Headers::new();
        if let Some(length) = length {
            headers.insert(CONTENT_LENGTH.to_string(), length.to_string());
        }
        transport.add_response(url, 200, headers, body);
    }

    #[test]
    fn verifies_declared_length() {
        let transport = StaticTransport::new();
        canned(&transport, "https://host/p.zip", b"1", Some("3"));
        let err = fetch_verified("root/pypi/p.zip", "https://host/p.zip", None, &transport, 1)
            .unwrap_err();
        let err = err
            .downcast_ref::<FileStoreError>()
            .expect("should produce FileStoreError");
        assert_eq!(
            err,
            &FileStoreError::SizeMismatch {
                relpath: "root/pypi/p.zip".to_string(),
                expected: 3,
                actual: 1,
            }
        );
    }

    #[test]
    fn synthesizes_content_length_when_remote_omits_headers() -> Result<()> {
        let transport = StaticTransport::new();
        canned(&transport, "https://host/q.zip", b"123", None);
        let outcome =
            fetch_verified("root/pypi/q.zip", "https://host/q.zip", None, &transport, 1)?;
        assert_eq!(outcome.bytes, b"123");
        assert_eq!(outcome.headers.get(CONTENT_LENGTH).map(String::as_str), Some("3"));
        assert_eq!(outcome.headers.get(CONTENT_TYPE), None);
        Ok(())
    }

    #[test]
    fn hash_comparison_ignores_case() -> Result<()> {
        let digest = hex::encode(Md5::digest(b"123")).to_ascii_uppercase();
        let transport = StaticTransport::new();
        canned(&transport, "https://host/r.zip", b"123", Some("3"));
        let outcome = fetch_verified(
            "root/pypi/r.zip",
            "https://host/r.zip",
            Some(&digest),
            &transport,
            2,
        )?;
        assert_eq!(outcome.bytes, b"123");
        Ok(())
    }

    #[test]
    fn non_success_status_is_a_transport_failure() {
        let transport = StaticTransport::new();
        transport.add_response("https://host/s.zip", 404, Headers::new(), b"");
        let err = fetch_verified("root/pypi/s.zip", "https://host/s.zip", None, &transport, 8)
            .unwrap_err();
        let err = err
            .downcast_ref::<FileStoreError>()
            .expect("should produce FileStoreError");
        assert!(matches!(err, FileStoreError::TransportFailure { .. }));
    }
}
