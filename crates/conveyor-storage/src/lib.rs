//! Object storage abstraction plus the HTTP Range fetch client used
//! to stream the material feed without loading it fully into memory.
//!
//! The persistent object store itself (signed URLs, bucket lifecycle) is an
//! external collaborator — here it is a trait with a filesystem
//! implementation, narrowed to the one backend actually exercised in
//! tests. `HttpRangeFetcher` is the genuinely new piece: a small blocking
//! `reqwest` client that issues `HEAD` and `Range` `GET`s and classifies the
//! response (206 normal, 416 EOF, 200 either "whole file fits" or "server
//! ignored Range" depending on `cursor_pos`).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    File,
    S3,
    Gcs,
    Azure,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageType::File => "file",
            StorageType::S3 => "s3",
            StorageType::Gcs => "gcs",
            StorageType::Azure => "azure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key not found: {0}")]
    NotFound(String),
}

/// Storage for pipeline inputs/intermediates/outputs.
/// Keys are slash-separated paths relative to the backend's root, e.g.
/// `state/{run_id}/stock_index.json`.
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn exists(&self, key: &str) -> Result<bool, StorageError>;
    fn storage_type(&self) -> StorageType;
    fn base_path(&self) -> &str;
    /// List keys directly under `prefix` (non-recursive), used by version
    /// cleanup to enumerate `versions/` folders.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Filesystem-backed storage. The only implementation exercised by tests;
/// `s3`/`gcs`/`azure` variants are out of scope here, same as the
/// persistent JSONB store and the real SFTP client.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

impl StorageBackend for FileStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io { key: key.to_string(), source: e }
            }
        })
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io { key: key.to_string(), source: e })?;
        }
        let tmp = path.with_extension("tmp-write");
        fs::write(&tmp, bytes).map_err(|e| StorageError::Io { key: key.to_string(), source: e })?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::Io { key: key.to_string(), source: e })?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io { key: key.to_string(), source: e }),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(key).exists())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    fn base_path(&self) -> &str {
        self.base_path.to_str().unwrap_or_default()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StorageError::Io { key: prefix.to_string(), source: e })? {
            let entry = entry.map_err(|e| StorageError::Io { key: prefix.to_string(), source: e })?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// HTTP Range fetch client
// ---------------------------------------------------------------------------

/// Outcome of the initial `HEAD`/probe Range request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: u16,
    pub content_length: Option<u64>,
    pub supports_range: bool,
}

/// Classified outcome of a body Range fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeFetchOutcome {
    /// A chunk of bytes the caller can treat as the next slice of the body.
    /// `http_status` is `206` when the server genuinely honored the Range
    /// header, or `200` when it returned a small enough full body that the
    /// caller tolerated it anyway (`cursor_pos == 0`, size within
    /// [`FULL_BODY_REFUSAL_MARGIN_BYTES`] of the requested window) —
    /// callers that need to know which actually happened (`chunk_files`
    /// mode's stricter semantics) match on `http_status` directly.
    Partial { bytes: Vec<u8>, http_status: u16 },
    /// HTTP 416: end of file.
    Eof,
    /// HTTP 200 returned mid-file (`cursor_pos > 0`): Range ignored, fatal.
    RangeNotHonored { http_status: u16, content_range: Option<String>, content_length: Option<u64> },
    /// HTTP 200 at `cursor_pos == 0` with a body larger than the fetch
    /// window plus margin: server returned the whole file at once, fatal.
    FullBodyRefused { bytes_fetched: u64 },
    /// The transient worker-eviction fault: `WORKER_LIMIT_HTTP_STATUS`, or
    /// any status whose body names [`conveyor_retry::WORKER_LIMIT_ERROR_CODE`].
    /// Retryable via the same backoff table every other step uses.
    WorkerLimit { http_status: u16, body_excerpt: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// `true` if this response should be classified as a transient
/// worker-eviction fault rather than whatever its HTTP status would
/// otherwise mean (EOF, range-not-honored, ...).
fn is_worker_limit(status: u16, body: &str) -> bool {
    status == conveyor_retry::WORKER_LIMIT_HTTP_STATUS || body.contains("WORKER_LIMIT")
}

/// Margin tolerated above `MAX_FETCH_BYTES` before a `cursor_pos == 0`,
/// HTTP-200 response is treated as a refused full-body dump.
pub const FULL_BODY_REFUSAL_MARGIN_BYTES: u64 = 64 * 1024;

pub struct HttpRangeFetcher {
    client: reqwest::blocking::Client,
}

impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRangeFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }

    /// Issue a `HEAD` to learn `Content-Length`; falls back to treating the
    /// resource as Range-capable only once a real Range probe confirms it.
    ///
    /// A `HEAD` response carries no body, so only the status code itself
    /// can signal `WORKER_LIMIT` here; the `200` caller treats a `546`
    /// `ProbeResult::status` as a transient fault, same as a `546` on the
    /// body fetch.
    pub fn probe(&self, url: &str) -> Result<ProbeResult, FetchError> {
        let resp = self.client.head(url).send()?;
        let status = resp.status().as_u16();
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let supports_range = resp
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Ok(ProbeResult { status, content_length, supports_range })
    }

    /// Fetch bytes `[start, end]` inclusive and classify the response.
    /// `cursor_pos` is the caller's current byte offset, used to
    /// distinguish "whole file fits in one fetch" from "server ignored our
    /// Range header mid-file".
    pub fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        cursor_pos: u64,
        max_fetch_bytes: u64,
    ) -> Result<RangeFetchOutcome, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()?;

        let status = resp.status().as_u16();
        let content_range = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if status == conveyor_retry::WORKER_LIMIT_HTTP_STATUS {
            let body = resp.text().unwrap_or_default();
            return Ok(RangeFetchOutcome::WorkerLimit {
                http_status: status,
                body_excerpt: body.chars().take(200).collect(),
            });
        }

        match status {
            206 => {
                let bytes = resp.bytes()?.to_vec();
                Ok(RangeFetchOutcome::Partial { bytes, http_status: 206 })
            }
            416 => Ok(RangeFetchOutcome::Eof),
            200 if cursor_pos > 0 => Ok(RangeFetchOutcome::RangeNotHonored {
                http_status: status,
                content_range,
                content_length,
            }),
            200 => {
                let bytes = resp.bytes()?.to_vec();
                if is_worker_limit(status, &String::from_utf8_lossy(&bytes)) {
                    Ok(RangeFetchOutcome::WorkerLimit {
                        http_status: status,
                        body_excerpt: String::from_utf8_lossy(&bytes).chars().take(200).collect(),
                    })
                } else if bytes.len() as u64 > max_fetch_bytes + FULL_BODY_REFUSAL_MARGIN_BYTES {
                    Ok(RangeFetchOutcome::FullBodyRefused { bytes_fetched: bytes.len() as u64 })
                } else {
                    Ok(RangeFetchOutcome::Partial { bytes, http_status: 200 })
                }
            }
            other => Ok(RangeFetchOutcome::RangeNotHonored {
                http_status: other,
                content_range,
                content_length,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_storage_write_then_read_round_trips() {
        let td = tempdir().unwrap();
        let storage = FileStorage::new(td.path());
        storage.write("state/run-1/stock_index.json", b"{}").unwrap();
        assert!(storage.exists("state/run-1/stock_index.json").unwrap());
        assert_eq!(storage.read("state/run-1/stock_index.json").unwrap(), b"{}");
    }

    #[test]
    fn file_storage_read_missing_key_errors() {
        let td = tempdir().unwrap();
        let storage = FileStorage::new(td.path());
        match storage.read("nope.json") {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn file_storage_delete_is_idempotent() {
        let td = tempdir().unwrap();
        let storage = FileStorage::new(td.path());
        storage.write("a.txt", b"x").unwrap();
        storage.delete("a.txt").unwrap();
        storage.delete("a.txt").unwrap();
        assert!(!storage.exists("a.txt").unwrap());
    }

    #[test]
    fn file_storage_list_returns_directory_entries() {
        let td = tempdir().unwrap();
        let storage = FileStorage::new(td.path());
        storage.write("versions/20240101_000000/a.xlsx", b"x").unwrap();
        storage.write("versions/20240102_000000/a.xlsx", b"x").unwrap();
        let mut entries = storage.list("versions").unwrap();
        entries.sort();
        assert_eq!(entries, vec!["20240101_000000", "20240102_000000"]);
    }

    #[test]
    fn storage_type_display_matches_lowercase_name() {
        assert_eq!(StorageType::File.to_string(), "file");
        assert_eq!(StorageType::S3.to_string(), "s3");
    }

    #[test]
    fn range_fetch_classifies_worker_limit_546() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let response = tiny_http::Response::from_data(b"WORKER_LIMIT exceeded".to_vec()).with_status_code(546);
                let _ = request.respond(response);
            }
        });

        let url = format!("http://{addr}/material.txt");
        let fetcher = HttpRangeFetcher::new();
        let outcome = fetcher.fetch_range(&url, 0, 9, 0, 2_097_152).unwrap();
        match outcome {
            RangeFetchOutcome::WorkerLimit { http_status, body_excerpt } => {
                assert_eq!(http_status, 546);
                assert!(body_excerpt.contains("WORKER_LIMIT"));
            }
            other => panic!("expected WorkerLimit, got {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn range_fetch_classifies_partial_eof_and_not_honored() {
        use std::sync::{Arc, Mutex};

        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let full_body = vec![b'x'; 100];
        let hits = Arc::new(Mutex::new(0usize));

        let body_for_thread = full_body.clone();
        let hits_thread = hits.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..2 {
                if let Ok(mut request) = server.recv() {
                    let mut count = hits_thread.lock().unwrap();
                    *count += 1;
                    if *count == 1 {
                        // first request: honor range, return 206 over bytes 0-9
                        let chunk = &body_for_thread[0..10];
                        let response = tiny_http::Response::from_data(chunk.to_vec())
                            .with_status_code(206)
                            .with_header(
                                tiny_http::Header::from_bytes(&b"Content-Range"[..], b"bytes 0-9/100").unwrap(),
                            );
                        let _ = request.respond(response);
                    } else {
                        // second request: pretend the server ignored Range entirely
                        let response = tiny_http::Response::from_data(body_for_thread.clone())
                            .with_status_code(200);
                        let _ = request.respond(response);
                    }
                }
            }
        });

        let url = format!("http://{addr}/material.txt");
        let fetcher = HttpRangeFetcher::new();

        let first = fetcher.fetch_range(&url, 0, 9, 0, 2_097_152).unwrap();
        assert_eq!(first, RangeFetchOutcome::Partial { bytes: full_body[0..10].to_vec(), http_status: 206 });

        let second = fetcher.fetch_range(&url, 10, 19, 10, 2_097_152).unwrap();
        match second {
            RangeFetchOutcome::RangeNotHonored { http_status, .. } => assert_eq!(http_status, 200),
            other => panic!("expected RangeNotHonored, got {other:?}"),
        }

        handle.join().unwrap();
    }
}
