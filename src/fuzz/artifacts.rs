//! Exchange artifacts
//!
//! One pretty-printed JSON file per persisted exchange. Each name carries
//! the process id and is claimed with an exclusive create, so runs sharing
//! an output directory never replace each other's files. Content is written
//! to a temporary file and renamed over the claimed name.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

use crate::contract::HttpMethod;
use crate::request::RequestRecord;

/// Longest sanitized path fragment kept in a file name
const MAX_NAME_PATH_LEN: usize = 96;

/// Taken names skipped before a write gives up
const MAX_NAME_ATTEMPTS: usize = 64;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A completed exchange: what was sent, what came back, and the verdicts
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub request: RequestRecord,
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub request_validation: Option<String>,
    pub response_validation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Crash,
    Test,
}

/// Destination for persisted exchanges
pub trait ArtifactSink: Send + Sync {
    /// Persist a contract-violating exchange
    fn write_crash(&self, exchange: &ExchangeRecord) -> Result<PathBuf, ArtifactError>;

    /// Persist a conforming exchange (detailed mode only)
    fn write_test(&self, exchange: &ExchangeRecord) -> Result<PathBuf, ArtifactError>;
}

#[derive(Serialize)]
struct ArtifactDocument<'a> {
    kind: ArtifactKind,
    time: String,
    method: HttpMethod,
    url: &'a str,
    path: &'a str,
    query: &'a [(String, String)],
    headers: BTreeMap<&'a str, &'a str>,
    cookies: BTreeMap<&'a str, &'a str>,
    body_payload: String,
    status: u16,
    response_headers: BTreeMap<&'a str, &'a str>,
    response_body: String,
    request_validation: Option<&'a str>,
    response_validation: Option<&'a str>,
}

impl<'a> ArtifactDocument<'a> {
    fn new(kind: ArtifactKind, time: DateTime<Utc>, exchange: &'a ExchangeRecord) -> Self {
        let request = &exchange.request;
        Self {
            kind,
            time: time.to_rfc3339(),
            method: request.method,
            url: &request.url,
            path: &request.path,
            query: &request.query,
            headers: pairs(&request.headers),
            cookies: pairs(&request.cookies),
            body_payload: String::from_utf8_lossy(&request.body).into_owned(),
            status: exchange.status,
            response_headers: pairs(&exchange.response_headers),
            response_body: String::from_utf8_lossy(&exchange.response_body).into_owned(),
            request_validation: exchange.request_validation.as_deref(),
            response_validation: exchange.response_validation.as_deref(),
        }
    }
}

fn pairs(entries: &[(String, String)]) -> BTreeMap<&str, &str> {
    entries
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Writes artifacts into one output directory
#[derive(Debug)]
pub struct FileArtifactSink {
    dir: PathBuf,
    pid: u32,
    sequence: AtomicU64,
}

impl FileArtifactSink {
    /// Create the sink, creating `dir` if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            pid: std::process::id(),
            sequence: AtomicU64::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, kind: ArtifactKind, exchange: &ExchangeRecord) -> Result<PathBuf, ArtifactError> {
        self.write_at(kind, exchange, Utc::now())
    }

    fn write_at(
        &self,
        kind: ArtifactKind,
        exchange: &ExchangeRecord,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, ArtifactError> {
        let document = ArtifactDocument::new(kind, now, exchange);
        let mut content = serde_json::to_string_pretty(&document)?;
        content.push('\n');

        let path = self.claim(exchange.request.method, &exchange.request.path, now)?;
        let tmp_path = path.with_extension("json.tmp");
        let written = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .and_then(|mut file| file.write_all(content.as_bytes()));
        let placed = match written {
            Ok(()) => fs::rename(&tmp_path, &path),
            Err(e) => Err(e),
        };
        if let Err(source) = placed {
            // A tmp name we could not create belongs to someone else
            if source.kind() != ErrorKind::AlreadyExists {
                discard(&tmp_path);
            }
            discard(&path);
            return Err(ArtifactError::Write { path, source });
        }

        debug!(path = %path.display(), kind = ?kind, "artifact written");
        Ok(path)
    }

    /// Reserve the next free artifact name with an exclusive create
    fn claim(
        &self,
        method: HttpMethod,
        request_path: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, ArtifactError> {
        let mut last_err = None;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let path = self
                .dir
                .join(artifact_file_name(method, request_path, now, self.pid, seq));
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "artifact name taken, trying the next one");
                    last_err = Some((path, e));
                }
                Err(source) => return Err(ArtifactError::Write { path, source }),
            }
        }
        let (path, source) = last_err.unwrap_or_else(|| {
            (
                self.dir.clone(),
                std::io::Error::new(ErrorKind::AlreadyExists, "no free artifact name"),
            )
        });
        Err(ArtifactError::Write { path, source })
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "could not remove leftover artifact file");
        }
    }
}

impl ArtifactSink for FileArtifactSink {
    fn write_crash(&self, exchange: &ExchangeRecord) -> Result<PathBuf, ArtifactError> {
        self.write(ArtifactKind::Crash, exchange)
    }

    fn write_test(&self, exchange: &ExchangeRecord) -> Result<PathBuf, ArtifactError> {
        self.write(ArtifactKind::Test, exchange)
    }
}

/// `<METHOD>_<sanitized path>_<YYYYMMDD_HHMMSS_mmm>_<pid>_<seq>.json`
pub fn artifact_file_name(
    method: HttpMethod,
    path: &str,
    time: DateTime<Utc>,
    pid: u32,
    seq: u64,
) -> String {
    let mut sanitized: String = path
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    sanitized = sanitized.trim_matches('_').to_string();
    if sanitized.len() > MAX_NAME_PATH_LEN {
        sanitized.truncate(MAX_NAME_PATH_LEN);
    }
    if sanitized.is_empty() {
        sanitized.push_str("root");
    }

    format!(
        "{}_{}_{}_{}_{}.json",
        method,
        sanitized,
        time.format("%Y%m%d_%H%M%S_%3f"),
        pid,
        seq
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn exchange() -> ExchangeRecord {
        ExchangeRecord {
            request: RequestRecord {
                method: HttpMethod::Get,
                url: "http://localhost/items/7?x=1".to_string(),
                path: "/items/7".to_string(),
                template: "/items/{id}".to_string(),
                path_params: [("id".to_string(), "7".to_string())].into_iter().collect(),
                query: vec![("x".to_string(), "1".to_string())],
                headers: vec![("accept".to_string(), "application/json".to_string())],
                cookies: vec![("sid".to_string(), "abc".to_string())],
                content_type: "application/json".to_string(),
                body: Vec::new(),
            },
            status: 404,
            response_headers: vec![("content-type".to_string(), "text/plain".to_string())],
            response_body: b"nope".to_vec(),
            request_validation: None,
            response_validation: Some("status 404 is not declared".to_string()),
        }
    }

    #[test]
    fn test_file_name_shape() {
        let time = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            artifact_file_name(HttpMethod::Post, "/api/users/{id}/a b", time, 4242, 12),
            "POST_api_users__id__a_b_20240309_140507_000_4242_12.json"
        );
        assert_eq!(
            artifact_file_name(HttpMethod::Get, "/", time, 7, 1),
            "GET_root_20240309_140507_000_7_1.json"
        );
    }

    #[test]
    fn test_long_paths_are_truncated() {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let long = format!("/{}", "a".repeat(500));
        let name = artifact_file_name(HttpMethod::Get, &long, time, 1, 1);
        assert!(name.len() < 150);
    }

    #[test]
    fn test_crash_artifact_contents() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArtifactSink::new(dir.path().join("out")).unwrap();
        let path = sink.write_crash(&exchange()).unwrap();

        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("GET_items_7_"));
        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["kind"], "crash");
        assert_eq!(doc["method"], "GET");
        assert_eq!(doc["path"], "/items/7");
        assert_eq!(doc["status"], 404);
        assert_eq!(doc["cookies"]["sid"], "abc");
        assert_eq!(doc["response_body"], "nope");
        assert_eq!(doc["request_validation"], Value::Null);
        assert_eq!(doc["response_validation"], "status 404 is not declared");
        assert!(DateTime::parse_from_rfc3339(doc["time"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_each_exchange_gets_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArtifactSink::new(dir.path()).unwrap();
        let a = sink.write_crash(&exchange()).unwrap();
        let b = sink.write_test(&exchange()).unwrap();
        assert_ne!(a, b);

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
        let doc: Value = serde_json::from_str(&fs::read_to_string(&b).unwrap()).unwrap();
        assert_eq!(doc["kind"], "test");
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_existing_artifact_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArtifactSink::new(dir.path()).unwrap();
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let taken = dir
            .path()
            .join(artifact_file_name(HttpMethod::Get, "/items/7", time, sink.pid, 1));
        fs::write(&taken, b"from another run").unwrap();

        let path = sink.write_at(ArtifactKind::Crash, &exchange(), time).unwrap();
        assert_ne!(path, taken);
        assert!(path.to_str().unwrap().ends_with(&format!("_{}_2.json", sink.pid)));
        assert_eq!(fs::read(&taken).unwrap(), b"from another run");
        assert_eq!(file_names(dir.path()).len(), 2);
        assert!(file_names(dir.path()).iter().all(|name| !name.ends_with(".tmp")));
    }

    #[test]
    fn test_failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArtifactSink::new(dir.path()).unwrap();
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let name = artifact_file_name(HttpMethod::Get, "/items/7", time, sink.pid, 1);
        let blocker = dir.path().join(&name).with_extension("json.tmp");
        fs::create_dir(&blocker).unwrap();

        let err = sink.write_at(ArtifactKind::Crash, &exchange(), time).unwrap_err();
        assert!(matches!(err, ArtifactError::Write { .. }));
        assert_eq!(file_names(dir.path()), vec![format!("{}.tmp", name)]);
        assert!(blocker.is_dir());
    }

    #[test]
    fn test_sinks_on_one_directory_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileArtifactSink::new(dir.path()).unwrap();
        let second = FileArtifactSink::new(dir.path()).unwrap();
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let a = first.write_at(ArtifactKind::Crash, &exchange(), time).unwrap();
        let b = second.write_at(ArtifactKind::Crash, &exchange(), time).unwrap();
        assert_ne!(a, b);
        assert_eq!(file_names(dir.path()).len(), 2);
    }

    #[test]
    fn test_unwritable_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            FileArtifactSink::new(&file),
            Err(ArtifactError::CreateDir { .. })
        ));
    }
}
