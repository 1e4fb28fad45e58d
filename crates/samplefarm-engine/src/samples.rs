//! Sample storage collaborator: resolving a sample id to bytes, and selecting
//! sample ids by filter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Catalog file inside a [`DirectorySampleSource`] directory.
pub const CATALOG_FILE: &str = "catalog.json";

/// Failure to resolve or select samples.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The sample id is unknown, or its blob is missing.
    #[error("sample not found: {0}")]
    NotFound(String),
    /// Reading the sample failed.
    #[error("reading {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The catalog is unreadable or inconsistent.
    #[error("sample catalog: {0}")]
    Catalog(String),
}

impl SampleError {
    /// I/O trouble may clear up; a missing or inconsistent sample will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, SampleError::Io { .. })
    }
}

/// Bytes of one sample, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePayload {
    /// Sample id.
    pub sample_id: String,
    /// Original file name, sent as the multipart file name.
    pub file_name: String,
    /// Lower-case hex SHA-256 of `bytes`.
    pub sha256: String,
    /// File contents.
    pub bytes: Arc<[u8]>,
}

impl SamplePayload {
    /// Build a payload, hashing `bytes`.
    pub fn new(sample_id: impl Into<String>, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            sample_id: sample_id.into(),
            file_name: file_name.into(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.into(),
        }
    }
}

/// Lower-case hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Catalog entry describing one stored sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Sample id.
    pub id: String,
    /// Original file name.
    pub file_name: String,
    /// File type, e.g. `PE32`.
    #[serde(default)]
    pub sample_type: Option<String>,
    /// MD5, hex.
    #[serde(default)]
    pub md5: Option<String>,
    /// SHA-1, hex.
    #[serde(default)]
    pub sha1: Option<String>,
    /// SHA-256, hex.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Labels attached at ingestion.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Where the sample came from.
    #[serde(default)]
    pub source: Option<String>,
    /// Ingestion time.
    pub created_at: DateTime<Utc>,
    /// Whether the sample is an archive holding other samples.
    #[serde(default)]
    pub is_container: bool,
    /// Blob path relative to the sample directory; the id when absent.
    #[serde(default)]
    pub path: Option<String>,
    /// Size in bytes; read from the blob when the catalog omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl SampleRecord {
    /// File type used for distributions: the file name's extension,
    /// lower-cased, or `unknown`.
    pub fn file_type(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map_or_else(|| "unknown".to_string(), str::to_lowercase)
    }
}

/// Sample selection filter. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleFilter {
    /// Case-insensitive substring of the file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Exact file type (case-insensitive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_type: Option<String>,
    /// MD5, SHA-1 or SHA-256 (case-insensitive exact).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// One of the sample's labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Exact source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Ingested at or after.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    /// Ingested strictly before.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    /// Container flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_container: Option<bool>,
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl SampleFilter {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether `record` satisfies every set field.
    pub fn matches(&self, record: &SampleRecord) -> bool {
        if let Some(needle) = &self.file_name {
            let needle = needle.trim().to_lowercase();
            if !record.file_name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        if let Some(kind) = &self.sample_type {
            if !record.sample_type.as_deref().is_some_and(|t| eq_ci(t, kind)) {
                return false;
            }
        }
        if let Some(hash) = &self.hash {
            let hit = [&record.md5, &record.sha1, &record.sha256]
                .into_iter()
                .flatten()
                .any(|h| eq_ci(h, hash));
            if !hit {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !record.labels.iter().any(|l| eq_ci(l, label)) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if record.source.as_deref() != Some(source.trim()) {
                return false;
            }
        }
        if self.created_after.is_some_and(|t| record.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| record.created_at >= t) {
            return false;
        }
        if self.is_container.is_some_and(|c| record.is_container != c) {
            return false;
        }
        true
    }
}

/// Access to stored samples.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Load the bytes of `sample_id`.
    async fn resolve(&self, sample_id: &str) -> Result<SamplePayload, SampleError>;

    /// Ids of every sample matching `filter`, in catalog order.
    async fn select(&self, filter: &SampleFilter) -> Result<Vec<String>, SampleError>;

    /// Whether `sample_id` is known.
    async fn contains(&self, sample_id: &str) -> Result<bool, SampleError>;

    /// Catalog entries matching `filter`, in catalog order, sizes filled in.
    async fn records(&self, filter: &SampleFilter) -> Result<Vec<SampleRecord>, SampleError>;
}

/// Samples stored as files in one directory, described by `catalog.json`
/// (a JSON array of [`SampleRecord`]).
#[derive(Debug, Clone)]
pub struct DirectorySampleSource {
    dir: PathBuf,
}

impl DirectorySampleSource {
    /// Source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Sample directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn catalog(&self) -> Result<Vec<SampleRecord>, SampleError> {
        let path = self.dir.join(CATALOG_FILE);
        tokio::task::spawn_blocking(move || load_catalog(&path))
            .await
            .map_err(|e| SampleError::Catalog(format!("catalog task failed: {e}")))?
    }
}

fn load_catalog(path: &Path) -> Result<Vec<SampleRecord>, SampleError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SampleError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&raw).map_err(|e| SampleError::Catalog(format!("{}: {e}", path.display())))
}

#[async_trait]
impl SampleSource for DirectorySampleSource {
    async fn resolve(&self, sample_id: &str) -> Result<SamplePayload, SampleError> {
        let record = self
            .catalog()
            .await?
            .into_iter()
            .find(|r| r.id == sample_id)
            .ok_or_else(|| SampleError::NotFound(sample_id.to_string()))?;

        let rel = record.path.clone().unwrap_or_else(|| record.id.clone());
        if Path::new(&rel).components().any(|c| {
            matches!(
                c,
                std::path::Component::ParentDir | std::path::Component::RootDir
            )
        }) {
            return Err(SampleError::Catalog(format!(
                "sample {sample_id}: path {rel:?} escapes the sample directory"
            )));
        }
        let path = self.dir.join(rel);

        let read_path = path.clone();
        let bytes = tokio::task::spawn_blocking(move || std::fs::read(read_path))
            .await
            .map_err(|e| SampleError::Catalog(format!("read task failed: {e}")))?
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    SampleError::NotFound(sample_id.to_string())
                } else {
                    SampleError::Io { path, source }
                }
            })?;

        let payload = SamplePayload::new(record.id, record.file_name, bytes);
        if let Some(expected) = &record.sha256 {
            if !eq_ci(expected, &payload.sha256) {
                return Err(SampleError::Catalog(format!(
                    "sample {sample_id}: sha256 mismatch (catalog {expected}, file {})",
                    payload.sha256
                )));
            }
        }
        Ok(payload)
    }

    async fn select(&self, filter: &SampleFilter) -> Result<Vec<String>, SampleError> {
        Ok(self
            .catalog()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.id)
            .collect())
    }

    async fn contains(&self, sample_id: &str) -> Result<bool, SampleError> {
        Ok(self.catalog().await?.iter().any(|r| r.id == sample_id))
    }

    async fn records(&self, filter: &SampleFilter) -> Result<Vec<SampleRecord>, SampleError> {
        let mut matched: Vec<SampleRecord> = self
            .catalog()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        if matched.iter().all(|r| r.file_size.is_some()) {
            return Ok(matched);
        }
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            for record in matched.iter_mut().filter(|r| r.file_size.is_none()) {
                let rel = record.path.as_deref().unwrap_or(&record.id);
                // A missing blob leaves the size unknown; resolve reports it.
                record.file_size = std::fs::metadata(dir.join(rel)).ok().map(|m| m.len());
            }
            matched
        })
        .await
        .map_err(|e| SampleError::Catalog(format!("size task failed: {e}")))
    }
}

/// Write a catalog and blobs into `dir`. Used by tests and fixtures.
#[doc(hidden)]
pub fn write_fixture(
    dir: &Path,
    samples: &[(SampleRecord, Vec<u8>)],
) -> Result<(), SampleError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SampleError::Io { path, source }
    };
    std::fs::create_dir_all(dir).map_err(io(dir))?;
    for (record, bytes) in samples {
        let path = dir.join(record.path.as_deref().unwrap_or(&record.id));
        std::fs::write(&path, bytes).map_err(io(&path))?;
    }
    let records: Vec<&SampleRecord> = samples.iter().map(|(r, _)| r).collect();
    let raw = serde_json::to_string_pretty(&records)
        .map_err(|e| SampleError::Catalog(e.to_string()))?;
    let path = dir.join(CATALOG_FILE);
    std::fs::write(&path, raw).map_err(io(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str) -> SampleRecord {
        SampleRecord {
            id: id.to_string(),
            file_name: name.to_string(),
            sample_type: Some("PE32".to_string()),
            md5: None,
            sha1: None,
            sha256: None,
            labels: vec!["ransomware".to_string()],
            source: Some("feed-a".to_string()),
            created_at: DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            is_container: false,
            path: None,
            file_size: None,
        }
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn filter_fields_combine() {
        let mut r = record("s1", "Invoice_Dropper.EXE");
        r.md5 = Some("ABCDEF".to_string());

        assert!(SampleFilter::default().matches(&r));
        let f = SampleFilter {
            file_name: Some("dropper".to_string()),
            hash: Some("abcdef".to_string()),
            label: Some("RANSOMWARE".to_string()),
            sample_type: Some("pe32".to_string()),
            ..Default::default()
        };
        assert!(f.matches(&r));

        let f = SampleFilter {
            source: Some("feed-b".to_string()),
            ..Default::default()
        };
        assert!(!f.matches(&r));

        let f = SampleFilter {
            is_container: Some(true),
            ..Default::default()
        };
        assert!(!f.matches(&r));
    }

    #[test]
    fn filter_time_range_is_half_open() {
        let r = record("s1", "a.exe");
        let at = r.created_at;
        let f = SampleFilter {
            created_after: Some(at),
            created_before: Some(at + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(f.matches(&r));
        let f = SampleFilter {
            created_before: Some(at),
            ..Default::default()
        };
        assert!(!f.matches(&r));
    }

    #[tokio::test]
    async fn directory_source_resolves_and_selects() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = record("a", "a.exe");
        a.sha256 = Some(sha256_hex(b"MZ-a"));
        let mut b = record("b", "b.dll");
        b.is_container = true;
        write_fixture(dir.path(), &[(a, b"MZ-a".to_vec()), (b, b"MZ-b".to_vec())]).unwrap();

        let source = DirectorySampleSource::new(dir.path());
        let payload = source.resolve("a").await.unwrap();
        assert_eq!(payload.file_name, "a.exe");
        assert_eq!(&*payload.bytes, b"MZ-a");
        assert_eq!(payload.sha256, sha256_hex(b"MZ-a"));

        let ids = source
            .select(&SampleFilter {
                is_container: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids, vec!["b".to_string()]);
        assert!(source.contains("b").await.unwrap());

        let err = source.resolve("missing").await.unwrap_err();
        assert!(matches!(err, SampleError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn hash_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = record("a", "a.exe");
        a.sha256 = Some("00".repeat(32));
        write_fixture(dir.path(), &[(a, b"MZ".to_vec())]).unwrap();
        let err = DirectorySampleSource::new(dir.path())
            .resolve("a")
            .await
            .unwrap_err();
        assert!(matches!(err, SampleError::Catalog(_)));
    }

    #[test]
    fn file_type_is_the_lowercase_extension() {
        assert_eq!(record("a", "Invoice.EXE").file_type(), "exe");
        assert_eq!(record("a", "archive.tar.gz").file_type(), "gz");
        assert_eq!(record("a", "README").file_type(), "unknown");
    }

    #[tokio::test]
    async fn records_fill_missing_sizes_from_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let a = record("a", "a.exe");
        let mut b = record("b", "b.dll");
        b.file_size = Some(4096);
        b.source = Some("feed-b".to_string());
        write_fixture(dir.path(), &[(a, b"MZ-abc".to_vec()), (b, b"MZ".to_vec())]).unwrap();

        let source = DirectorySampleSource::new(dir.path());
        let all = source.records(&SampleFilter::default()).await.unwrap();
        let sizes: Vec<_> = all.iter().map(|r| (r.id.as_str(), r.file_size)).collect();
        assert_eq!(sizes, vec![("a", Some(6)), ("b", Some(4096))]);

        let only_b = source
            .records(&SampleFilter {
                source: Some("feed-b".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].id, "b");
    }

    #[tokio::test]
    async fn missing_catalog_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySampleSource::new(dir.path());
        assert!(source.select(&SampleFilter::default()).await.unwrap().is_empty());
    }
}
