//! Where extracts come from: drop directories or batches pushed by a collector.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use mesw_core::{EtlError, EtlResult, FileKey, SourceFile};
use mesw_storage::fingerprint;
use tokio::sync::Mutex;
use tracing::debug;
use walkdir::WalkDir;

#[async_trait]
pub trait ExtractSource: Send + Sync {
    fn describe(&self) -> String;

    /// Files currently available, sorted by canonical path.
    async fn discover(&self) -> EtlResult<Vec<SourceFile>>;

    async fn read(&self, file: &SourceFile) -> EtlResult<Vec<u8>>;
}

/// Scans a directory for file names matching `*`/`?` patterns.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    patterns: Vec<String>,
    recursive: bool,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, patterns: Vec<String>) -> Self {
        Self {
            root: root.into(),
            patterns,
            recursive: false,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn matches(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| wildcard_match(p, name))
    }

    fn scan(&self) -> EtlResult<Vec<PathBuf>> {
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(if self.recursive { usize::MAX } else { 1 })
            .follow_links(false);
        let mut paths = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|err| match err.into_io_error() {
                Some(io) => EtlError::Io(io),
                None => EtlError::Config(format!("cannot walk {}", self.root.display())),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') || !self.matches(&name) {
                continue;
            }
            paths.push(entry.into_path());
        }
        Ok(paths)
    }
}

#[async_trait]
impl ExtractSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {} ({})", self.root.display(), self.patterns.join(", "))
    }

    async fn discover(&self) -> EtlResult<Vec<SourceFile>> {
        let mut files = Vec::new();
        for path in self.scan()? {
            let bytes = tokio::fs::read(&path).await?;
            let key = FileKey::new(&path.to_string_lossy());
            files.push(SourceFile {
                name: key.file_name().to_string(),
                fingerprint: fingerprint(&bytes),
                size: bytes.len() as u64,
                path: key,
                discovered_at: Utc::now(),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(source = %self.describe(), files = files.len(), "extracts discovered");
        Ok(files)
    }

    async fn read(&self, file: &SourceFile) -> EtlResult<Vec<u8>> {
        Ok(tokio::fs::read(file.path.as_str()).await?)
    }
}

/// Holds row batches pushed by an external collector until the next run.
#[derive(Debug, Default)]
pub struct InMemorySource {
    label: String,
    batches: Mutex<Vec<(SourceFile, Vec<u8>)>>,
}

impl InMemorySource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Register a batch under a logical name; a resubmission replaces the previous content.
    pub async fn push(&self, name: &str, bytes: Vec<u8>) -> SourceFile {
        let file = SourceFile {
            name: name.to_string(),
            path: FileKey::new(&format!("{}/{name}", self.label)),
            fingerprint: fingerprint(&bytes),
            size: bytes.len() as u64,
            discovered_at: Utc::now(),
        };
        let mut batches = self.batches.lock().await;
        batches.retain(|(existing, _)| existing.path != file.path);
        batches.push((file.clone(), bytes));
        file
    }
}

#[async_trait]
impl ExtractSource for InMemorySource {
    fn describe(&self) -> String {
        format!("collector {}", self.label)
    }

    async fn discover(&self) -> EtlResult<Vec<SourceFile>> {
        let mut files: Vec<SourceFile> = self
            .batches
            .lock()
            .await
            .iter()
            .map(|(file, _)| file.clone())
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn read(&self, file: &SourceFile) -> EtlResult<Vec<u8>> {
        self.batches
            .lock()
            .await
            .iter()
            .find(|(existing, _)| existing.path == file.path)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| EtlError::NotFound(format!("collector batch {}", file.path)))
    }
}

/// Case-insensitive glob over a single file name; `*` spans any run, `?` one char.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    let (mut p, mut n) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
