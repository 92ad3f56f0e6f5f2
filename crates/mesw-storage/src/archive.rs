//! Raw copies of every extract the pipeline has read, filed per pipeline and source file.
//!
//! Layout: `<root>/<pipeline>/<file name>-<key digest>/<fingerprint>.<ext>` with a
//! `<fingerprint>.json` entry next to it. The entry is written last and marks the
//! version as archived.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use mesw_core::{FileKey, SourceFile};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::fingerprint;

const KEY_DIGEST_LEN: usize = 12;

/// One archived version of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub pipeline_name: String,
    pub file_path: FileKey,
    pub fingerprint: String,
    pub size: u64,
    /// Name of the raw copy inside the file's archive directory.
    pub stored_as: String,
    pub discovered_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExtractArchive {
    root: PathBuf,
}

impl ExtractArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every archived version of `file` within `pipeline_name`.
    pub fn file_dir(&self, pipeline_name: &str, file: &FileKey) -> PathBuf {
        let digest = fingerprint(file.as_str().as_bytes());
        let readable: String = file
            .file_name()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        self.root
            .join(pipeline_name)
            .join(format!("{readable}-{}", &digest[..KEY_DIGEST_LEN]))
    }

    /// Keep `bytes` as the version `file.fingerprint` of `file`; archiving a version twice
    /// returns the first entry.
    pub async fn store(&self, pipeline_name: &str, file: &SourceFile, bytes: &[u8]) -> anyhow::Result<ArchiveEntry> {
        let dir = self.file_dir(pipeline_name, &file.path);
        let entry_path = dir.join(format!("{}.json", file.fingerprint));
        if let Some(existing) = read_entry(&entry_path).await? {
            debug!(file = %file.path, fingerprint = %file.fingerprint, "extract already archived");
            return Ok(existing);
        }

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;
        let extension = file
            .name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .unwrap_or("bin");
        let stored_as = format!("{}.{extension}", file.fingerprint);
        let partial = dir.join(format!("{stored_as}.partial"));
        fs::write(&partial, bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        fs::rename(&partial, dir.join(&stored_as))
            .await
            .with_context(|| format!("moving {} into place", partial.display()))?;

        let entry = ArchiveEntry {
            pipeline_name: pipeline_name.to_string(),
            file_path: file.path.clone(),
            fingerprint: file.fingerprint.clone(),
            size: bytes.len() as u64,
            stored_as,
            discovered_at: file.discovered_at,
            archived_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&entry).context("serializing archive entry")?;
        fs::write(&entry_path, json)
            .await
            .with_context(|| format!("writing {}", entry_path.display()))?;
        Ok(entry)
    }

    /// Archived versions of `file`, oldest first.
    pub async fn versions(&self, pipeline_name: &str, file: &FileKey) -> anyhow::Result<Vec<ArchiveEntry>> {
        let dir = self.file_dir(pipeline_name, file);
        let mut listing = match fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };
        let mut entries = Vec::new();
        while let Some(item) = listing
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = read_entry(&path).await? {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.archived_at);
        Ok(entries)
    }
}

async fn read_entry(path: &Path) -> anyhow::Result<Option<ArchiveEntry>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}
