//! Core domain model, error taxonomy and fiscal calendar for the MES warehouse.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod fiscal;

pub use fiscal::{FiscalCalendar, FiscalCalendarConfig, FiscalGrain, FiscalPeriod, FiscalWindow, PeriodKey};

pub const CRATE_NAME: &str = "mesw-core";

/// Error taxonomy shared by every component contract.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("format error in {file}: {message}")]
    Format { file: String, message: String },
    #[error("encoding error in {file}: {message}")]
    Encoding { file: String, message: String },
    #[error("import of {file} for pipeline {pipeline} is already in flight (status {status})")]
    Conflict {
        pipeline: String,
        file: String,
        status: ImportStatus,
    },
    #[error("merge of {file} failed: {message}")]
    MergeFailure { file: String, message: String },
    #[error("date {date} is outside the fiscal calendar ({first}..={last})")]
    OutOfRange {
        date: NaiveDate,
        first: NaiveDate,
        last: NaiveDate,
    },
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },
    #[error("invalid import state transition {from} -> {to} for state {state_id}")]
    InvalidTransition {
        state_id: Uuid,
        from: ImportStatus,
        to: ImportStatus,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// Only resource timeouts are worth retrying; everything else needs a human or new input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EtlError::Timeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::Format { .. } => "format_error",
            EtlError::Encoding { .. } => "encoding_error",
            EtlError::Conflict { .. } => "conflict",
            EtlError::MergeFailure { .. } => "merge_failure",
            EtlError::OutOfRange { .. } => "out_of_range",
            EtlError::Timeout { .. } => "timeout",
            EtlError::InvalidTransition { .. } => "invalid_transition",
            EtlError::NotFound(_) => "not_found",
            EtlError::Config(_) => "config_error",
            EtlError::Storage(_) => "storage_error",
            EtlError::Io(_) => "io_error",
        }
    }
}

pub type EtlResult<T> = Result<T, EtlError>;

/// Canonical identifier of a source file.
///
/// Backslashes become `/`, repeated separators collapse, `.` and `..` segments are
/// resolved and a drive letter is upper-cased, so `C:\x\\a.csv` and `c:/x/a.csv`
/// address the same import state row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FileKey(String);

impl FileKey {
    pub fn new(raw: &str) -> Self {
        Self(canonical_file_path(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment, used as the display name of a file.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl From<String> for FileKey {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<FileKey> for String {
    fn from(value: FileKey) -> Self {
        value.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_file_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let bytes = unified.as_bytes();

    let (prefix, rest) = if unified.starts_with("//") {
        ("//".to_string(), &unified[2..])
    } else if unified.starts_with('/') {
        ("/".to_string(), &unified[1..])
    } else if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_uppercase();
        (format!("{drive}:/"), unified[2..].trim_start_matches('/'))
    } else {
        (String::new(), unified.as_str())
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if prefix.is_empty() {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    format!("{prefix}{}", segments.join("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Staged,
    Merged,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Staged => "staged",
            ImportStatus::Merged => "merged",
            ImportStatus::Failed => "failed",
        }
    }

    /// `pending` and `staged` are the states an in-flight import can hold.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ImportStatus::Pending | ImportStatus::Staged)
    }

    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        matches!(
            (self, next),
            (ImportStatus::Pending, ImportStatus::Staged)
                | (ImportStatus::Staged, ImportStatus::Merged)
                | (ImportStatus::Pending, ImportStatus::Failed)
                | (ImportStatus::Staged, ImportStatus::Failed)
                | (ImportStatus::Failed, ImportStatus::Pending)
                | (ImportStatus::Merged, ImportStatus::Pending)
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImportStatus::Pending),
            "staged" => Ok(ImportStatus::Staged),
            "merged" => Ok(ImportStatus::Merged),
            "failed" => Ok(ImportStatus::Failed),
            other => Err(EtlError::Config(format!("unknown import status `{other}`"))),
        }
    }
}

/// A discovered extract file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub path: FileKey,
    pub fingerprint: String,
    pub size: u64,
    pub discovered_at: DateTime<Utc>,
}

/// Durable import progress of one file within one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImportState {
    pub id: Uuid,
    pub pipeline_name: String,
    pub file_path: FileKey,
    pub fingerprint: String,
    pub status: ImportStatus,
    pub rows_imported: u64,
    pub rows_rejected: u64,
    pub attempts: u32,
    pub run_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_attempt_at: DateTime<Utc>,
    pub error_detail: Option<String>,
}

/// Typed attribute value carried by staged rows and fact records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Stable textual form used for natural keys and tag comparisons.
    pub fn key_fragment(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(v) => Some(v.clone()),
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Decimal(v) => Some(v.normalize().to_string()),
            FieldValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            FieldValue::Timestamp(v) => Some(v.format("%Y-%m-%dT%H:%M:%S").to_string()),
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(v) => Some(*v),
            FieldValue::Integer(v) => Some(Decimal::from(*v)),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(v) => Some(*v),
            FieldValue::Timestamp(v) => Some(v.date()),
            _ => None,
        }
    }
}

pub type Attributes = BTreeMap<String, FieldValue>;

/// Composite domain key of a fact row, e.g. batch + operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    const SEPARATOR: char = '\u{1f}';

    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Storage encoding; the unit separator never appears in extract cells.
    pub fn encode(&self) -> String {
        self.0.join(&Self::SEPARATOR.to_string())
    }

    pub fn decode(encoded: &str) -> Self {
        Self(encoded.split(Self::SEPARATOR).map(str::to_string).collect())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" / "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRow {
    pub line_no: u64,
    pub natural_key: NaturalKey,
    pub event_date: Option<NaiveDate>,
    pub attributes: Attributes,
}

/// Row the loader refused to stage, kept for the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub line_no: u64,
    pub reason: String,
}

/// Normalized rows of one file awaiting merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingBatch {
    pub state_id: Uuid,
    pub pipeline_name: String,
    pub fact_type: String,
    pub source: SourceFile,
    pub rows: Vec<StagedRow>,
    pub rejected: Vec<RejectedRow>,
    pub staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    pub fact_type: String,
    pub natural_key: NaturalKey,
    pub event_date: Option<NaiveDate>,
    pub attributes: Attributes,
    pub source_file: FileKey,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    OverwriteIfNewer,
    RejectAndReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub natural_key: NaturalKey,
    pub line_no: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub updated: u64,
    pub failed: u64,
    pub conflicts: Vec<MergeConflict>,
}

impl MergeResult {
    /// Rows now reflected in the fact table from this file.
    pub fn rows_applied(&self) -> u64 {
        self.inserted + self.updated + self.skipped_duplicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiRecord {
    pub kpi_id: String,
    pub tag: String,
    pub created_date: NaiveDate,
    pub progress_value: Option<Decimal>,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertStatus::Open),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(EtlError::Config(format!("unknown alert status `{other}`"))),
        }
    }
}

/// Threshold breach for one `(kpi_id, tag)` starting at `trigger_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCase {
    pub kpi_id: String,
    pub tag: String,
    pub trigger_date: NaiveDate,
    pub threshold: Decimal,
    pub observed_value: Decimal,
    pub status: AlertStatus,
    pub resolved_date: Option<NaiveDate>,
}

impl AlertCase {
    /// Deterministic id so re-evaluation addresses the same case.
    pub fn case_id(&self) -> Uuid {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}",
            self.kpi_id,
            self.tag,
            self.trigger_date.format("%Y-%m-%d")
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}
