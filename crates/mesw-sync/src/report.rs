//! Run reports under `reports/<run_id>/` and Parquet snapshots of the reporting tables.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Decimal128Array, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Datelike, NaiveDate};
use mesw_core::{AlertCase, KpiRecord, MergeResult};
use parquet::arrow::ArrowWriter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pipeline::{FileDisposition, FileOutcome, RunSummary};

const SUMMARY_MD: &str = "run_summary.md";
const SUMMARY_JSON: &str = "run_summary.json";
const CONFLICTS_LISTED: usize = 20;
const DECIMAL_PRECISION: u8 = 38;
const DECIMAL_SCALE: i8 = 6;
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write the human-readable summary of a run and return its report directory.
pub(crate) async fn write_run_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    fs::write(reports_dir.join(SUMMARY_MD), render_markdown(summary))
        .await
        .with_context(|| format!("writing {SUMMARY_MD}"))?;
    Ok(reports_dir)
}

pub(crate) async fn write_summary_json(reports_dir: &Path, summary: &RunSummary) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join(SUMMARY_JSON), bytes)
        .await
        .with_context(|| format!("writing {SUMMARY_JSON}"))?;
    Ok(())
}

fn render_markdown(summary: &RunSummary) -> String {
    let totals = summary.totals();
    let mut lines = vec![
        "# MES Warehouse Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- KPI as-of: {}", summary.as_of),
    ];
    if summary.cancelled {
        lines.push("- Cancelled before all files were started".to_string());
    }

    lines.push(String::new());
    lines.push("## Files".to_string());
    lines.push(format!("- merged: {}", summary.count(FileDisposition::Merged)));
    lines.push(format!("- skipped (unchanged): {}", summary.count(FileDisposition::Skipped)));
    lines.push(format!("- in flight elsewhere: {}", summary.count(FileDisposition::InFlight)));
    lines.push(format!("- failed: {}", summary.count(FileDisposition::Failed)));
    lines.push(format!(
        "- rows: {} inserted, {} duplicate, {} updated, {} conflicting",
        totals.inserted, totals.skipped_duplicate, totals.updated, totals.failed
    ));

    let failed: Vec<&FileOutcome> = summary.failed_files().collect();
    if !failed.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Files".to_string());
        for outcome in failed {
            lines.push(format!(
                "- `{}` {}: {}",
                outcome.pipeline_name,
                outcome.file,
                outcome.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    let with_conflicts: Vec<&FileOutcome> = summary
        .files
        .iter()
        .filter(|f| f.merge.as_ref().is_some_and(|m| !m.conflicts.is_empty()))
        .collect();
    if !with_conflicts.is_empty() {
        lines.push(String::new());
        lines.push("## Merge Conflicts".to_string());
        for outcome in with_conflicts {
            let Some(merge) = &outcome.merge else { continue };
            lines.push(format!("### {} ({} rows)", outcome.file, merge.conflicts.len()));
            for conflict in merge.conflicts.iter().take(CONFLICTS_LISTED) {
                lines.push(format!(
                    "- line {} key `{}`: {}",
                    conflict.line_no, conflict.natural_key, conflict.reason
                ));
            }
            if merge.conflicts.len() > CONFLICTS_LISTED {
                lines.push(format!("- ... {} more", merge.conflicts.len() - CONFLICTS_LISTED));
            }
        }
    }

    let rejected: u64 = summary.files.iter().map(|f| f.rows_rejected).sum();
    if rejected > 0 {
        lines.push(String::new());
        lines.push(format!("Rows quarantined by validation: {rejected}"));
    }

    if !summary.source_errors.is_empty() {
        lines.push(String::new());
        lines.push("## Source Errors".to_string());
        lines.extend(summary.source_errors.iter().map(|e| format!("- {e}")));
    }

    lines.push(String::new());
    lines.push("## KPIs".to_string());
    lines.push(format!("- records written: {}", summary.kpi.records_written));
    lines.push(format!("- records removed (no longer backed by facts): {}", summary.kpi.records_removed));
    lines.push(format!("- alerts opened: {}", summary.kpi.alerts_opened));
    lines.push(format!("- alerts re-evaluated: {}", summary.kpi.alerts_updated));
    lines.push(format!("- alerts resolved: {}", summary.kpi.alerts_resolved));
    lines.extend(summary.kpi.errors.iter().map(|e| format!("- error: {e}")));
    lines.push(String::new());
    lines.join("\n")
}

/// Snapshot file outcomes, KPI records and alert cases; returns the manifest path.
pub(crate) async fn export_parquet_snapshots(
    reports_dir: &Path,
    files: &[FileOutcome],
    records: &[KpiRecord],
    cases: &[AlertCase],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            write_snapshot(reports_dir, &snapshot_dir, files)?,
            write_snapshot(reports_dir, &snapshot_dir, records)?,
            write_snapshot(reports_dir, &snapshot_dir, cases)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Markdown digest of the `runs` most recent runs found under `<workspace>/reports`.
pub fn report_runs_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let path = entry.path().join(SUMMARY_JSON);
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# MES Warehouse Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for summary in summaries.into_iter().take(runs.max(1)) {
        let totals = summary.totals();
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- files: {} merged, {} skipped, {} failed",
            summary.count(FileDisposition::Merged),
            summary.count(FileDisposition::Skipped),
            summary.count(FileDisposition::Failed)
        ));
        lines.push(format!(
            "- rows: {} inserted, {} duplicate, {} updated",
            totals.inserted, totals.skipped_duplicate, totals.updated
        ));
        for failed in summary.failed_files() {
            lines.push(format!(
                "- failed `{}`: {}",
                failed.file,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
        }
        lines.push(format!(
            "- alerts: {} opened, {} resolved",
            summary.kpi.alerts_opened, summary.kpi.alerts_resolved
        ));
        if !summary.parquet_manifest.is_empty() {
            lines.push(format!("- parquet manifest: `{}`", summary.parquet_manifest));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// A reporting row type with a fixed Arrow layout.
trait SnapshotTable: Sized {
    const NAME: &'static str;

    fn schema() -> Schema;

    fn columns(rows: &[Self]) -> Result<Vec<ArrayRef>>;
}

/// File sink that hashes and counts what the Parquet writer emits.
struct DigestingFile {
    file: File,
    digest: Sha256,
    bytes: u64,
}

impl Write for DigestingFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.file.write(buf)?;
        self.digest.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn write_snapshot<T: SnapshotTable>(reports_dir: &Path, snapshot_dir: &Path, rows: &[T]) -> Result<ParquetManifestFile> {
    let path = snapshot_dir.join(format!("{}.parquet", T::NAME));
    let batch = RecordBatch::try_new(Arc::new(T::schema()), T::columns(rows)?)
        .with_context(|| format!("building {} record batch", T::NAME))?;

    let sink = DigestingFile {
        file: File::create(&path).with_context(|| format!("creating {}", path.display()))?,
        digest: Sha256::new(),
        bytes: 0,
    };
    let mut writer = ArrowWriter::try_new(sink, batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {}", T::NAME))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing {} rows", T::NAME))?;
    let mut sink = writer
        .into_inner()
        .with_context(|| format!("finishing {}", path.display()))?;
    sink.flush().with_context(|| format!("flushing {}", path.display()))?;

    Ok(ParquetManifestFile {
        name: T::NAME.to_string(),
        path: path
            .strip_prefix(reports_dir)
            .unwrap_or(&path)
            .display()
            .to_string(),
        sha256: hex::encode(sink.digest.finalize()),
        bytes: sink.bytes,
    })
}

fn disposition_label(disposition: FileDisposition) -> &'static str {
    match disposition {
        FileDisposition::Merged => "merged",
        FileDisposition::Skipped => "skipped",
        FileDisposition::InFlight => "in_flight",
        FileDisposition::Failed => "failed",
    }
}

fn utf8<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(values.collect::<StringArray>())
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn dates(values: impl Iterator<Item = Option<NaiveDate>>) -> ArrayRef {
    Arc::new(values.map(|d| d.map(days_since_epoch)).collect::<Date32Array>())
}

/// Quantities and thresholds stay exact at six decimal places.
fn decimal_column(values: impl Iterator<Item = Option<Decimal>>) -> Result<ArrayRef> {
    let scaled = values
        .map(|v| {
            v.map(|mut d| {
                d.rescale(DECIMAL_SCALE as u32);
                d.mantissa()
            })
        })
        .collect::<Decimal128Array>()
        .with_precision_and_scale(DECIMAL_PRECISION, DECIMAL_SCALE)
        .context("scaling decimal column")?;
    Ok(Arc::new(scaled))
}

fn decimal_field(name: &str, nullable: bool) -> ArrowField {
    ArrowField::new(name, DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE), nullable)
}

impl SnapshotTable for FileOutcome {
    const NAME: &'static str = "file_outcomes";

    fn schema() -> Schema {
        Schema::new(vec![
            ArrowField::new("pipeline_name", DataType::Utf8, false),
            ArrowField::new("file_path", DataType::Utf8, false),
            ArrowField::new("fingerprint", DataType::Utf8, false),
            ArrowField::new("disposition", DataType::Utf8, false),
            ArrowField::new("resumed", DataType::Boolean, false),
            ArrowField::new("rows_staged", DataType::UInt64, false),
            ArrowField::new("rows_rejected", DataType::UInt64, false),
            ArrowField::new("inserted", DataType::UInt64, true),
            ArrowField::new("skipped_duplicate", DataType::UInt64, true),
            ArrowField::new("updated", DataType::UInt64, true),
            ArrowField::new("conflicts", DataType::UInt64, true),
            ArrowField::new("error", DataType::Utf8, true),
        ])
    }

    fn columns(rows: &[Self]) -> Result<Vec<ArrayRef>> {
        let merged = |pick: fn(&MergeResult) -> u64| -> ArrayRef {
            Arc::new(rows.iter().map(|f| f.merge.as_ref().map(pick)).collect::<UInt64Array>())
        };
        Ok(vec![
            utf8(rows.iter().map(|f| Some(f.pipeline_name.as_str()))),
            utf8(rows.iter().map(|f| Some(f.file.as_str()))),
            utf8(rows.iter().map(|f| Some(f.fingerprint.as_str()))),
            utf8(rows.iter().map(|f| Some(disposition_label(f.disposition)))),
            Arc::new(rows.iter().map(|f| Some(f.resumed)).collect::<BooleanArray>()),
            Arc::new(rows.iter().map(|f| Some(f.rows_staged)).collect::<UInt64Array>()),
            Arc::new(rows.iter().map(|f| Some(f.rows_rejected)).collect::<UInt64Array>()),
            merged(|m| m.inserted),
            merged(|m| m.skipped_duplicate),
            merged(|m| m.updated),
            merged(|m| m.failed),
            utf8(rows.iter().map(|f| f.error.as_deref())),
        ])
    }
}

impl SnapshotTable for KpiRecord {
    const NAME: &'static str = "kpi_records";

    fn schema() -> Schema {
        Schema::new(vec![
            ArrowField::new("kpi_id", DataType::Utf8, false),
            ArrowField::new("tag", DataType::Utf8, false),
            ArrowField::new("created_date", DataType::Date32, false),
            decimal_field("progress_value", true),
            ArrowField::new("details", DataType::Utf8, false),
        ])
    }

    fn columns(rows: &[Self]) -> Result<Vec<ArrayRef>> {
        Ok(vec![
            utf8(rows.iter().map(|r| Some(r.kpi_id.as_str()))),
            utf8(rows.iter().map(|r| Some(r.tag.as_str()))),
            dates(rows.iter().map(|r| Some(r.created_date))),
            decimal_column(rows.iter().map(|r| r.progress_value))?,
            utf8(rows.iter().map(|r| Some(r.details.as_str()))),
        ])
    }
}

impl SnapshotTable for AlertCase {
    const NAME: &'static str = "alert_cases";

    fn schema() -> Schema {
        Schema::new(vec![
            ArrowField::new("case_id", DataType::Utf8, false),
            ArrowField::new("kpi_id", DataType::Utf8, false),
            ArrowField::new("tag", DataType::Utf8, false),
            ArrowField::new("trigger_date", DataType::Date32, false),
            decimal_field("threshold", false),
            decimal_field("observed_value", false),
            ArrowField::new("status", DataType::Utf8, false),
            ArrowField::new("resolved_date", DataType::Date32, true),
        ])
    }

    fn columns(rows: &[Self]) -> Result<Vec<ArrayRef>> {
        let ids: Vec<String> = rows.iter().map(|c| c.case_id().to_string()).collect();
        Ok(vec![
            utf8(ids.iter().map(|id| Some(id.as_str()))),
            utf8(rows.iter().map(|c| Some(c.kpi_id.as_str()))),
            utf8(rows.iter().map(|c| Some(c.tag.as_str()))),
            dates(rows.iter().map(|c| Some(c.trigger_date))),
            decimal_column(rows.iter().map(|c| Some(c.threshold)))?,
            decimal_column(rows.iter().map(|c| Some(c.observed_value)))?,
            utf8(rows.iter().map(|c| Some(c.status.as_str()))),
            dates(rows.iter().map(|c| c.resolved_date)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::KpiRefresh;
    use chrono::{NaiveDate, Utc};
    use mesw_core::{AlertStatus, FileKey, MergeConflict, MergeResult, NaturalKey};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn outcome(name: &str, disposition: FileDisposition) -> FileOutcome {
        FileOutcome {
            pipeline_name: "mes_output".into(),
            file: FileKey::new(&format!("drop/{name}")),
            fingerprint: "abc".into(),
            disposition,
            resumed: false,
            rows_staged: 3,
            rows_rejected: 1,
            merge: None,
            error: None,
        }
    }

    fn summary() -> RunSummary {
        let mut merged = outcome("mes_2026_02.csv", FileDisposition::Merged);
        merged.merge = Some(MergeResult {
            inserted: 2,
            skipped_duplicate: 0,
            updated: 0,
            failed: 1,
            conflicts: vec![MergeConflict {
                natural_key: NaturalKey::new(vec!["B1".into(), "OP10".into()]),
                line_no: 4,
                reason: "attributes differ".into(),
            }],
        });
        let mut failed = outcome("mes_2026_01.csv", FileDisposition::Failed);
        failed.error = Some("format error in drop/mes_2026_01.csv: missing required columns".into());
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            as_of: NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
            cancelled: false,
            files: vec![failed, merged],
            source_errors: vec![],
            kpi: KpiRefresh::default(),
            reports_dir: String::new(),
            parquet_manifest: String::new(),
        }
    }

    #[tokio::test]
    async fn run_report_lists_failures_and_conflicts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = summary();
        let reports_dir = write_run_reports(&dir.path().join("reports"), &summary).await.expect("reports");
        write_summary_json(&reports_dir, &summary).await.expect("json");

        let markdown = std::fs::read_to_string(reports_dir.join(SUMMARY_MD)).expect("markdown");
        assert!(markdown.contains("## Failed Files"));
        assert!(markdown.contains("mes_2026_01.csv"));
        assert!(markdown.contains("line 4 key `B1 / OP10`"));
        assert!(markdown.contains("Rows quarantined by validation: 2"));

        let digest = report_runs_markdown(5, Some(dir.path().to_path_buf())).expect("digest");
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("1 merged, 0 skipped, 1 failed"));
    }

    #[tokio::test]
    async fn parquet_snapshots_are_listed_with_checksums() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = summary();
        let records = vec![KpiRecord {
            kpi_id: "first_pass_yield".into(),
            tag: "L1".into(),
            created_date: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
            progress_value: None,
            details: "FY2026-W07 n=0 (no facts)".into(),
        }];
        let cases = vec![AlertCase {
            kpi_id: "first_pass_yield".into(),
            tag: "L1".into(),
            trigger_date: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
            threshold: Decimal::from(90),
            observed_value: Decimal::from(80),
            status: AlertStatus::Open,
            resolved_date: None,
        }];

        let manifest_path = export_parquet_snapshots(dir.path(), &summary.files, &records, &cases)
            .await
            .expect("export");
        let manifest: ParquetManifest =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).expect("read")).expect("parse");
        let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["file_outcomes", "kpi_records", "alert_cases"]);
        for file in &manifest.files {
            let written = std::fs::read(dir.path().join(&file.path)).expect("snapshot on disk");
            assert_eq!(file.bytes, written.len() as u64);
            assert_eq!(file.sha256, hex::encode(Sha256::digest(&written)));
            assert!(written.starts_with(b"PAR1"));
        }
    }
}
