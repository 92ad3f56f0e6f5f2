//! One pipeline run: every enabled pipeline's new or changed files are staged and
//! merged concurrently, then KPIs and alerts are refreshed and reports written.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use mesw_core::{
    EtlError, EtlResult, FileImportState, FileKey, FiscalCalendar, MergeResult, SourceFile,
    StagingBatch,
};
use mesw_extract::{DirectorySource, ExtractSource, StagingLoader};
use mesw_kpi::{aggregate_all, KpiStore, KpiWriteSummary};
use mesw_storage::{
    Begin, ExtractArchive, FactReader, FileStateTracker, RetryPolicy, StagingStore, Warehouse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::merge::MergeEngine;
use crate::report;
use crate::{EtlConfig, PipelineConfig, PipelineRegistry, SourceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDisposition {
    Merged,
    Skipped,
    /// Another attempt holds a live lease on the file.
    InFlight,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub pipeline_name: String,
    pub file: FileKey,
    pub fingerprint: String,
    pub disposition: FileDisposition,
    pub resumed: bool,
    pub rows_staged: u64,
    pub rows_rejected: u64,
    pub merge: Option<MergeResult>,
    pub error: Option<String>,
}

impl FileOutcome {
    fn new(pipeline_name: &str, file: &SourceFile, disposition: FileDisposition) -> Self {
        Self {
            pipeline_name: pipeline_name.to_string(),
            file: file.path.clone(),
            fingerprint: file.fingerprint.clone(),
            disposition,
            resumed: false,
            rows_staged: 0,
            rows_rejected: 0,
            merge: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KpiRefresh {
    pub records_written: u64,
    #[serde(default)]
    pub records_removed: u64,
    pub alerts_opened: u64,
    pub alerts_updated: u64,
    #[serde(default)]
    pub alerts_resolved: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub cancelled: bool,
    pub files: Vec<FileOutcome>,
    /// Pipelines whose source could not be listed.
    pub source_errors: Vec<String>,
    pub kpi: KpiRefresh,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl RunSummary {
    pub fn count(&self, disposition: FileDisposition) -> usize {
        self.files.iter().filter(|f| f.disposition == disposition).count()
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| f.disposition == FileDisposition::Failed)
    }

    pub fn totals(&self) -> MergeResult {
        let mut total = MergeResult::default();
        for merge in self.files.iter().filter_map(|f| f.merge.as_ref()) {
            total.inserted += merge.inserted;
            total.skipped_duplicate += merge.skipped_duplicate;
            total.updated += merge.updated;
            total.failed += merge.failed;
        }
        total
    }
}

struct Shared {
    config: EtlConfig,
    registry: PipelineRegistry,
    warehouse: Warehouse,
    calendar: FiscalCalendar,
    tracker: FileStateTracker,
    staging: StagingStore,
    loader: StagingLoader,
    merger: MergeEngine,
    facts: FactReader,
    kpis: KpiStore,
    archive: ExtractArchive,
    retry: RetryPolicy,
    run_guard: Mutex<()>,
}

#[derive(Clone)]
pub struct EtlPipeline {
    ctx: Arc<Shared>,
    sources: BTreeMap<String, Arc<dyn ExtractSource>>,
    cancel: Arc<AtomicBool>,
}

impl EtlPipeline {
    /// Connect using `config` and the registry at `<workspace>/pipelines.yaml`.
    pub async fn from_config(config: EtlConfig) -> Result<Self> {
        let registry = PipelineRegistry::load(&config.registry_path()).await?;
        Self::new(config, registry).await
    }

    pub async fn new(config: EtlConfig, registry: PipelineRegistry) -> Result<Self> {
        let warehouse = Warehouse::connect(&config.warehouse_config())
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        Self::with_warehouse(config, registry, warehouse).await
    }

    pub async fn with_warehouse(config: EtlConfig, registry: PipelineRegistry, warehouse: Warehouse) -> Result<Self> {
        registry.validate().context("validating pipeline registry")?;
        let calendar = FiscalCalendar::generate(registry.calendar.clone()).context("generating fiscal calendar")?;
        let stored = warehouse
            .store_calendar(&calendar)
            .await
            .context("storing fiscal calendar dimension")?;
        if stored > 0 {
            info!(days = stored, "fiscal calendar dimension extended");
        }

        let staging = StagingStore::new(warehouse.clone());
        let loader = StagingLoader::new(staging.clone(), registry.fact_types.clone())
            .context("compiling fact type schemas")?;

        let mut sources: BTreeMap<String, Arc<dyn ExtractSource>> = BTreeMap::new();
        for pipeline in &registry.pipelines {
            if let SourceConfig::Directory {
                path,
                patterns,
                recursive,
            } = &pipeline.source
            {
                let root = if path.is_absolute() {
                    path.clone()
                } else {
                    config.workspace_root.join(path)
                };
                let source = DirectorySource::new(root, patterns.clone()).recursive(*recursive);
                sources.insert(pipeline.name.clone(), Arc::new(source));
            }
        }

        let ctx = Shared {
            tracker: FileStateTracker::new(warehouse.clone(), config.lease()),
            merger: MergeEngine::new(warehouse.clone()),
            facts: FactReader::new(warehouse.clone()),
            kpis: KpiStore::new(warehouse.clone()),
            archive: ExtractArchive::new(config.archive_dir.clone()),
            retry: config.retry_policy(),
            run_guard: Mutex::new(()),
            staging,
            loader,
            calendar,
            warehouse,
            registry,
            config,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            sources,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Attach a source to a pipeline, e.g. the collector feeding a `collector` pipeline.
    pub fn with_source(mut self, pipeline_name: &str, source: Arc<dyn ExtractSource>) -> Self {
        self.sources.insert(pipeline_name.to_string(), source);
        self
    }

    /// Setting the flag stops the run from starting further files.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.ctx.warehouse
    }

    pub fn tracker(&self) -> &FileStateTracker {
        &self.ctx.tracker
    }

    pub fn calendar(&self) -> &FiscalCalendar {
        &self.ctx.calendar
    }

    pub fn kpi_store(&self) -> &KpiStore {
        &self.ctx.kpis
    }

    pub fn archive(&self) -> &ExtractArchive {
        &self.ctx.archive
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.ctx.registry
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_once_as_of(Utc::now().date_naive()).await
    }

    /// Run with KPI windows ending at `as_of`.
    pub async fn run_once_as_of(&self, as_of: NaiveDate) -> Result<RunSummary> {
        let _guard = self.ctx.run_guard.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run", %run_id);

        let (files, source_errors, cancelled) = self.import_all(run_id).instrument(span.clone()).await?;
        let kpi = self.ctx.refresh_kpis(as_of).instrument(span).await;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            as_of,
            cancelled,
            files,
            source_errors,
            kpi,
            reports_dir: String::new(),
            parquet_manifest: String::new(),
        };

        let reports_dir = report::write_run_reports(&self.ctx.config.reports_dir(), &summary).await?;
        let records = self.ctx.kpis.all_records().await.context("reading KPI records for snapshot")?;
        let cases = self.ctx.kpis.all_cases(None).await.context("reading alert cases for snapshot")?;
        let manifest = report::export_parquet_snapshots(&reports_dir, &summary.files, &records, &cases).await?;
        summary.reports_dir = reports_dir.display().to_string();
        summary.parquet_manifest = manifest.display().to_string();
        report::write_summary_json(&reports_dir, &summary).await?;

        info!(
            %run_id,
            merged = summary.count(FileDisposition::Merged),
            skipped = summary.count(FileDisposition::Skipped),
            failed = summary.count(FileDisposition::Failed),
            cancelled,
            "run finished"
        );
        Ok(summary)
    }

    async fn import_all(&self, run_id: Uuid) -> Result<(Vec<FileOutcome>, Vec<String>, bool)> {
        let limit = Arc::new(Semaphore::new(self.ctx.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut source_errors = Vec::new();
        let mut cancelled = false;

        'pipelines: for pipeline in self.ctx.registry.pipelines.iter().filter(|p| p.enabled) {
            let Some(source) = self.sources.get(&pipeline.name).cloned() else {
                warn!(pipeline = %pipeline.name, "no source attached; skipping");
                continue;
            };
            let files = match source.discover().await {
                Ok(files) => files,
                Err(err) => {
                    error!(pipeline = %pipeline.name, source = %source.describe(), error = %err, "discovery failed");
                    source_errors.push(format!("{}: {err}", pipeline.name));
                    continue;
                }
            };

            for file in files {
                if self.cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    break 'pipelines;
                }
                let permit = limit.clone().acquire_owned().await.context("acquiring import slot")?;
                let ctx = self.ctx.clone();
                let source = source.clone();
                let pipeline = pipeline.clone();
                let span = info_span!("import", pipeline = %pipeline.name, file = %file.path);
                tasks.spawn(
                    async move {
                        let outcome = ctx.import_file(run_id, &pipeline, source.as_ref(), file).await;
                        drop(permit);
                        outcome
                    }
                    .instrument(span),
                );
            }
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(error = %err, "import task aborted");
                    source_errors.push(format!("import task aborted: {err}"));
                }
            }
        }
        outcomes.sort_by(|a, b| (&a.pipeline_name, &a.file).cmp(&(&b.pipeline_name, &b.file)));
        Ok((outcomes, source_errors, cancelled))
    }

    /// Cron-driven runs when the scheduler is enabled; the caller starts it.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.ctx.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.ctx.config.sync_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(error = %message, "scheduled run failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

impl Shared {
    async fn import_file(
        &self,
        run_id: Uuid,
        pipeline: &PipelineConfig,
        source: &dyn ExtractSource,
        file: SourceFile,
    ) -> FileOutcome {
        let begun = self
            .retry
            .retry("beginning import", || {
                self.tracker.begin(&pipeline.name, &file.path, &file.fingerprint, run_id)
            })
            .await;

        let (state, resumed) = match begun {
            Ok(Begin::Skipped(_)) => return FileOutcome::new(&pipeline.name, &file, FileDisposition::Skipped),
            Ok(Begin::Started(state)) => (state, false),
            Ok(Begin::Resume(state)) => (state, true),
            Err(err @ EtlError::Conflict { .. }) => {
                warn!(error = %err, "file is being imported elsewhere");
                let mut outcome = FileOutcome::new(&pipeline.name, &file, FileDisposition::InFlight);
                outcome.error = Some(err.to_string());
                return outcome;
            }
            Err(err) => {
                error!(error = %err, "could not begin import");
                let mut outcome = FileOutcome::new(&pipeline.name, &file, FileDisposition::Failed);
                outcome.error = Some(err.to_string());
                return outcome;
            }
        };

        let mut outcome = FileOutcome::new(&pipeline.name, &file, FileDisposition::Merged);
        outcome.resumed = resumed;
        match self.stage_and_merge(pipeline, source, &file, &state, resumed, &mut outcome).await {
            Ok(merge) => {
                info!(
                    inserted = merge.inserted,
                    skipped = merge.skipped_duplicate,
                    updated = merge.updated,
                    conflicts = merge.failed,
                    resumed,
                    "file merged"
                );
                outcome.merge = Some(merge);
            }
            Err(err) => {
                error!(error = %err, kind = err.kind(), "import failed");
                // a rolled-back merge keeps its staged rows; the next run resumes it
                let recorded = match err {
                    EtlError::MergeFailure { .. } => self.tracker.release_staged(state.id, &err.to_string()).await,
                    _ => self.tracker.mark_failed(state.id, &err.to_string()).await,
                };
                if let Err(mark_err) = recorded {
                    error!(error = %mark_err, "could not record import failure");
                }
                outcome.disposition = FileDisposition::Failed;
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }

    async fn stage_and_merge(
        &self,
        pipeline: &PipelineConfig,
        source: &dyn ExtractSource,
        file: &SourceFile,
        state: &FileImportState,
        resumed: bool,
        outcome: &mut FileOutcome,
    ) -> EtlResult<MergeResult> {
        let batch = if resumed {
            self.resume_batch(state).await?
        } else {
            self.stage(pipeline, source, file, state).await?
        };
        outcome.rows_staged = batch.rows.len() as u64;
        outcome.rows_rejected = batch.rejected.len() as u64;

        self.retry
            .retry("merging staged batch", || self.merger.merge(&batch, pipeline.conflict_policy))
            .await
    }

    async fn stage(
        &self,
        pipeline: &PipelineConfig,
        source: &dyn ExtractSource,
        file: &SourceFile,
        state: &FileImportState,
    ) -> EtlResult<StagingBatch> {
        let bytes = source.read(file).await?;
        let fingerprint = mesw_storage::fingerprint(&bytes);
        if fingerprint != file.fingerprint {
            return Err(EtlError::Format {
                file: file.path.to_string(),
                message: "content changed between discovery and read; retried next run".to_string(),
            });
        }

        if let Err(err) = self.archive.store(&pipeline.name, file, &bytes).await {
            let message = format!("{err:#}");
            warn!(error = %message, "could not archive extract");
        }

        self.retry
            .retry("staging extract", || self.loader.load(state, &pipeline.fact_type, file, &bytes))
            .await
    }

    async fn resume_batch(&self, state: &FileImportState) -> EtlResult<StagingBatch> {
        self.staging
            .load_batch(state.id)
            .await?
            .ok_or_else(|| EtlError::NotFound(format!("staged rows of {}", state.file_path)))
    }

    async fn refresh_kpis(&self, as_of: NaiveDate) -> KpiRefresh {
        let mut refresh = KpiRefresh::default();
        for definition in &self.registry.kpis {
            let span = info_span!("kpi", kpi_id = %definition.kpi_id);
            match self.refresh_kpi(definition, as_of).instrument(span).await {
                Ok(written) => {
                    refresh.records_written += written.records_written;
                    refresh.records_removed += written.records_removed;
                    refresh.alerts_opened += written.alerts.opened;
                    refresh.alerts_updated += written.alerts.updated;
                    refresh.alerts_resolved += written.alerts.resolved;
                }
                Err(err) => {
                    error!(kpi_id = %definition.kpi_id, error = %err, "KPI refresh failed");
                    refresh.errors.push(format!("{}: {err}", definition.kpi_id));
                }
            }
        }
        refresh
    }

    async fn refresh_kpi(&self, definition: &mesw_kpi::KpiDefinition, as_of: NaiveDate) -> EtlResult<KpiWriteSummary> {
        let window = self
            .calendar
            .trailing_window(as_of, definition.grain, definition.lookback_periods)?;
        let facts = self
            .facts
            .in_date_range(&definition.fact_type, window.start, window.end)
            .await?;
        let records = aggregate_all(definition, &window, &facts, &self.calendar)?;
        self.kpis
            .refresh_kpi(&definition.kpi_id, &window, &records, &self.registry.thresholds, as_of)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::REGISTRY_YAML;
    use mesw_core::{AlertStatus, ImportStatus};
    use mesw_extract::InMemorySource;
    use rust_decimal::Decimal;
    use std::path::Path;

    const HEADER: &str = "Batch No.,Op,Date,Work Center,Yield,Total\n";

    fn mes_rows(range: std::ops::Range<u32>, good: u32) -> String {
        mes_rows_on("L1", range, good)
    }

    fn mes_rows_on(line: &str, range: std::ops::Range<u32>, good: u32) -> String {
        let mut body = String::from(HEADER);
        for i in range {
            let day = 9 + (i % 5);
            body.push_str(&format!("B{i:04},OP10,2026-02-{day:02},{line},{good},100\n"));
        }
        body
    }

    async fn pipeline(root: &Path) -> EtlPipeline {
        let registry = PipelineRegistry::from_yaml_str(REGISTRY_YAML).expect("registry");
        EtlPipeline::new(EtlConfig::for_workspace(root), registry)
            .await
            .expect("pipeline")
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
    }

    #[tokio::test]
    async fn monthly_extract_is_imported_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        let extract = dir.path().join("drop").join("mes_2026_02.csv");
        std::fs::write(&extract, mes_rows(0..100, 95)).expect("write extract");
        let pipeline = pipeline(dir.path()).await;

        let first = pipeline.run_once_as_of(as_of()).await.expect("first run");
        assert_eq!(first.count(FileDisposition::Merged), 1);
        assert_eq!(first.totals().inserted, 100);
        assert_eq!(FactReader::new(pipeline.warehouse().clone()).count("mes_output").await.expect("count"), 100);

        let second = pipeline.run_once_as_of(as_of()).await.expect("second run");
        assert_eq!(second.count(FileDisposition::Skipped), 1);
        assert_eq!(second.totals().inserted, 0);

        // a re-extract of the same path with three known keys and two new ones
        let mut body = String::from(HEADER);
        for i in [0u32, 1, 2, 100, 101] {
            body.push_str(&format!("B{i:04},OP10,2026-02-{:02},L1,95,100\n", 9 + (i % 5)));
        }
        std::fs::write(&extract, body).expect("rewrite extract");
        let third = pipeline.run_once_as_of(as_of()).await.expect("third run");
        let merge = third.files[0].merge.clone().expect("merged");
        assert_eq!((merge.inserted, merge.skipped_duplicate, merge.updated), (2, 3, 0));

        let state = pipeline
            .tracker()
            .lookup("mes_output", &FileKey::new(&extract.to_string_lossy()))
            .await
            .expect("lookup")
            .expect("state");
        assert_eq!(state.status, ImportStatus::Merged);
        assert_eq!(state.rows_imported, 5);
        let archived = pipeline.archive().versions("mes_output", &state.file_path).await.expect("archive");
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[1].fingerprint, state.fingerprint);
        assert!(Path::new(&third.parquet_manifest).exists());
        assert!(Path::new(&third.reports_dir).join("run_summary.md").exists());
    }

    #[tokio::test]
    async fn bad_files_fail_without_aborting_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        std::fs::write(dir.path().join("drop").join("mes_2026_01.csv"), "Charge,Op\nB1,OP10\n").expect("write bad");
        std::fs::write(dir.path().join("drop").join("mes_2026_02.csv"), mes_rows(0..10, 95)).expect("write good");
        let pipeline = pipeline(dir.path()).await;

        let summary = pipeline.run_once_as_of(as_of()).await.expect("run");
        assert_eq!(summary.count(FileDisposition::Merged), 1);
        let failed: Vec<_> = summary.failed_files().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap_or_default().contains("posting_date"));

        let failed_states = pipeline
            .tracker()
            .list("mes_output", Some(ImportStatus::Failed))
            .await
            .expect("list");
        assert_eq!(failed_states.len(), 1);
        assert!(failed_states[0].error_detail.is_some());

        let markdown = std::fs::read_to_string(Path::new(&summary.reports_dir).join("run_summary.md")).expect("report");
        assert!(markdown.contains("mes_2026_01.csv"));
    }

    #[tokio::test]
    async fn abandoned_staged_file_resumes_at_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        let body = mes_rows(0..20, 95);
        let extract = dir.path().join("drop").join("mes_2026_02.csv");
        std::fs::write(&extract, &body).expect("write extract");

        let registry = PipelineRegistry::from_yaml_str(REGISTRY_YAML).expect("registry");
        let mut config = EtlConfig::for_workspace(dir.path());
        config.lease_secs = 0;
        let pipeline = EtlPipeline::new(config, registry).await.expect("pipeline");

        // stage without merging, as a run that crashed after staging would
        let key = FileKey::new(&extract.to_string_lossy());
        let fingerprint = mesw_storage::fingerprint(body.as_bytes());
        let Begin::Started(state) = pipeline
            .tracker()
            .begin("mes_output", &key, &fingerprint, Uuid::new_v4())
            .await
            .expect("begin")
        else {
            panic!("expected start");
        };
        let source = DirectorySource::new(dir.path().join("drop"), vec!["mes_*.csv".into()]);
        let file = source.discover().await.expect("discover").remove(0);
        pipeline
            .ctx
            .loader
            .load(&state, "mes_output", &file, body.as_bytes())
            .await
            .expect("stage");

        let summary = pipeline.run_once_as_of(as_of()).await.expect("run");
        assert!(summary.files[0].resumed);
        assert_eq!(summary.files[0].disposition, FileDisposition::Merged);
        assert_eq!(summary.totals().inserted, 20);
    }

    #[tokio::test]
    async fn changed_fingerprint_reimports_and_kpis_raise_alerts() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        let extract = dir.path().join("drop").join("mes_2026_02.csv");
        std::fs::write(&extract, mes_rows(0..10, 95)).expect("write");
        let pipeline = pipeline(dir.path()).await;
        let first = pipeline.run_once_as_of(as_of()).await.expect("first");
        assert_eq!(first.kpi.alerts_opened, 0);
        assert!(first.kpi.records_written > 0);

        std::fs::write(&extract, mes_rows(0..10, 80)).expect("rewrite");
        let second = pipeline.run_once_as_of(as_of()).await.expect("second");
        let merge = second.files[0].merge.clone().expect("merge");
        assert_eq!(merge.updated, 10);
        assert_eq!(second.kpi.alerts_opened, 1);

        let open = pipeline.kpi_store().open_cases(Some("first_pass_yield")).await.expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tag, "L1");
        assert_eq!(open[0].observed_value, Decimal::from(80));
        assert_eq!(open[0].status, AlertStatus::Open);

        let third = pipeline.run_once_as_of(as_of()).await.expect("third");
        assert_eq!(third.kpi.alerts_opened, 0);
        assert_eq!(pipeline.kpi_store().all_cases(None).await.expect("cases").len(), 1);
    }

    #[tokio::test]
    async fn corrected_reimport_resolves_the_stale_case() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        let extract = dir.path().join("drop").join("mes_2026_02.csv");
        std::fs::write(&extract, mes_rows(0..10, 80)).expect("write");
        let pipeline = pipeline(dir.path()).await;
        let first = pipeline.run_once_as_of(as_of()).await.expect("first");
        assert_eq!(first.kpi.alerts_opened, 1);

        std::fs::write(&extract, mes_rows(0..10, 95)).expect("correct");
        let second = pipeline.run_once_as_of(as_of()).await.expect("second");
        assert_eq!(second.files[0].merge.as_ref().map(|m| m.updated), Some(10));
        assert_eq!(second.kpi.alerts_resolved, 1);

        let l1 = pipeline.kpi_store().records("first_pass_yield", Some("L1")).await.expect("records");
        let week = l1
            .iter()
            .find(|r| r.created_date == NaiveDate::from_ymd_opt(2026, 2, 9).unwrap())
            .expect("week of Feb 9");
        assert_eq!(week.progress_value, Some(Decimal::from(95)));

        assert!(pipeline.kpi_store().open_cases(None).await.expect("open").is_empty());
        let cases = pipeline.kpi_store().all_cases(None).await.expect("cases");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].status, AlertStatus::Resolved);
        assert_eq!(cases[0].resolved_date, Some(as_of()));
    }

    #[tokio::test]
    async fn facts_moved_to_another_line_drop_the_old_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        let extract = dir.path().join("drop").join("mes_2026_02.csv");
        std::fs::write(&extract, mes_rows(0..10, 80)).expect("write");
        let pipeline = pipeline(dir.path()).await;
        pipeline.run_once_as_of(as_of()).await.expect("first");

        std::fs::write(&extract, mes_rows_on("L2", 0..10, 80)).expect("move to L2");
        let second = pipeline.run_once_as_of(as_of()).await.expect("second");
        assert_eq!(second.files[0].merge.as_ref().map(|m| m.updated), Some(10));
        assert!(second.kpi.records_removed > 0);

        let store = pipeline.kpi_store();
        assert!(store.records("first_pass_yield", Some("L1")).await.expect("L1").is_empty());
        assert!(!store.records("first_pass_yield", Some("L2")).await.expect("L2").is_empty());

        let cases = store.all_cases(Some("first_pass_yield")).await.expect("cases");
        let l1 = cases.iter().find(|c| c.tag == "L1").expect("L1 case");
        assert_eq!(l1.status, AlertStatus::Resolved);
        let open = store.open_cases(None).await.expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tag, "L2");
    }

    #[tokio::test]
    async fn collector_batches_use_the_reject_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        std::fs::write(dir.path().join("drop").join("mes_2026_02.csv"), mes_rows(0..3, 95)).expect("write");
        let collector = Arc::new(InMemorySource::new("line-collector"));
        let pipeline = pipeline(dir.path()).await.with_source("collector", collector.clone());
        let first = pipeline.run_once_as_of(as_of()).await.expect("first run");
        assert_eq!(first.count(FileDisposition::Merged), 1);

        collector
            .push(
                "batch_0001.json",
                br#"[{"Batch No.": "B0000", "Op": "OP10", "Date": "2026-02-09", "Work Center": "L1", "Yield": 10, "Total": 100},
                     {"Batch No.": "B0900", "Op": "OP10", "Date": "2026-02-10", "Work Center": "L1", "Yield": 99, "Total": 100}]"#
                    .to_vec(),
            )
            .await;
        let summary = pipeline.run_once_as_of(as_of()).await.expect("second run");
        assert_eq!(summary.count(FileDisposition::Skipped), 1);
        let collected = summary
            .files
            .iter()
            .find(|f| f.pipeline_name == "collector")
            .and_then(|f| f.merge.clone())
            .expect("collector merge");
        assert_eq!((collected.inserted, collected.failed), (1, 1));
        assert_eq!(collected.conflicts[0].natural_key.parts()[0], "B0000");
    }

    #[tokio::test]
    async fn cancelled_run_starts_no_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("drop")).expect("drop dir");
        std::fs::write(dir.path().join("drop").join("mes_2026_02.csv"), mes_rows(0..3, 95)).expect("write");
        let pipeline = pipeline(dir.path()).await;
        pipeline.cancel_handle().store(true, Ordering::SeqCst);

        let summary = pipeline.run_once_as_of(as_of()).await.expect("run");
        assert!(summary.cancelled);
        assert!(summary.files.is_empty());
    }
}
