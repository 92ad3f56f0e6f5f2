//! Pipeline orchestration: discover, stage, merge, aggregate, alert, report.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mesw_core::{ConflictPolicy, EtlError, EtlResult, FiscalCalendarConfig};
use mesw_extract::FactTypeConfig;
use mesw_kpi::{KpiDefinition, ThresholdConfig};
use mesw_storage::{RetryPolicy, WarehouseConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub mod merge;
pub mod pipeline;
pub mod report;

pub use merge::MergeEngine;
pub use pipeline::{EtlPipeline, FileDisposition, FileOutcome, KpiRefresh, RunSummary};
pub use report::report_runs_markdown;

pub const CRATE_NAME: &str = "mesw-sync";

pub const REGISTRY_FILE: &str = "pipelines.yaml";

/// Domain configuration loaded from `pipelines.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRegistry {
    pub calendar: FiscalCalendarConfig,
    pub fact_types: Vec<FactTypeConfig>,
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub kpis: Vec<KpiDefinition>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub fact_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: SourceConfig,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Drop directory, relative to the workspace root unless absolute.
    Directory {
        path: PathBuf,
        #[serde(default)]
        patterns: Vec<String>,
        #[serde(default)]
        recursive: bool,
    },
    /// Batches pushed by an external collector and registered at runtime.
    Collector { label: String },
}

impl PipelineRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing pipeline registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> EtlResult<()> {
        let fact_types: BTreeSet<&str> = self.fact_types.iter().map(|f| f.fact_type.as_str()).collect();
        if fact_types.len() != self.fact_types.len() {
            return Err(EtlError::Config("duplicate fact type definitions".to_string()));
        }

        let mut names = BTreeSet::new();
        for pipeline in &self.pipelines {
            if !names.insert(pipeline.name.as_str()) {
                return Err(EtlError::Config(format!("duplicate pipeline `{}`", pipeline.name)));
            }
            if !fact_types.contains(pipeline.fact_type.as_str()) {
                return Err(EtlError::Config(format!(
                    "pipeline `{}` loads unknown fact type `{}`",
                    pipeline.name, pipeline.fact_type
                )));
            }
        }

        let mut kpi_ids = BTreeSet::new();
        for kpi in &self.kpis {
            kpi.validate()?;
            if !kpi_ids.insert(kpi.kpi_id.as_str()) {
                return Err(EtlError::Config(format!("duplicate KPI `{}`", kpi.kpi_id)));
            }
            if !fact_types.contains(kpi.fact_type.as_str()) {
                return Err(EtlError::Config(format!(
                    "KPI `{}` reads unknown fact type `{}`",
                    kpi.kpi_id, kpi.fact_type
                )));
            }
        }
        for threshold in &self.thresholds {
            if !kpi_ids.contains(threshold.kpi_id.as_str()) {
                return Err(EtlError::Config(format!(
                    "threshold references unknown KPI `{}`",
                    threshold.kpi_id
                )));
            }
        }
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub archive_dir: PathBuf,
    pub db_timeout_secs: u64,
    pub max_retries: usize,
    pub lease_secs: i64,
    pub concurrency: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl EtlConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("MESW_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./warehouse.db".to_string()),
            archive_dir: std::env::var("MESW_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("archive")),
            db_timeout_secs: env_number("MESW_DB_TIMEOUT_SECS", 30),
            max_retries: env_number("MESW_MAX_RETRIES", 3),
            lease_secs: env_number("MESW_LEASE_SECS", 900),
            concurrency: env_number("MESW_CONCURRENCY", 4),
            scheduler_enabled: std::env::var("MESW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("MESW_SYNC_CRON").unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            workspace_root,
        }
    }

    /// Self-contained configuration rooted at `root`, with the database inside it.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_url: format!("sqlite://{}", root.join("warehouse.db").display()),
            archive_dir: root.join("archive"),
            db_timeout_secs: 30,
            max_retries: 3,
            lease_secs: 900,
            concurrency: 4,
            scheduler_enabled: false,
            sync_cron: "0 */30 * * * *".to_string(),
            workspace_root: root,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn warehouse_config(&self) -> WarehouseConfig {
        let timeout = Duration::from_secs(self.db_timeout_secs.max(1));
        WarehouseConfig {
            database_url: self.database_url.clone(),
            max_connections: (self.concurrency as u32).max(2),
            acquire_timeout: timeout,
            statement_timeout: timeout,
            ..WarehouseConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.max_retries)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.max(0))
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// One run with configuration from the environment and `pipelines.yaml`.
pub async fn run_once_from_env() -> Result<RunSummary> {
    let pipeline = EtlPipeline::from_config(EtlConfig::from_env()).await?;
    pipeline.run_once().await
}


#[cfg(test)]
mod tests {
    use super::test_support::REGISTRY_YAML;
    use super::*;

    #[test]
    fn registry_parses_and_validates() {
        let registry = PipelineRegistry::from_yaml_str(REGISTRY_YAML).expect("registry");
        assert_eq!(registry.pipelines.len(), 2);
        assert_eq!(
            registry.pipeline("collector").map(|p| p.conflict_policy),
            Some(ConflictPolicy::RejectAndReport)
        );
        assert!(matches!(
            registry.pipeline("mes_output").map(|p| &p.source),
            Some(SourceConfig::Directory { .. })
        ));
        assert_eq!(registry.kpis[0].sparse, mesw_kpi::SparsePolicy::Null);
    }

    #[test]
    fn registry_rejects_dangling_references() {
        let broken = REGISTRY_YAML.replace("kpi_id: first_pass_yield\n    direction", "kpi_id: scrap_rate\n    direction");
        assert!(PipelineRegistry::from_yaml_str(&broken).is_err());

        let broken = REGISTRY_YAML.replace("  - name: collector\n    fact_type: mes_output", "  - name: collector\n    fact_type: sap_orders");
        assert!(PipelineRegistry::from_yaml_str(&broken).is_err());
    }

    #[test]
    fn bundled_registry_is_valid() {
        let registry = PipelineRegistry::from_yaml_str(include_str!("../../../pipelines.yaml")).expect("registry");
        assert_eq!(registry.pipelines.len(), 2);
        assert_eq!(registry.kpis.len(), 3);
    }

    #[test]
    fn workspace_config_keeps_everything_under_root() {
        let config = EtlConfig::for_workspace("/srv/mesw");
        assert_eq!(config.database_url, "sqlite:///srv/mesw/warehouse.db");
        assert_eq!(config.registry_path(), PathBuf::from("/srv/mesw/pipelines.yaml"));
        assert_eq!(config.lease(), chrono::Duration::seconds(900));
        assert_eq!(config.retry_policy().max_retries, 3);
    }
}
