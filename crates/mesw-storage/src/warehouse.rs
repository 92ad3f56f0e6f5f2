//! SQLite warehouse connection and schema.

use std::str::FromStr;
use std::time::Duration;

use mesw_core::{EtlError, EtlResult, FiscalCalendar};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use crate::bounded;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS file_import_state (
    id TEXT PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    file_path TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'staged', 'merged', 'failed')),
    rows_imported INTEGER NOT NULL DEFAULT 0,
    rows_rejected INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    run_id TEXT,
    lease_expires_at TEXT,
    last_attempt_at TEXT NOT NULL,
    error_detail TEXT,
    UNIQUE (pipeline_name, file_path)
);

CREATE TABLE IF NOT EXISTS staging_batches (
    state_id TEXT PRIMARY KEY REFERENCES file_import_state(id) ON DELETE CASCADE,
    fact_type TEXT NOT NULL,
    source TEXT NOT NULL,
    staged_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS staging_rows (
    state_id TEXT NOT NULL REFERENCES file_import_state(id) ON DELETE CASCADE,
    line_no INTEGER NOT NULL,
    natural_key TEXT NOT NULL,
    event_date TEXT,
    attributes TEXT NOT NULL,
    PRIMARY KEY (state_id, line_no)
);

CREATE TABLE IF NOT EXISTS staging_rejects (
    state_id TEXT NOT NULL REFERENCES file_import_state(id) ON DELETE CASCADE,
    line_no INTEGER NOT NULL,
    reason TEXT NOT NULL,
    PRIMARY KEY (state_id, line_no)
);

CREATE TABLE IF NOT EXISTS facts (
    fact_type TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    event_date TEXT,
    attributes TEXT NOT NULL,
    source_file TEXT NOT NULL,
    imported_at TEXT NOT NULL,
    PRIMARY KEY (fact_type, natural_key)
);

CREATE INDEX IF NOT EXISTS idx_facts_event_date ON facts (fact_type, event_date);

CREATE TABLE IF NOT EXISTS fiscal_calendar (
    date TEXT PRIMARY KEY,
    fiscal_year INTEGER NOT NULL,
    fiscal_week INTEGER NOT NULL,
    fiscal_month INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS kpi_records (
    kpi_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    created_date TEXT NOT NULL,
    progress_value TEXT,
    details TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (kpi_id, tag, created_date)
);

CREATE TABLE IF NOT EXISTS alert_cases (
    id TEXT PRIMARY KEY,
    kpi_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    trigger_date TEXT NOT NULL,
    threshold TEXT NOT NULL,
    observed_value TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('open', 'acknowledged', 'resolved')),
    resolved_date TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (kpi_id, tag, trigger_date)
);
"#;

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./warehouse.db".to_string(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl WarehouseConfig {
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Shared handle to the warehouse database.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
    statement_timeout: Duration,
}

impl Warehouse {
    pub async fn connect(config: &WarehouseConfig) -> EtlResult<Self> {
        let opts = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(storage_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(opts)
            .await
            .map_err(storage_error)?;

        let warehouse = Self {
            pool,
            statement_timeout: config.statement_timeout,
        };
        warehouse.migrate().await?;
        info!(database_url = %config.database_url, "warehouse ready");
        Ok(warehouse)
    }

    pub async fn migrate(&self) -> EtlResult<()> {
        bounded(self.statement_timeout, "migrating warehouse schema", async {
            sqlx::raw_sql(SCHEMA_SQL)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(())
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// Persist the fiscal calendar dimension; existing dates are left untouched.
    pub async fn store_calendar(&self, calendar: &FiscalCalendar) -> EtlResult<u64> {
        bounded(self.statement_timeout, "storing fiscal calendar", async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            let mut inserted = 0u64;
            for period in calendar.iter() {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO fiscal_calendar (date, fiscal_year, fiscal_week, fiscal_month) VALUES (?, ?, ?, ?)",
                )
                .bind(period.date)
                .bind(period.fiscal_year)
                .bind(period.fiscal_week)
                .bind(period.fiscal_month)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
                inserted += result.rows_affected();
            }
            tx.commit().await.map_err(storage_error)?;
            Ok(inserted)
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map driver failures onto the error taxonomy; lock contention and pool exhaustion are timeouts.
pub fn storage_error(err: sqlx::Error) -> EtlError {
    match err {
        sqlx::Error::PoolTimedOut => EtlError::Timeout {
            operation: "acquiring warehouse connection".to_string(),
            elapsed_ms: 0,
        },
        sqlx::Error::Database(ref db_err)
            if db_err.message().contains("database is locked")
                || db_err.message().contains("database table is locked") =>
        {
            EtlError::Timeout {
                operation: format!("waiting on warehouse lock: {}", db_err.message()),
                elapsed_ms: 0,
            }
        }
        other => EtlError::Storage(Box::new(other)),
    }
}
