//! File State Tracker: the only owner of `file_import_state`.
//!
//! Every file moves `pending -> staged -> merged`; `failed` is reachable from the two
//! in-flight states and a later `begin` resets it to `pending`. In-flight states carry
//! a lease; a live lease held by another attempt makes `begin` fail with `Conflict`,
//! an expired one is taken over (a crashed run's staged file resumes at merge).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mesw_core::{EtlError, EtlResult, FileImportState, FileKey, ImportStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

use crate::staging::clear_staging_in;
use crate::{bounded, storage_error, Warehouse};

/// Outcome of claiming a file for import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// Fresh cycle at `pending`; the file must be staged.
    Started(FileImportState),
    /// Staged rows from an abandoned attempt are still valid; go straight to merge.
    Resume(FileImportState),
    /// Same content already merged; nothing to do.
    Skipped(FileImportState),
}

impl Begin {
    pub fn state(&self) -> &FileImportState {
        match self {
            Begin::Started(s) | Begin::Resume(s) | Begin::Skipped(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStateTracker {
    warehouse: Warehouse,
    lease: ChronoDuration,
}

impl FileStateTracker {
    pub fn new(warehouse: Warehouse, lease: ChronoDuration) -> Self {
        Self { warehouse, lease }
    }

    pub fn lease(&self) -> ChronoDuration {
        self.lease
    }

    pub async fn lookup(&self, pipeline_name: &str, file_path: &FileKey) -> EtlResult<Option<FileImportState>> {
        bounded(self.warehouse.statement_timeout(), "looking up import state", async {
            let mut conn = self.warehouse.pool().acquire().await.map_err(storage_error)?;
            fetch_by_key(&mut conn, pipeline_name, file_path).await
        })
        .await
    }

    pub async fn get(&self, state_id: Uuid) -> EtlResult<FileImportState> {
        bounded(self.warehouse.statement_timeout(), "loading import state", async {
            let mut conn = self.warehouse.pool().acquire().await.map_err(storage_error)?;
            fetch_by_id(&mut conn, state_id)
                .await?
                .ok_or_else(|| EtlError::NotFound(format!("import state {state_id}")))
        })
        .await
    }

    /// Import states of one pipeline, optionally narrowed to one status.
    pub async fn list(&self, pipeline_name: &str, status: Option<ImportStatus>) -> EtlResult<Vec<FileImportState>> {
        bounded(self.warehouse.statement_timeout(), "listing import states", async {
            let rows = match status {
                Some(status) => {
                    sqlx::query(
                        "SELECT * FROM file_import_state WHERE pipeline_name = ? AND status = ? ORDER BY file_path",
                    )
                    .bind(pipeline_name)
                    .bind(status.as_str())
                    .fetch_all(self.warehouse.pool())
                    .await
                }
                None => {
                    sqlx::query("SELECT * FROM file_import_state WHERE pipeline_name = ? ORDER BY file_path")
                        .bind(pipeline_name)
                        .fetch_all(self.warehouse.pool())
                        .await
                }
            }
            .map_err(storage_error)?;
            rows.iter().map(state_from_row).collect()
        })
        .await
    }

    pub async fn begin(
        &self,
        pipeline_name: &str,
        file_path: &FileKey,
        fingerprint: &str,
        run_id: Uuid,
    ) -> EtlResult<Begin> {
        self.begin_at(pipeline_name, file_path, fingerprint, run_id, Utc::now())
            .await
    }

    pub async fn begin_at(
        &self,
        pipeline_name: &str,
        file_path: &FileKey,
        fingerprint: &str,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> EtlResult<Begin> {
        bounded(self.warehouse.statement_timeout(), "beginning import", async {
            let lease_expires_at = now + self.lease;
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;

            let outcome = match fetch_by_key(&mut tx, pipeline_name, file_path).await? {
                None => {
                    let id = Uuid::new_v4();
                    let inserted = sqlx::query(
                        "INSERT INTO file_import_state (id, pipeline_name, file_path, fingerprint, status, attempts, run_id, lease_expires_at, last_attempt_at)
                         VALUES (?, ?, ?, ?, 'pending', 1, ?, ?, ?)",
                    )
                    .bind(id.to_string())
                    .bind(pipeline_name)
                    .bind(file_path.as_str())
                    .bind(fingerprint)
                    .bind(run_id.to_string())
                    .bind(lease_expires_at)
                    .bind(now)
                    .execute(&mut *tx)
                    .await;
                    if let Err(sqlx::Error::Database(ref db_err)) = inserted {
                        if db_err.is_unique_violation() {
                            return Err(EtlError::Conflict {
                                pipeline: pipeline_name.to_string(),
                                file: file_path.to_string(),
                                status: ImportStatus::Pending,
                            });
                        }
                    }
                    inserted.map_err(storage_error)?;
                    Begin::Started(expect_state(&mut tx, id).await?)
                }
                Some(state) => match state.status {
                    ImportStatus::Merged if state.fingerprint == fingerprint => Begin::Skipped(state),
                    ImportStatus::Merged | ImportStatus::Failed => {
                        reset_to_pending(&mut tx, &state, fingerprint, run_id, lease_expires_at, now).await?;
                        Begin::Started(expect_state(&mut tx, state.id).await?)
                    }
                    ImportStatus::Pending | ImportStatus::Staged => {
                        // A run may re-enter its own lease when it retries `begin`.
                        let held_elsewhere = state.run_id != Some(run_id)
                            && state.lease_expires_at.is_some_and(|expires| expires > now);
                        if held_elsewhere {
                            return Err(EtlError::Conflict {
                                pipeline: pipeline_name.to_string(),
                                file: file_path.to_string(),
                                status: state.status,
                            });
                        }
                        if state.status == ImportStatus::Staged && state.fingerprint == fingerprint {
                            sqlx::query(
                                "UPDATE file_import_state SET run_id = ?, lease_expires_at = ?, last_attempt_at = ?, attempts = attempts + 1 WHERE id = ?",
                            )
                            .bind(run_id.to_string())
                            .bind(lease_expires_at)
                            .bind(now)
                            .bind(state.id.to_string())
                            .execute(&mut *tx)
                            .await
                            .map_err(storage_error)?;
                            info!(pipeline_name, file = %file_path, "taking over abandoned staged import");
                            Begin::Resume(expect_state(&mut tx, state.id).await?)
                        } else {
                            reset_to_pending(&mut tx, &state, fingerprint, run_id, lease_expires_at, now).await?;
                            Begin::Started(expect_state(&mut tx, state.id).await?)
                        }
                    }
                },
            };

            tx.commit().await.map_err(storage_error)?;
            debug!(pipeline_name, file = %file_path, outcome = ?outcome_name(&outcome), "import begun");
            Ok(outcome)
        })
        .await
    }

    pub async fn mark_staged(&self, state_id: Uuid, row_count: u64, rejected: u64) -> EtlResult<FileImportState> {
        bounded(self.warehouse.statement_timeout(), "marking import staged", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            mark_staged_in(&mut tx, state_id, row_count, rejected, Utc::now()).await?;
            let state = expect_state(&mut tx, state_id).await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(state)
        })
        .await
    }

    pub async fn mark_merged(&self, state_id: Uuid, row_count: u64) -> EtlResult<FileImportState> {
        bounded(self.warehouse.statement_timeout(), "marking import merged", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            mark_merged_in(&mut tx, state_id, row_count, Utc::now()).await?;
            clear_staging_in(&mut tx, state_id).await?;
            let state = expect_state(&mut tx, state_id).await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(state)
        })
        .await
    }

    /// Record a failure with its detail and drop any staged rows.
    pub async fn mark_failed(&self, state_id: Uuid, error: &str) -> EtlResult<FileImportState> {
        bounded(self.warehouse.statement_timeout(), "marking import failed", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            let result = sqlx::query(
                "UPDATE file_import_state
                 SET status = 'failed', error_detail = ?, run_id = NULL, lease_expires_at = NULL, last_attempt_at = ?
                 WHERE id = ? AND status IN ('pending', 'staged')",
            )
            .bind(error)
            .bind(Utc::now())
            .bind(state_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
            if result.rows_affected() == 0 {
                return Err(transition_error(&mut tx, state_id, ImportStatus::Failed).await);
            }
            clear_staging_in(&mut tx, state_id).await?;
            let state = expect_state(&mut tx, state_id).await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(state)
        })
        .await
    }

    /// Keep a `staged` file and its rows for the next run, recording why the merge did not commit.
    pub async fn release_staged(&self, state_id: Uuid, error: &str) -> EtlResult<FileImportState> {
        bounded(self.warehouse.statement_timeout(), "releasing staged import", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            let result = sqlx::query(
                "UPDATE file_import_state
                 SET error_detail = ?, run_id = NULL, lease_expires_at = NULL, last_attempt_at = ?
                 WHERE id = ? AND status = 'staged'",
            )
            .bind(error)
            .bind(Utc::now())
            .bind(state_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
            if result.rows_affected() == 0 {
                return Err(transition_error(&mut tx, state_id, ImportStatus::Staged).await);
            }
            let state = expect_state(&mut tx, state_id).await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(state)
        })
        .await
    }
}

fn outcome_name(outcome: &Begin) -> &'static str {
    match outcome {
        Begin::Started(_) => "started",
        Begin::Resume(_) => "resume",
        Begin::Skipped(_) => "skipped",
    }
}

/// `pending -> staged` inside the caller's transaction.
pub async fn mark_staged_in(
    conn: &mut SqliteConnection,
    state_id: Uuid,
    row_count: u64,
    rejected: u64,
    now: DateTime<Utc>,
) -> EtlResult<()> {
    let result = sqlx::query(
        "UPDATE file_import_state SET status = 'staged', rows_imported = ?, rows_rejected = ?, last_attempt_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(row_count as i64)
    .bind(rejected as i64)
    .bind(now)
    .bind(state_id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    if result.rows_affected() == 0 {
        return Err(transition_error(conn, state_id, ImportStatus::Staged).await);
    }
    Ok(())
}

/// `staged -> merged` inside the caller's transaction; releases the lease.
pub async fn mark_merged_in(
    conn: &mut SqliteConnection,
    state_id: Uuid,
    row_count: u64,
    now: DateTime<Utc>,
) -> EtlResult<()> {
    let result = sqlx::query(
        "UPDATE file_import_state
         SET status = 'merged', rows_imported = ?, error_detail = NULL, run_id = NULL, lease_expires_at = NULL, last_attempt_at = ?
         WHERE id = ? AND status = 'staged'",
    )
    .bind(row_count as i64)
    .bind(now)
    .bind(state_id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    if result.rows_affected() == 0 {
        return Err(transition_error(conn, state_id, ImportStatus::Merged).await);
    }
    Ok(())
}

async fn reset_to_pending(
    conn: &mut SqliteConnection,
    state: &FileImportState,
    fingerprint: &str,
    run_id: Uuid,
    lease_expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EtlResult<()> {
    clear_staging_in(conn, state.id).await?;
    sqlx::query(
        "UPDATE file_import_state
         SET status = 'pending', fingerprint = ?, rows_imported = 0, rows_rejected = 0, attempts = attempts + 1,
             run_id = ?, lease_expires_at = ?, last_attempt_at = ?, error_detail = NULL
         WHERE id = ?",
    )
    .bind(fingerprint)
    .bind(run_id.to_string())
    .bind(lease_expires_at)
    .bind(now)
    .bind(state.id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    info!(
        pipeline_name = %state.pipeline_name,
        file = %state.file_path,
        previous = %state.status,
        "import state reset to pending"
    );
    Ok(())
}

async fn transition_error(conn: &mut SqliteConnection, state_id: Uuid, to: ImportStatus) -> EtlError {
    match fetch_by_id(conn, state_id).await {
        Ok(Some(state)) => EtlError::InvalidTransition {
            state_id,
            from: state.status,
            to,
        },
        Ok(None) => EtlError::NotFound(format!("import state {state_id}")),
        Err(err) => err,
    }
}

async fn expect_state(conn: &mut SqliteConnection, state_id: Uuid) -> EtlResult<FileImportState> {
    fetch_by_id(conn, state_id)
        .await?
        .ok_or_else(|| EtlError::NotFound(format!("import state {state_id}")))
}

async fn fetch_by_id(conn: &mut SqliteConnection, state_id: Uuid) -> EtlResult<Option<FileImportState>> {
    let row = sqlx::query("SELECT * FROM file_import_state WHERE id = ?")
        .bind(state_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.as_ref().map(state_from_row).transpose()
}

async fn fetch_by_key(
    conn: &mut SqliteConnection,
    pipeline_name: &str,
    file_path: &FileKey,
) -> EtlResult<Option<FileImportState>> {
    let row = sqlx::query("SELECT * FROM file_import_state WHERE pipeline_name = ? AND file_path = ?")
        .bind(pipeline_name)
        .bind(file_path.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.as_ref().map(state_from_row).transpose()
}

pub(crate) fn state_from_row(row: &SqliteRow) -> EtlResult<FileImportState> {
    let id: String = row.try_get("id").map_err(storage_error)?;
    let status: String = row.try_get("status").map_err(storage_error)?;
    let run_id: Option<String> = row.try_get("run_id").map_err(storage_error)?;
    let file_path: String = row.try_get("file_path").map_err(storage_error)?;
    let rows_imported: i64 = row.try_get("rows_imported").map_err(storage_error)?;
    let rows_rejected: i64 = row.try_get("rows_rejected").map_err(storage_error)?;
    let attempts: i64 = row.try_get("attempts").map_err(storage_error)?;

    Ok(FileImportState {
        id: parse_uuid(&id)?,
        pipeline_name: row.try_get("pipeline_name").map_err(storage_error)?,
        file_path: FileKey::new(&file_path),
        fingerprint: row.try_get("fingerprint").map_err(storage_error)?,
        status: status.parse()?,
        rows_imported: rows_imported.max(0) as u64,
        rows_rejected: rows_rejected.max(0) as u64,
        attempts: attempts.max(0) as u32,
        run_id: run_id.as_deref().map(parse_uuid).transpose()?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(storage_error)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(storage_error)?,
        error_detail: row.try_get("error_detail").map_err(storage_error)?,
    })
}

pub(crate) fn parse_uuid(raw: &str) -> EtlResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| EtlError::Storage(Box::new(err)))
}
