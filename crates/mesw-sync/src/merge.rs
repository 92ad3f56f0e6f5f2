//! Merge/Dedup Engine: applies a staged batch to the fact table.
//!
//! All fact writes of one file, the staging cleanup and the `staged -> merged`
//! transition share a single transaction. Merges of the same file are serialized
//! in-process; the tracker lease covers other processes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mesw_core::{
    ConflictPolicy, EtlError, EtlResult, FileKey, MergeConflict, MergeResult, StagedRow,
    StagingBatch,
};
use mesw_storage::facts::fetch_fact_in;
use mesw_storage::file_state::mark_merged_in;
use mesw_storage::staging::{clear_staging_in, encode_attributes};
use mesw_storage::{bounded, storage_error, Warehouse};
use sqlx::SqliteConnection;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

enum RowAction {
    Insert,
    Skip,
    Update,
    Reject(String),
}

#[derive(Debug)]
pub struct MergeEngine {
    warehouse: Warehouse,
    per_file: Mutex<HashMap<(String, FileKey), Arc<Semaphore>>>,
}

impl MergeEngine {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse,
            per_file: Mutex::new(HashMap::new()),
        }
    }

    async fn per_file_semaphore(&self, pipeline_name: &str, file: &FileKey) -> Arc<Semaphore> {
        let mut map = self.per_file.lock().await;
        map.entry((pipeline_name.to_string(), file.clone()))
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Drop the gate of a file once no other merge holds or awaits it.
    async fn release_gate(&self, pipeline_name: &str, file: &FileKey, gate: Arc<Semaphore>) {
        let key = (pipeline_name.to_string(), file.clone());
        let mut map = self.per_file.lock().await;
        // One reference lives in the map, the other is `gate`.
        let idle = map.get(&key).is_some_and(|held| Arc::ptr_eq(held, &gate)) && Arc::strong_count(&gate) <= 2;
        if idle {
            map.remove(&key);
        }
    }

    pub async fn merge(&self, batch: &StagingBatch, policy: ConflictPolicy) -> EtlResult<MergeResult> {
        let gate = self.per_file_semaphore(&batch.pipeline_name, &batch.source.path).await;
        let result = self.merge_gated(&gate, batch, policy).await;
        self.release_gate(&batch.pipeline_name, &batch.source.path, gate).await;
        result
    }

    async fn merge_gated(&self, gate: &Semaphore, batch: &StagingBatch, policy: ConflictPolicy) -> EtlResult<MergeResult> {
        let _permit = gate.acquire().await.map_err(|_| EtlError::MergeFailure {
            file: batch.source.path.to_string(),
            message: "merge gate closed".to_string(),
        })?;

        let span = info_span!("merge", pipeline = %batch.pipeline_name, file = %batch.source.path);
        let result = bounded(
            self.warehouse.statement_timeout(),
            "merging staged batch",
            self.merge_in_transaction(batch, policy),
        )
        .instrument(span)
        .await;

        result.map_err(|err| match err {
            EtlError::Timeout { .. } | EtlError::InvalidTransition { .. } | EtlError::NotFound(_) => err,
            other => EtlError::MergeFailure {
                file: batch.source.path.to_string(),
                message: other.to_string(),
            },
        })
    }

    #[cfg(test)]
    async fn open_gates(&self) -> usize {
        self.per_file.lock().await.len()
    }

    async fn merge_in_transaction(&self, batch: &StagingBatch, policy: ConflictPolicy) -> EtlResult<MergeResult> {
        let now = Utc::now();
        let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;

        // Take the write lock up front.
        sqlx::query("UPDATE file_import_state SET last_attempt_at = ? WHERE id = ?")
            .bind(now)
            .bind(batch.state_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        let mut result = MergeResult::default();
        for row in &batch.rows {
            match decide(&mut tx, batch, row, policy).await? {
                RowAction::Insert => {
                    write_fact(&mut tx, batch, row, false).await?;
                    result.inserted += 1;
                }
                RowAction::Skip => result.skipped_duplicate += 1,
                RowAction::Update => {
                    write_fact(&mut tx, batch, row, true).await?;
                    result.updated += 1;
                }
                RowAction::Reject(reason) => {
                    warn!(key = %row.natural_key, line = row.line_no, %reason, "merge conflict");
                    result.failed += 1;
                    result.conflicts.push(MergeConflict {
                        natural_key: row.natural_key.clone(),
                        line_no: row.line_no,
                        reason,
                    });
                }
            }
        }

        mark_merged_in(&mut tx, batch.state_id, result.rows_applied(), now).await?;
        clear_staging_in(&mut tx, batch.state_id).await?;
        tx.commit().await.map_err(|err| EtlError::MergeFailure {
            file: batch.source.path.to_string(),
            message: format!("commit failed: {err}"),
        })?;

        debug!(
            inserted = result.inserted,
            skipped = result.skipped_duplicate,
            updated = result.updated,
            failed = result.failed,
            "batch merged"
        );
        Ok(result)
    }
}

async fn decide(
    conn: &mut SqliteConnection,
    batch: &StagingBatch,
    row: &StagedRow,
    policy: ConflictPolicy,
) -> EtlResult<RowAction> {
    let Some(existing) = fetch_fact_in(conn, &batch.fact_type, &row.natural_key).await? else {
        return Ok(RowAction::Insert);
    };
    if existing.attributes == row.attributes && existing.event_date == row.event_date {
        return Ok(RowAction::Skip);
    }
    Ok(match policy {
        ConflictPolicy::RejectAndReport => RowAction::Reject(format!(
            "attributes differ from the version merged from {}",
            existing.source_file
        )),
        ConflictPolicy::OverwriteIfNewer if batch.staged_at >= existing.imported_at => RowAction::Update,
        ConflictPolicy::OverwriteIfNewer => RowAction::Reject(format!(
            "stored version from {} is newer ({})",
            existing.source_file,
            existing.imported_at.to_rfc3339()
        )),
    })
}

/// `imported_at` carries the staging time of the batch so "newer" compares extract vintages.
async fn write_fact(conn: &mut SqliteConnection, batch: &StagingBatch, row: &StagedRow, update: bool) -> EtlResult<()> {
    let sql = if update {
        "UPDATE facts SET event_date = ?, attributes = ?, source_file = ?, imported_at = ?
         WHERE fact_type = ? AND natural_key = ?"
    } else {
        "INSERT INTO facts (event_date, attributes, source_file, imported_at, fact_type, natural_key)
         VALUES (?, ?, ?, ?, ?, ?)"
    };
    sqlx::query(sql)
        .bind(row.event_date)
        .bind(encode_attributes(&row.attributes)?)
        .bind(batch.source.path.as_str())
        .bind(batch.staged_at)
        .bind(&batch.fact_type)
        .bind(row.natural_key.encode())
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;
    Ok(())
}
