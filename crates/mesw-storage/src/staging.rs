//! Persisted staging area.
//!
//! Staged rows survive a crash between staging and merge so the merge can be
//! re-run without re-reading the extract. They are removed in the same
//! transaction that marks the file merged or failed.

use chrono::{DateTime, NaiveDate, Utc};
use mesw_core::{
    Attributes, EtlError, EtlResult, FileImportState, NaturalKey, RejectedRow, SourceFile, StagedRow,
    StagingBatch,
};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::file_state::{mark_staged_in, state_from_row};
use crate::{bounded, storage_error, Warehouse};

#[derive(Debug, Clone)]
pub struct StagingStore {
    warehouse: Warehouse,
}

impl StagingStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Rebuild the batch of a staged file, or `None` when nothing is staged for it.
    pub async fn load_batch(&self, state_id: Uuid) -> EtlResult<Option<StagingBatch>> {
        bounded(self.warehouse.statement_timeout(), "loading staging batch", async {
            let pool = self.warehouse.pool();
            let header = sqlx::query(
                "SELECT b.fact_type, b.source, b.staged_at, s.pipeline_name
                 FROM staging_batches b JOIN file_import_state s ON s.id = b.state_id
                 WHERE b.state_id = ?",
            )
            .bind(state_id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(storage_error)?;
            let Some(header) = header else {
                return Ok(None);
            };

            let source: String = header.try_get("source").map_err(storage_error)?;
            let source: SourceFile = serde_json::from_str(&source).map_err(json_error)?;

            let rows = sqlx::query(
                "SELECT line_no, natural_key, event_date, attributes FROM staging_rows WHERE state_id = ? ORDER BY line_no",
            )
            .bind(state_id.to_string())
            .fetch_all(pool)
            .await
            .map_err(storage_error)?
            .iter()
            .map(|row| {
                let line_no: i64 = row.try_get("line_no").map_err(storage_error)?;
                let natural_key: String = row.try_get("natural_key").map_err(storage_error)?;
                let event_date: Option<NaiveDate> = row.try_get("event_date").map_err(storage_error)?;
                let attributes: String = row.try_get("attributes").map_err(storage_error)?;
                Ok(StagedRow {
                    line_no: line_no as u64,
                    natural_key: NaturalKey::decode(&natural_key),
                    event_date,
                    attributes: decode_attributes(&attributes)?,
                })
            })
            .collect::<EtlResult<Vec<_>>>()?;

            let rejected = sqlx::query(
                "SELECT line_no, reason FROM staging_rejects WHERE state_id = ? ORDER BY line_no",
            )
            .bind(state_id.to_string())
            .fetch_all(pool)
            .await
            .map_err(storage_error)?
            .iter()
            .map(|row| {
                let line_no: i64 = row.try_get("line_no").map_err(storage_error)?;
                Ok(RejectedRow {
                    line_no: line_no as u64,
                    reason: row.try_get("reason").map_err(storage_error)?,
                })
            })
            .collect::<EtlResult<Vec<_>>>()?;

            let staged_at: DateTime<Utc> = header.try_get("staged_at").map_err(storage_error)?;
            Ok(Some(StagingBatch {
                state_id,
                pipeline_name: header.try_get("pipeline_name").map_err(storage_error)?,
                fact_type: header.try_get("fact_type").map_err(storage_error)?,
                source,
                rows,
                rejected,
                staged_at,
            }))
        })
        .await
    }

    /// Persist a fully validated batch and move its state `pending -> staged` atomically.
    pub async fn commit(&self, batch: &StagingBatch) -> EtlResult<FileImportState> {
        bounded(self.warehouse.statement_timeout(), "committing staging batch", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            put_batch_in(&mut tx, batch).await?;
            mark_staged_in(
                &mut tx,
                batch.state_id,
                batch.rows.len() as u64,
                batch.rejected.len() as u64,
                batch.staged_at,
            )
            .await?;
            let state = sqlx::query("SELECT * FROM file_import_state WHERE id = ?")
                .bind(batch.state_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_error)?;
            let state = state_from_row(&state)?;
            tx.commit().await.map_err(storage_error)?;
            Ok(state)
        })
        .await
    }

    pub async fn staged_row_count(&self, state_id: Uuid) -> EtlResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staging_rows WHERE state_id = ?")
            .bind(state_id.to_string())
            .fetch_one(self.warehouse.pool())
            .await
            .map_err(storage_error)?;
        Ok(count as u64)
    }
}

/// Replace whatever is staged for the batch's state with the batch contents.
pub async fn put_batch_in(conn: &mut SqliteConnection, batch: &StagingBatch) -> EtlResult<()> {
    clear_staging_in(conn, batch.state_id).await?;
    let state_id = batch.state_id.to_string();
    let source = serde_json::to_string(&batch.source).map_err(json_error)?;

    sqlx::query("INSERT INTO staging_batches (state_id, fact_type, source, staged_at) VALUES (?, ?, ?, ?)")
        .bind(&state_id)
        .bind(&batch.fact_type)
        .bind(source)
        .bind(batch.staged_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

    for row in &batch.rows {
        sqlx::query(
            "INSERT INTO staging_rows (state_id, line_no, natural_key, event_date, attributes) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&state_id)
        .bind(row.line_no as i64)
        .bind(row.natural_key.encode())
        .bind(row.event_date)
        .bind(encode_attributes(&row.attributes)?)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;
    }

    for rejected in &batch.rejected {
        sqlx::query("INSERT INTO staging_rejects (state_id, line_no, reason) VALUES (?, ?, ?)")
            .bind(&state_id)
            .bind(rejected.line_no as i64)
            .bind(&rejected.reason)
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }
    Ok(())
}

pub async fn clear_staging_in(conn: &mut SqliteConnection, state_id: Uuid) -> EtlResult<()> {
    let id = state_id.to_string();
    for table in ["staging_rows", "staging_rejects", "staging_batches"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE state_id = ?"))
            .bind(&id)
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }
    Ok(())
}

pub fn encode_attributes(attributes: &Attributes) -> EtlResult<String> {
    serde_json::to_string(attributes).map_err(json_error)
}

pub fn decode_attributes(raw: &str) -> EtlResult<Attributes> {
    serde_json::from_str(raw).map_err(json_error)
}

fn json_error(err: serde_json::Error) -> EtlError {
    EtlError::Storage(Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::test_support::temp_warehouse;
    use crate::{Begin, FileStateTracker};
    use chrono::Duration as ChronoDuration;
    use mesw_core::{FieldValue, FileKey, ImportStatus};

    fn batch(state_id: Uuid) -> StagingBatch {
        let mut attributes = Attributes::new();
        attributes.insert("batch".into(), FieldValue::Text("B-1".into()));
        attributes.insert("qty".into(), FieldValue::Integer(42));
        StagingBatch {
            state_id,
            pipeline_name: "mes_output".into(),
            fact_type: "mes_output".into(),
            source: SourceFile {
                name: "mes_2026_02.csv".into(),
                path: FileKey::new("drop/mes_2026_02.csv"),
                fingerprint: "fp".into(),
                size: 10,
                discovered_at: Utc::now(),
            },
            rows: vec![StagedRow {
                line_no: 2,
                natural_key: NaturalKey::new(vec!["B-1".into(), "OP10".into()]),
                event_date: NaiveDate::from_ymd_opt(2026, 2, 3),
                attributes,
            }],
            rejected: vec![RejectedRow {
                line_no: 3,
                reason: "missing natural key column `batch`".into(),
            }],
            staged_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn staged_batches_survive_until_merge_or_failure() {
        let (_dir, warehouse) = temp_warehouse().await;
        let tracker = FileStateTracker::new(warehouse.clone(), ChronoDuration::minutes(5));
        let store = StagingStore::new(warehouse.clone());
        let Begin::Started(state) = tracker
            .begin("mes_output", &FileKey::new("drop/mes_2026_02.csv"), "fp", Uuid::new_v4())
            .await
            .expect("begin")
        else {
            panic!("expected start");
        };

        let staged = batch(state.id);
        let mut tx = warehouse.pool().begin().await.expect("tx");
        put_batch_in(&mut tx, &staged).await.expect("put");
        mark_staged_in(&mut tx, state.id, 1, 1, Utc::now()).await.expect("mark");
        tx.commit().await.expect("commit");

        let loaded = store.load_batch(state.id).await.expect("load").expect("present");
        assert_eq!(loaded.rows, staged.rows);
        assert_eq!(loaded.rejected, staged.rejected);
        assert_eq!(loaded.source, staged.source);
        assert_eq!(loaded.pipeline_name, "mes_output");

        let failed = tracker.mark_failed(state.id, "merge aborted").await.expect("fail");
        assert_eq!(failed.status, ImportStatus::Failed);
        assert!(store.load_batch(state.id).await.expect("load").is_none());
        assert_eq!(store.staged_row_count(state.id).await.expect("count"), 0);
    }
}
