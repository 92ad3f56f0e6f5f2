//! Read access to merged fact tables.

use chrono::{DateTime, NaiveDate, Utc};
use mesw_core::{EtlResult, FactRecord, FileKey, FiscalGrain, NaturalKey};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::staging::decode_attributes;
use crate::{bounded, storage_error, Warehouse};

#[derive(Debug, Clone)]
pub struct FactReader {
    warehouse: Warehouse,
}

impl FactReader {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    pub async fn get(&self, fact_type: &str, key: &NaturalKey) -> EtlResult<Option<FactRecord>> {
        bounded(self.warehouse.statement_timeout(), "reading fact by key", async {
            let mut conn = self.warehouse.pool().acquire().await.map_err(storage_error)?;
            fetch_fact_in(&mut conn, fact_type, key).await
        })
        .await
    }

    pub async fn count(&self, fact_type: &str) -> EtlResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts WHERE fact_type = ?")
            .bind(fact_type)
            .fetch_one(self.warehouse.pool())
            .await
            .map_err(storage_error)?;
        Ok(count as u64)
    }

    /// Facts whose event date falls inside `[start, end]`, in key order.
    pub async fn in_date_range(
        &self,
        fact_type: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EtlResult<Vec<FactRecord>> {
        bounded(self.warehouse.statement_timeout(), "reading facts by date", async {
            let rows = sqlx::query(
                "SELECT * FROM facts WHERE fact_type = ? AND event_date >= ? AND event_date <= ? ORDER BY natural_key",
            )
            .bind(fact_type)
            .bind(start)
            .bind(end)
            .fetch_all(self.warehouse.pool())
            .await
            .map_err(storage_error)?;
            rows.iter().map(fact_from_row).collect()
        })
        .await
    }

    /// Facts of one fiscal week or month, joined through the calendar dimension.
    pub async fn in_fiscal_period(
        &self,
        fact_type: &str,
        fiscal_year: i32,
        grain: FiscalGrain,
        number: u32,
    ) -> EtlResult<Vec<FactRecord>> {
        let column = match grain {
            FiscalGrain::Week => "fiscal_week",
            FiscalGrain::Month => "fiscal_month",
        };
        let sql = format!(
            "SELECT f.* FROM facts f JOIN fiscal_calendar c ON c.date = f.event_date
             WHERE f.fact_type = ? AND c.fiscal_year = ? AND c.{column} = ? ORDER BY f.natural_key"
        );
        bounded(self.warehouse.statement_timeout(), "reading facts by fiscal period", async {
            let rows = sqlx::query(&sql)
                .bind(fact_type)
                .bind(fiscal_year)
                .bind(number)
                .fetch_all(self.warehouse.pool())
                .await
                .map_err(storage_error)?;
            rows.iter().map(fact_from_row).collect()
        })
        .await
    }

    pub async fn from_source_file(&self, file: &FileKey) -> EtlResult<Vec<FactRecord>> {
        bounded(self.warehouse.statement_timeout(), "reading facts by source file", async {
            let rows = sqlx::query("SELECT * FROM facts WHERE source_file = ? ORDER BY fact_type, natural_key")
                .bind(file.as_str())
                .fetch_all(self.warehouse.pool())
                .await
                .map_err(storage_error)?;
            rows.iter().map(fact_from_row).collect()
        })
        .await
    }
}

pub async fn fetch_fact_in(
    conn: &mut SqliteConnection,
    fact_type: &str,
    key: &NaturalKey,
) -> EtlResult<Option<FactRecord>> {
    let row = sqlx::query("SELECT * FROM facts WHERE fact_type = ? AND natural_key = ?")
        .bind(fact_type)
        .bind(key.encode())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.as_ref().map(fact_from_row).transpose()
}

pub fn fact_from_row(row: &SqliteRow) -> EtlResult<FactRecord> {
    let natural_key: String = row.try_get("natural_key").map_err(storage_error)?;
    let attributes: String = row.try_get("attributes").map_err(storage_error)?;
    let source_file: String = row.try_get("source_file").map_err(storage_error)?;
    let imported_at: DateTime<Utc> = row.try_get("imported_at").map_err(storage_error)?;
    Ok(FactRecord {
        fact_type: row.try_get("fact_type").map_err(storage_error)?,
        natural_key: NaturalKey::decode(&natural_key),
        event_date: row.try_get("event_date").map_err(storage_error)?,
        attributes: decode_attributes(&attributes)?,
        source_file: FileKey::new(&source_file),
        imported_at,
    })
}
