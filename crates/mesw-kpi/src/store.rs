//! Persistence of KPI records and alert cases.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use mesw_core::{AlertCase, AlertStatus, EtlError, EtlResult, FiscalWindow, KpiRecord};
use mesw_storage::{bounded, storage_error, Warehouse};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::info;
use uuid::Uuid;

use crate::alert::{evaluate, ThresholdConfig};

/// Counts from persisting one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertWriteSummary {
    /// New cases written as `open`.
    pub opened: u64,
    /// Existing cases re-evaluated.
    pub updated: u64,
    /// Cases that reached `resolved`: recorded already recovered, or no longer breaching.
    pub resolved: u64,
}

/// Counts from refreshing one KPI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KpiWriteSummary {
    pub records_written: u64,
    pub records_removed: u64,
    pub alerts: AlertWriteSummary,
}

#[derive(Debug, Clone)]
pub struct KpiStore {
    warehouse: Warehouse,
}

impl KpiStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Upsert on `(kpi_id, tag, created_date)`; recomputing a period replaces its value.
    pub async fn upsert_records(&self, records: &[KpiRecord], computed_at: DateTime<Utc>) -> EtlResult<u64> {
        bounded(self.warehouse.statement_timeout(), "writing KPI records", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            let written = write_records_in(&mut tx, records, computed_at).await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(written)
        })
        .await
    }

    /// Replace every stored record of `kpi_id` inside `window` with `records`, re-evaluate
    /// the whole series against `thresholds` and persist the resulting cases.
    ///
    /// An `open` case the new evaluation no longer produces is closed as `resolved` on
    /// `as_of`. All of it commits together.
    pub async fn refresh_kpi(
        &self,
        kpi_id: &str,
        window: &FiscalWindow,
        records: &[KpiRecord],
        thresholds: &[ThresholdConfig],
        as_of: NaiveDate,
    ) -> EtlResult<KpiWriteSummary> {
        bounded(self.warehouse.statement_timeout(), "refreshing KPI", async {
            let now = Utc::now();
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;

            let stored = sqlx::query(
                "SELECT tag, created_date FROM kpi_records WHERE kpi_id = ? AND created_date >= ? AND created_date <= ?",
            )
            .bind(kpi_id)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_error)?;
            let recomputed: HashSet<(&str, NaiveDate)> =
                records.iter().map(|r| (r.tag.as_str(), r.created_date)).collect();
            let mut records_removed = 0u64;
            for row in &stored {
                let tag: String = row.try_get("tag").map_err(storage_error)?;
                let created_date: NaiveDate = row.try_get("created_date").map_err(storage_error)?;
                if !recomputed.contains(&(tag.as_str(), created_date)) {
                    records_removed += 1;
                }
            }

            sqlx::query("DELETE FROM kpi_records WHERE kpi_id = ? AND created_date >= ? AND created_date <= ?")
                .bind(kpi_id)
                .bind(window.start)
                .bind(window.end)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
            let written = write_records_in(&mut tx, records, now).await?;

            let history = sqlx::query(
                "SELECT kpi_id, tag, created_date, progress_value, details FROM kpi_records WHERE kpi_id = ?",
            )
            .bind(kpi_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_error)?
            .iter()
            .map(record_from_row)
            .collect::<EtlResult<Vec<_>>>()?;
            let cases = evaluate(&history, thresholds);
            let mut alerts = write_cases_in(&mut tx, &cases, now).await?;
            alerts.resolved += close_stale_cases_in(&mut tx, kpi_id, &cases, as_of, now).await?;

            tx.commit().await.map_err(storage_error)?;
            info!(
                kpi_id,
                records = written,
                removed = records_removed,
                opened = alerts.opened,
                resolved = alerts.resolved,
                "KPI refreshed"
            );
            Ok(KpiWriteSummary {
                records_written: written,
                records_removed,
                alerts,
            })
        })
        .await
    }

    /// Stored series of one KPI, ordered by tag then date.
    pub async fn records(&self, kpi_id: &str, tag: Option<&str>) -> EtlResult<Vec<KpiRecord>> {
        bounded(self.warehouse.statement_timeout(), "reading KPI records", async {
            let rows = sqlx::query(
                "SELECT kpi_id, tag, created_date, progress_value, details FROM kpi_records
                 WHERE kpi_id = ? AND (? IS NULL OR tag = ?)
                 ORDER BY tag, created_date",
            )
            .bind(kpi_id)
            .bind(tag)
            .bind(tag)
            .fetch_all(self.warehouse.pool())
            .await
            .map_err(storage_error)?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    pub async fn all_records(&self) -> EtlResult<Vec<KpiRecord>> {
        bounded(self.warehouse.statement_timeout(), "reading KPI records", async {
            let rows = sqlx::query(
                "SELECT kpi_id, tag, created_date, progress_value, details FROM kpi_records
                 ORDER BY kpi_id, tag, created_date",
            )
            .fetch_all(self.warehouse.pool())
            .await
            .map_err(storage_error)?;
            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    /// Persist evaluated cases idempotently on `(kpi_id, tag, trigger_date)`.
    ///
    /// Re-evaluation may move a case to `resolved` but never turns an acknowledged
    /// or manually resolved case back to `open`.
    pub async fn upsert_alerts(&self, cases: &[AlertCase]) -> EtlResult<AlertWriteSummary> {
        bounded(self.warehouse.statement_timeout(), "writing alert cases", async {
            let mut tx = self.warehouse.pool().begin().await.map_err(storage_error)?;
            let summary = write_cases_in(&mut tx, cases, Utc::now()).await?;
            tx.commit().await.map_err(storage_error)?;
            if summary.opened > 0 {
                info!(opened = summary.opened, updated = summary.updated, "alert cases written");
            }
            Ok(summary)
        })
        .await
    }

    pub async fn get_case(&self, case_id: Uuid) -> EtlResult<AlertCase> {
        bounded(self.warehouse.statement_timeout(), "reading alert case", async {
            let row = sqlx::query("SELECT * FROM alert_cases WHERE id = ?")
                .bind(case_id.to_string())
                .fetch_optional(self.warehouse.pool())
                .await
                .map_err(storage_error)?
                .ok_or_else(|| EtlError::NotFound(format!("alert case {case_id}")))?;
            case_from_row(&row)
        })
        .await
    }

    /// `open -> acknowledged`; acknowledging twice is a no-op.
    pub async fn acknowledge(&self, case_id: Uuid) -> EtlResult<AlertCase> {
        let current = self.get_case(case_id).await?;
        match current.status {
            AlertStatus::Acknowledged => Ok(current),
            AlertStatus::Resolved => Err(EtlError::NotFound(format!("open alert case {case_id}"))),
            AlertStatus::Open => {
                self.set_status(case_id, AlertStatus::Acknowledged, None).await?;
                self.get_case(case_id).await
            }
        }
    }

    /// Close a case by hand; re-evaluation will not reopen it.
    pub async fn resolve(&self, case_id: Uuid, resolved_date: NaiveDate) -> EtlResult<AlertCase> {
        let current = self.get_case(case_id).await?;
        if current.status != AlertStatus::Resolved {
            self.set_status(case_id, AlertStatus::Resolved, Some(resolved_date)).await?;
        }
        self.get_case(case_id).await
    }

    async fn set_status(&self, case_id: Uuid, status: AlertStatus, resolved_date: Option<NaiveDate>) -> EtlResult<()> {
        bounded(self.warehouse.statement_timeout(), "updating alert case", async {
            sqlx::query(
                "UPDATE alert_cases SET status = ?, resolved_date = COALESCE(?, resolved_date), updated_at = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(resolved_date)
            .bind(Utc::now())
            .bind(case_id.to_string())
            .execute(self.warehouse.pool())
            .await
            .map_err(storage_error)?;
            Ok(())
        })
        .await
    }

    /// Open and acknowledged cases, optionally for one KPI.
    pub async fn open_cases(&self, kpi_id: Option<&str>) -> EtlResult<Vec<AlertCase>> {
        self.cases_where(kpi_id, "status IN ('open', 'acknowledged')").await
    }

    pub async fn all_cases(&self, kpi_id: Option<&str>) -> EtlResult<Vec<AlertCase>> {
        self.cases_where(kpi_id, "1 = 1").await
    }

    async fn cases_where(&self, kpi_id: Option<&str>, filter: &str) -> EtlResult<Vec<AlertCase>> {
        let sql = format!(
            "SELECT * FROM alert_cases WHERE (? IS NULL OR kpi_id = ?) AND {filter}
             ORDER BY kpi_id, tag, trigger_date"
        );
        bounded(self.warehouse.statement_timeout(), "listing alert cases", async {
            let rows = sqlx::query(&sql)
                .bind(kpi_id)
                .bind(kpi_id)
                .fetch_all(self.warehouse.pool())
                .await
                .map_err(storage_error)?;
            rows.iter().map(case_from_row).collect()
        })
        .await
    }
}

async fn write_records_in(
    conn: &mut SqliteConnection,
    records: &[KpiRecord],
    computed_at: DateTime<Utc>,
) -> EtlResult<u64> {
    let mut written = 0u64;
    for record in records {
        let result = sqlx::query(
            "INSERT INTO kpi_records (kpi_id, tag, created_date, progress_value, details, computed_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (kpi_id, tag, created_date) DO UPDATE SET
                 progress_value = excluded.progress_value,
                 details = excluded.details,
                 computed_at = excluded.computed_at",
        )
        .bind(&record.kpi_id)
        .bind(&record.tag)
        .bind(record.created_date)
        .bind(record.progress_value.map(|v| v.to_string()))
        .bind(&record.details)
        .bind(computed_at)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;
        written += result.rows_affected();
    }
    Ok(written)
}

async fn write_cases_in(
    conn: &mut SqliteConnection,
    cases: &[AlertCase],
    now: DateTime<Utc>,
) -> EtlResult<AlertWriteSummary> {
    let mut summary = AlertWriteSummary::default();
    for case in cases {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT status FROM alert_cases WHERE kpi_id = ? AND tag = ? AND trigger_date = ?",
        )
        .bind(&case.kpi_id)
        .bind(&case.tag)
        .bind(case.trigger_date)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            "INSERT INTO alert_cases
                 (id, kpi_id, tag, trigger_date, threshold, observed_value, status, resolved_date, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (kpi_id, tag, trigger_date) DO UPDATE SET
                 threshold = excluded.threshold,
                 observed_value = excluded.observed_value,
                 status = CASE
                     WHEN excluded.status = 'resolved' THEN 'resolved'
                     WHEN alert_cases.status = 'open' THEN excluded.status
                     ELSE alert_cases.status
                 END,
                 resolved_date = CASE
                     WHEN alert_cases.status = 'resolved' THEN alert_cases.resolved_date
                     WHEN excluded.status = 'resolved' THEN excluded.resolved_date
                     ELSE alert_cases.resolved_date
                 END,
                 updated_at = excluded.updated_at",
        )
        .bind(case.case_id().to_string())
        .bind(&case.kpi_id)
        .bind(&case.tag)
        .bind(case.trigger_date)
        .bind(case.threshold.to_string())
        .bind(case.observed_value.to_string())
        .bind(case.status.as_str())
        .bind(case.resolved_date)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

        match (existing.as_deref(), case.status) {
            (None, AlertStatus::Resolved) => summary.resolved += 1,
            (None, _) => summary.opened += 1,
            (Some("resolved"), _) => summary.updated += 1,
            (Some(_), AlertStatus::Resolved) => {
                summary.updated += 1;
                summary.resolved += 1;
            }
            (Some(_), _) => summary.updated += 1,
        }
    }
    Ok(summary)
}

/// Resolve `open` cases of `kpi_id` that are absent from `emitted`.
async fn close_stale_cases_in(
    conn: &mut SqliteConnection,
    kpi_id: &str,
    emitted: &[AlertCase],
    as_of: NaiveDate,
    now: DateTime<Utc>,
) -> EtlResult<u64> {
    let current: HashSet<(&str, NaiveDate)> = emitted
        .iter()
        .filter(|c| c.kpi_id == kpi_id)
        .map(|c| (c.tag.as_str(), c.trigger_date))
        .collect();
    let open = sqlx::query("SELECT id, tag, trigger_date FROM alert_cases WHERE kpi_id = ? AND status = 'open'")
        .bind(kpi_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;

    let mut closed = 0u64;
    for row in &open {
        let tag: String = row.try_get("tag").map_err(storage_error)?;
        let trigger_date: NaiveDate = row.try_get("trigger_date").map_err(storage_error)?;
        if current.contains(&(tag.as_str(), trigger_date)) {
            continue;
        }
        let id: String = row.try_get("id").map_err(storage_error)?;
        sqlx::query(
            "UPDATE alert_cases SET status = 'resolved', resolved_date = ?, updated_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(as_of)
        .bind(now)
        .bind(&id)
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;
        info!(kpi_id, tag = %tag, %trigger_date, "breach no longer present; case resolved");
        closed += 1;
    }
    Ok(closed)
}

fn decimal(raw: &str) -> EtlResult<Decimal> {
    Decimal::from_str(raw).map_err(|err| EtlError::Storage(Box::new(err)))
}

fn record_from_row(row: &SqliteRow) -> EtlResult<KpiRecord> {
    let value: Option<String> = row.try_get("progress_value").map_err(storage_error)?;
    Ok(KpiRecord {
        kpi_id: row.try_get("kpi_id").map_err(storage_error)?,
        tag: row.try_get("tag").map_err(storage_error)?,
        created_date: row.try_get("created_date").map_err(storage_error)?,
        progress_value: value.as_deref().map(decimal).transpose()?,
        details: row.try_get("details").map_err(storage_error)?,
    })
}

fn case_from_row(row: &SqliteRow) -> EtlResult<AlertCase> {
    let threshold: String = row.try_get("threshold").map_err(storage_error)?;
    let observed: String = row.try_get("observed_value").map_err(storage_error)?;
    let status: String = row.try_get("status").map_err(storage_error)?;
    Ok(AlertCase {
        kpi_id: row.try_get("kpi_id").map_err(storage_error)?,
        tag: row.try_get("tag").map_err(storage_error)?,
        trigger_date: row.try_get("trigger_date").map_err(storage_error)?,
        threshold: decimal(&threshold)?,
        observed_value: decimal(&observed)?,
        status: AlertStatus::from_str(&status)?,
        resolved_date: row.try_get("resolved_date").map_err(storage_error)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesw_storage::WarehouseConfig;

    async fn store() -> (tempfile::TempDir, KpiStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("warehouse.db").display());
        let warehouse = Warehouse::connect(&WarehouseConfig::for_database(url))
            .await
            .expect("warehouse");
        (dir, KpiStore::new(warehouse))
    }

    fn case(status: AlertStatus, resolved: Option<u32>) -> AlertCase {
        AlertCase {
            kpi_id: "first_pass_yield".into(),
            tag: "L1".into(),
            trigger_date: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
            threshold: Decimal::from(90),
            observed_value: Decimal::new(805, 1),
            status,
            resolved_date: resolved.map(|d| NaiveDate::from_ymd_opt(2026, 2, d).unwrap()),
        }
    }

    #[tokio::test]
    async fn kpi_records_upsert_by_period() {
        let (_dir, store) = store().await;
        let mut record = KpiRecord {
            kpi_id: "first_pass_yield".into(),
            tag: "L1".into(),
            created_date: NaiveDate::from_ymd_opt(2026, 2, 9).unwrap(),
            progress_value: Some(Decimal::new(925, 1)),
            details: "FY2026-W07 n=2".into(),
        };
        store.upsert_records(&[record.clone()], Utc::now()).await.expect("first");
        store.upsert_records(&[record.clone()], Utc::now()).await.expect("again");
        record.progress_value = None;
        store.upsert_records(&[record.clone()], Utc::now()).await.expect("recomputed");

        let stored = store.records("first_pass_yield", None).await.expect("records");
        assert_eq!(stored, vec![record]);
        assert!(store.records("first_pass_yield", Some("L9")).await.expect("none").is_empty());
    }

    #[tokio::test]
    async fn alert_upsert_is_idempotent_and_never_downgrades() {
        let (_dir, store) = store().await;
        let open = case(AlertStatus::Open, None);

        let first = store.upsert_alerts(&[open.clone()]).await.expect("first");
        assert_eq!(first, AlertWriteSummary { opened: 1, updated: 0, resolved: 0 });
        let second = store.upsert_alerts(&[open.clone()]).await.expect("second");
        assert_eq!(second, AlertWriteSummary { opened: 0, updated: 1, resolved: 0 });
        assert_eq!(store.all_cases(None).await.expect("cases").len(), 1);

        let acked = store.acknowledge(open.case_id()).await.expect("ack");
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        store.upsert_alerts(&[open.clone()]).await.expect("re-evaluate");
        assert_eq!(store.get_case(open.case_id()).await.expect("get").status, AlertStatus::Acknowledged);
        assert_eq!(store.open_cases(Some("first_pass_yield")).await.expect("open").len(), 1);

        store
            .upsert_alerts(&[case(AlertStatus::Resolved, Some(23))])
            .await
            .expect("recovered");
        let resolved = store.get_case(open.case_id()).await.expect("get");
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_date, NaiveDate::from_ymd_opt(2026, 2, 23));
        assert!(store.open_cases(None).await.expect("open").is_empty());
        assert!(store.acknowledge(open.case_id()).await.is_err());
    }

    #[tokio::test]
    async fn manual_resolution_sticks() {
        let (_dir, store) = store().await;
        let open = case(AlertStatus::Open, None);
        store.upsert_alerts(&[open.clone()]).await.expect("open");
        let closed = store
            .resolve(open.case_id(), NaiveDate::from_ymd_opt(2026, 2, 12).unwrap())
            .await
            .expect("resolve");
        assert_eq!(closed.status, AlertStatus::Resolved);

        store.upsert_alerts(&[open.clone()]).await.expect("re-evaluate");
        let after = store.get_case(open.case_id()).await.expect("get");
        assert_eq!(after.status, AlertStatus::Resolved);
        assert_eq!(after.resolved_date, NaiveDate::from_ymd_opt(2026, 2, 12));
        assert!(matches!(store.get_case(Uuid::new_v4()).await, Err(EtlError::NotFound(_))));
    }

    #[tokio::test]
    async fn recovered_cases_are_not_counted_as_opened() {
        let (_dir, store) = store().await;
        let summary = store
            .upsert_alerts(&[case(AlertStatus::Resolved, Some(23))])
            .await
            .expect("write");
        assert_eq!(summary, AlertWriteSummary { opened: 0, updated: 0, resolved: 1 });
        assert!(store.open_cases(None).await.expect("open").is_empty());
    }

    fn weekly(tag: &str, day: u32, value: i64) -> KpiRecord {
        KpiRecord {
            kpi_id: "first_pass_yield".into(),
            tag: tag.into(),
            created_date: NaiveDate::from_ymd_opt(2026, 2, day).unwrap(),
            progress_value: Some(Decimal::from(value)),
            details: String::new(),
        }
    }

    fn below_90() -> Vec<ThresholdConfig> {
        vec![ThresholdConfig {
            kpi_id: "first_pass_yield".into(),
            tag: None,
            direction: crate::AlertDirection::Below,
            threshold: Decimal::from(90),
        }]
    }

    #[tokio::test]
    async fn refresh_replaces_the_window_and_closes_vanished_breaches() {
        let (_dir, store) = store().await;
        let window = FiscalWindow::new(
            NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
        )
        .unwrap();
        let as_of = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        let older = weekly("L1", 1, 70);
        store.upsert_records(&[older.clone()], Utc::now()).await.expect("older");

        let first = store
            .refresh_kpi("first_pass_yield", &window, &[weekly("L1", 9, 80), weekly("L2", 9, 80)], &below_90(), as_of)
            .await
            .expect("first refresh");
        // the L1 breach starts on the record outside the window
        assert_eq!(first.alerts.opened, 2);
        let acked = store
            .open_cases(None)
            .await
            .expect("open")
            .into_iter()
            .find(|c| c.tag == "L2")
            .expect("L2 case");
        store.acknowledge(acked.case_id()).await.expect("ack");

        // corrected facts: L1 recovers inside the window, L2 vanishes entirely
        let second = store
            .refresh_kpi("first_pass_yield", &window, &[weekly("L1", 9, 95)], &below_90(), as_of)
            .await
            .expect("second refresh");
        assert_eq!(second.records_removed, 1);
        assert!(store.records("first_pass_yield", Some("L2")).await.expect("L2").is_empty());
        assert_eq!(
            store.records("first_pass_yield", Some("L1")).await.expect("L1"),
            vec![older, weekly("L1", 9, 95)]
        );

        let cases = store.all_cases(None).await.expect("cases");
        let l1 = cases.iter().find(|c| c.tag == "L1").expect("L1 case");
        assert_eq!(l1.status, AlertStatus::Resolved);
        assert_eq!(l1.resolved_date, NaiveDate::from_ymd_opt(2026, 2, 9));
        let l2 = cases.iter().find(|c| c.tag == "L2").expect("L2 case");
        assert_eq!(l2.status, AlertStatus::Acknowledged);
    }

    #[tokio::test]
    async fn breach_corrected_at_its_trigger_point_is_resolved_on_the_as_of_date() {
        let (_dir, store) = store().await;
        let window = FiscalWindow::new(
            NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
        )
        .unwrap();
        let as_of = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        store
            .refresh_kpi("first_pass_yield", &window, &[weekly("L1", 9, 80)], &below_90(), as_of)
            .await
            .expect("breach");
        assert_eq!(store.open_cases(None).await.expect("open").len(), 1);

        let corrected = store
            .refresh_kpi("first_pass_yield", &window, &[weekly("L1", 9, 95)], &below_90(), as_of)
            .await
            .expect("corrected");
        assert_eq!(corrected.alerts, AlertWriteSummary { opened: 0, updated: 0, resolved: 1 });
        let cases = store.all_cases(None).await.expect("cases");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].status, AlertStatus::Resolved);
        assert_eq!(cases[0].resolved_date, Some(as_of));
    }
}
