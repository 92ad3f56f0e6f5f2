//! KPI aggregation over merged facts, threshold alerting and their persistence.
//!
//! Aggregation is a pure function of the facts and the fiscal calendar: the same
//! facts always produce the same records, so a re-run only rewrites identical rows.

use std::collections::{BTreeMap, BTreeSet};

use mesw_core::{
    EtlError, EtlResult, FactRecord, FiscalCalendar, FiscalGrain, FiscalWindow, KpiRecord,
    PeriodKey,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod alert;
pub mod store;

pub use alert::{evaluate, AlertDirection, ThresholdConfig};
pub use store::{AlertWriteSummary, KpiStore, KpiWriteSummary};

pub const CRATE_NAME: &str = "mesw-kpi";

/// Tag used when a KPI is not split by any column.
pub const ALL_TAG: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measure {
    /// Number of facts, or of non-null values when a column is named.
    Count {
        #[serde(default)]
        column: Option<String>,
    },
    Sum { column: String },
    Average { column: String },
    Min { column: String },
    Max { column: String },
    /// `sum(numerator) / sum(denominator)`; null when the denominator sums to zero.
    Ratio { numerator: String, denominator: String },
}

/// What to emit for a period without any facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparsePolicy {
    #[default]
    Omit,
    Zero,
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub kpi_id: String,
    pub fact_type: String,
    pub measure: Measure,
    /// Scale the measured value by 100.
    #[serde(default)]
    pub percent: bool,
    /// Column whose value splits the KPI into tags.
    #[serde(default)]
    pub tag_column: Option<String>,
    /// Restrict to these tags; all observed tags otherwise.
    #[serde(default)]
    pub tags: Vec<String>,
    pub grain: FiscalGrain,
    #[serde(default)]
    pub sparse: SparsePolicy,
    /// Number of trailing periods recomputed per run.
    #[serde(default = "default_lookback")]
    pub lookback_periods: u32,
}

fn default_lookback() -> u32 {
    8
}

impl KpiDefinition {
    pub fn validate(&self) -> EtlResult<()> {
        if self.kpi_id.trim().is_empty() {
            return Err(EtlError::Config("KPI definition without kpi_id".to_string()));
        }
        if self.tag_column.is_none() && self.tags.iter().any(|t| t != ALL_TAG) {
            return Err(EtlError::Config(format!(
                "KPI {} lists tags but has no tag_column",
                self.kpi_id
            )));
        }
        let empty = |c: &str| c.trim().is_empty();
        let bad_column = match &self.measure {
            Measure::Count { column } => column.as_deref().is_some_and(empty),
            Measure::Sum { column }
            | Measure::Average { column }
            | Measure::Min { column }
            | Measure::Max { column } => empty(column),
            Measure::Ratio {
                numerator,
                denominator,
            } => empty(numerator) || empty(denominator),
        };
        if bad_column {
            return Err(EtlError::Config(format!(
                "KPI {} names an empty measure column",
                self.kpi_id
            )));
        }
        Ok(())
    }

    fn tag_of(&self, fact: &FactRecord) -> Option<String> {
        match &self.tag_column {
            None => Some(ALL_TAG.to_string()),
            Some(column) => fact.attributes.get(column).and_then(|v| v.key_fragment()),
        }
    }

    /// Tags to compute: configured ones, else every tag observed in `facts`, sorted.
    pub fn tags_for(&self, facts: &[FactRecord]) -> Vec<String> {
        if !self.tags.is_empty() {
            return self.tags.clone();
        }
        facts
            .iter()
            .filter(|f| f.fact_type == self.fact_type)
            .filter_map(|f| self.tag_of(f))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Records of one `(kpi_id, tag)` for every period intersecting `window`, in period order.
pub fn aggregate(
    definition: &KpiDefinition,
    tag: &str,
    window: &FiscalWindow,
    facts: &[FactRecord],
    calendar: &FiscalCalendar,
) -> EtlResult<Vec<KpiRecord>> {
    let mut grouped: BTreeMap<PeriodKey, Vec<&FactRecord>> = BTreeMap::new();
    for fact in facts {
        if fact.fact_type != definition.fact_type {
            continue;
        }
        let Some(date) = fact.event_date.filter(|d| window.contains(*d)) else {
            continue;
        };
        if definition.tag_of(fact).as_deref() != Some(tag) {
            continue;
        }
        let key = calendar.resolve(date)?.key(definition.grain);
        grouped.entry(key).or_default().push(fact);
    }

    let mut records = Vec::new();
    for (period, created_date) in calendar.periods_in(window, definition.grain)? {
        let rows = grouped.get(&period).map(Vec::as_slice).unwrap_or(&[]);
        let (progress_value, details) = if rows.is_empty() {
            match definition.sparse {
                SparsePolicy::Omit => continue,
                SparsePolicy::Zero => (Some(Decimal::ZERO), format!("{period} n=0 (filled with zero)")),
                SparsePolicy::Null => (None, format!("{period} n=0 (no facts)")),
            }
        } else {
            let value = measure(&definition.measure, rows).map(|v| {
                let scaled = if definition.percent {
                    v * Decimal::ONE_HUNDRED
                } else {
                    v
                };
                scaled.round_dp(6).normalize()
            });
            (value, format!("{period} n={}", rows.len()))
        };
        records.push(KpiRecord {
            kpi_id: definition.kpi_id.clone(),
            tag: tag.to_string(),
            created_date,
            progress_value,
            details,
        });
    }
    Ok(records)
}

/// Every tag of `definition` over `window`.
pub fn aggregate_all(
    definition: &KpiDefinition,
    window: &FiscalWindow,
    facts: &[FactRecord],
    calendar: &FiscalCalendar,
) -> EtlResult<Vec<KpiRecord>> {
    let mut records = Vec::new();
    for tag in definition.tags_for(facts) {
        records.extend(aggregate(definition, &tag, window, facts, calendar)?);
    }
    Ok(records)
}

fn values(rows: &[&FactRecord], column: &str) -> Vec<Decimal> {
    rows.iter()
        .filter_map(|f| f.attributes.get(column).and_then(|v| v.as_decimal()))
        .collect()
}

fn measure(measure: &Measure, rows: &[&FactRecord]) -> Option<Decimal> {
    match measure {
        Measure::Count { column: None } => Some(Decimal::from(rows.len() as u64)),
        Measure::Count {
            column: Some(column),
        } => {
            let n = rows
                .iter()
                .filter(|f| f.attributes.get(column).is_some_and(|v| !v.is_null()))
                .count();
            Some(Decimal::from(n as u64))
        }
        Measure::Sum { column } => {
            let values = values(rows, column);
            (!values.is_empty()).then(|| values.into_iter().sum())
        }
        Measure::Average { column } => {
            let values = values(rows, column);
            let n = values.len() as u64;
            (n > 0).then(|| values.into_iter().sum::<Decimal>() / Decimal::from(n))
        }
        Measure::Min { column } => values(rows, column).into_iter().min(),
        Measure::Max { column } => values(rows, column).into_iter().max(),
        Measure::Ratio {
            numerator,
            denominator,
        } => {
            let num: Decimal = values(rows, numerator).into_iter().sum();
            let den: Decimal = values(rows, denominator).into_iter().sum();
            (!den.is_zero()).then(|| num / den)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::fact;
    use super::*;
    use chrono::NaiveDate;
    use mesw_core::FiscalCalendarConfig;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    fn yield_kpi(sparse: SparsePolicy) -> KpiDefinition {
        KpiDefinition {
            kpi_id: "first_pass_yield".into(),
            fact_type: "mes_output".into(),
            measure: Measure::Ratio {
                numerator: "good_qty".into(),
                denominator: "total_qty".into(),
            },
            percent: true,
            tag_column: Some("line".into()),
            tags: vec![],
            grain: FiscalGrain::Week,
            sparse,
            lookback_periods: 4,
        }
    }

    fn calendar() -> FiscalCalendar {
        FiscalCalendar::generate(FiscalCalendarConfig::calendar_years(2026, 2026)).expect("calendar")
    }

    fn facts() -> Vec<FactRecord> {
        vec![
            // FY2026-W07 starts Monday 2026-02-09
            fact("B1", d(2, 9), "L1", 90, 100),
            fact("B2", d(2, 12), "L1", 45, 50),
            fact("B3", d(2, 10), "L2", 10, 20),
            // W08 empty, W09
            fact("B4", d(2, 23), "L1", 70, 100),
        ]
    }

    #[test]
    fn ratio_kpi_is_computed_per_tag_and_week() {
        let calendar = calendar();
        let window = calendar.week_window(2026, 7, 9).expect("window");
        let records = aggregate(&yield_kpi(SparsePolicy::Omit), "L1", &window, &facts(), &calendar)
            .expect("aggregate");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].created_date, d(2, 9));
        assert_eq!(records[0].progress_value, Some(Decimal::new(90, 0)));
        assert_eq!(records[0].details, "FY2026-W07 n=2");
        assert_eq!(records[1].created_date, d(2, 23));
        assert_eq!(records[1].progress_value, Some(Decimal::new(70, 0)));
    }

    #[test]
    fn sparse_policy_is_explicit() {
        let calendar = calendar();
        let window = calendar.week_window(2026, 7, 9).expect("window");

        let zero = aggregate(&yield_kpi(SparsePolicy::Zero), "L1", &window, &facts(), &calendar).expect("zero");
        assert_eq!(zero.len(), 3);
        assert_eq!(zero[1].created_date, d(2, 16));
        assert_eq!(zero[1].progress_value, Some(Decimal::ZERO));

        let null = aggregate(&yield_kpi(SparsePolicy::Null), "L1", &window, &facts(), &calendar).expect("null");
        assert_eq!(null[1].progress_value, None);
    }

    #[test]
    fn created_date_is_clipped_to_window() {
        let calendar = calendar();
        let window = FiscalWindow::new(d(2, 11), d(2, 20)).expect("window");
        let records = aggregate(&yield_kpi(SparsePolicy::Zero), "L1", &window, &facts(), &calendar).expect("aggregate");
        assert_eq!(records[0].created_date, d(2, 11));
        assert_eq!(records[0].progress_value, Some(Decimal::new(90, 0)));
        assert_eq!(records[0].details, "FY2026-W07 n=1");
        assert_eq!(records[1].created_date, d(2, 16));
    }

    #[test]
    fn aggregation_is_reproducible() {
        let calendar = calendar();
        let window = calendar.month_window(2026, 2, 2).expect("window");
        let def = yield_kpi(SparsePolicy::Zero);
        let mut shuffled = facts();
        shuffled.reverse();
        assert_eq!(
            aggregate_all(&def, &window, &facts(), &calendar).expect("first"),
            aggregate_all(&def, &window, &shuffled, &calendar).expect("second")
        );
        assert_eq!(def.tags_for(&facts()), vec!["L1".to_string(), "L2".to_string()]);
    }

    #[test]
    fn simple_measures() {
        let rows = facts();
        let refs: Vec<&FactRecord> = rows.iter().collect();
        let col = |c: &str| c.to_string();
        assert_eq!(measure(&Measure::Count { column: None }, &refs), Some(Decimal::from(4)));
        assert_eq!(measure(&Measure::Sum { column: col("total_qty") }, &refs), Some(Decimal::from(270)));
        assert_eq!(measure(&Measure::Min { column: col("good_qty") }, &refs), Some(Decimal::from(10)));
        assert_eq!(measure(&Measure::Max { column: col("good_qty") }, &refs), Some(Decimal::from(90)));
        assert_eq!(
            measure(&Measure::Average { column: col("good_qty") }, &refs),
            Some(Decimal::new(5375, 2))
        );
        assert_eq!(measure(&Measure::Sum { column: col("scrap") }, &refs), None);
    }

    #[test]
    fn definitions_are_validated() {
        let mut def = yield_kpi(SparsePolicy::Omit);
        def.validate().expect("valid");
        def.tag_column = None;
        def.tags = vec!["L1".into()];
        assert!(matches!(def.validate(), Err(EtlError::Config(_))));
    }
}
