//! Alert Engine: threshold breaches over KPI series.
//!
//! Each `(kpi_id, tag)` runs a two-state machine over its records in date order.
//! A breach opens a case dated at the breaching period; recovery closes it as
//! `resolved`. Null values carry no information and leave the state unchanged.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use mesw_core::{AlertCase, AlertStatus, KpiRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDirection {
    /// Alert when the value drops under the threshold.
    Below,
    /// Alert when the value exceeds the threshold.
    Above,
}

impl AlertDirection {
    pub fn breached(&self, value: Decimal, threshold: Decimal) -> bool {
        match self {
            AlertDirection::Below => value < threshold,
            AlertDirection::Above => value > threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub kpi_id: String,
    /// Applies to every tag of the KPI when absent.
    #[serde(default)]
    pub tag: Option<String>,
    pub direction: AlertDirection,
    pub threshold: Decimal,
}

fn threshold_for<'a>(thresholds: &'a [ThresholdConfig], kpi_id: &str, tag: &str) -> Option<&'a ThresholdConfig> {
    let mut candidates = thresholds.iter().filter(|t| t.kpi_id == kpi_id);
    let exact = candidates.clone().find(|t| t.tag.as_deref() == Some(tag));
    exact.or_else(|| candidates.find(|t| t.tag.is_none()))
}

/// Cases implied by `records`; the output is ordered by kpi, tag and trigger date.
pub fn evaluate(records: &[KpiRecord], thresholds: &[ThresholdConfig]) -> Vec<AlertCase> {
    let mut series: BTreeMap<(&str, &str), Vec<&KpiRecord>> = BTreeMap::new();
    for record in records {
        series
            .entry((record.kpi_id.as_str(), record.tag.as_str()))
            .or_default()
            .push(record);
    }

    let mut cases = Vec::new();
    for ((kpi_id, tag), mut points) in series {
        let Some(rule) = threshold_for(thresholds, kpi_id, tag) else {
            continue;
        };
        points.sort_by_key(|r| r.created_date);

        let mut open: Option<AlertCase> = None;
        for point in points {
            let Some(value) = point.progress_value else {
                continue;
            };
            let breached = rule.direction.breached(value, rule.threshold);
            match (open.take(), breached) {
                (None, true) => open = Some(new_case(kpi_id, tag, point.created_date, rule, value)),
                (Some(case), true) => open = Some(case),
                (Some(mut case), false) => {
                    case.status = AlertStatus::Resolved;
                    case.resolved_date = Some(point.created_date);
                    cases.push(case);
                }
                (None, false) => {}
            }
        }
        cases.extend(open);
    }
    cases
}

fn new_case(kpi_id: &str, tag: &str, date: NaiveDate, rule: &ThresholdConfig, value: Decimal) -> AlertCase {
    AlertCase {
        kpi_id: kpi_id.to_string(),
        tag: tag.to_string(),
        trigger_date: date,
        threshold: rule.threshold,
        observed_value: value,
        status: AlertStatus::Open,
        resolved_date: None,
    }
}
