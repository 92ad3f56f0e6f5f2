//! Fiscal calendar reference data.
//!
//! The calendar is generated once for a span of fiscal years and then only read.
//! A fiscal year is named after the calendar year it ends in; week 1 is the
//! (possibly partial) week holding the first day of the fiscal year.

use std::fmt;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::{EtlError, EtlResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalCalendarConfig {
    /// Calendar month (1-12) that closes the fiscal year.
    #[serde(default = "default_year_end_month")]
    pub fiscal_year_end_month: u32,
    #[serde(default = "default_week_start")]
    pub week_start: Weekday,
    pub first_fiscal_year: i32,
    pub last_fiscal_year: i32,
}

fn default_year_end_month() -> u32 {
    12
}

fn default_week_start() -> Weekday {
    Weekday::Mon
}

impl FiscalCalendarConfig {
    pub fn calendar_years(first_fiscal_year: i32, last_fiscal_year: i32) -> Self {
        Self {
            fiscal_year_end_month: default_year_end_month(),
            week_start: default_week_start(),
            first_fiscal_year,
            last_fiscal_year,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub date: NaiveDate,
    pub fiscal_year: i32,
    pub fiscal_week: u32,
    pub fiscal_month: u32,
}

impl FiscalPeriod {
    pub fn year_label(&self) -> String {
        format!("FY{}", self.fiscal_year)
    }

    pub fn week_label(&self) -> String {
        format!("FY{}-W{:02}", self.fiscal_year, self.fiscal_week)
    }

    pub fn month_label(&self) -> String {
        format!("FY{}-M{:02}", self.fiscal_year, self.fiscal_month)
    }

    pub fn key(&self, grain: FiscalGrain) -> PeriodKey {
        let number = match grain {
            FiscalGrain::Week => self.fiscal_week,
            FiscalGrain::Month => self.fiscal_month,
        };
        PeriodKey {
            fiscal_year: self.fiscal_year,
            grain,
            number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiscalGrain {
    Week,
    Month,
}

/// One fiscal week or month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    pub fiscal_year: i32,
    pub grain: FiscalGrain,
    pub number: u32,
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.grain {
            FiscalGrain::Week => 'W',
            FiscalGrain::Month => 'M',
        };
        write!(f, "FY{}-{}{:02}", self.fiscal_year, marker, self.number)
    }
}

/// Inclusive date range evaluated in fiscal terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FiscalWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> EtlResult<Self> {
        if start > end {
            return Err(EtlError::Config(format!(
                "fiscal window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone)]
pub struct FiscalCalendar {
    config: FiscalCalendarConfig,
    first: NaiveDate,
    periods: Vec<FiscalPeriod>,
}

impl FiscalCalendar {
    pub fn generate(config: FiscalCalendarConfig) -> EtlResult<Self> {
        if !(1..=12).contains(&config.fiscal_year_end_month) {
            return Err(EtlError::Config(format!(
                "fiscal year end month {} must be between 1 and 12",
                config.fiscal_year_end_month
            )));
        }
        if config.first_fiscal_year > config.last_fiscal_year {
            return Err(EtlError::Config(format!(
                "first fiscal year {} is after last fiscal year {}",
                config.first_fiscal_year, config.last_fiscal_year
            )));
        }

        let first = fiscal_year_start(config.first_fiscal_year, config.fiscal_year_end_month)?;
        let next_start =
            fiscal_year_start(config.last_fiscal_year + 1, config.fiscal_year_end_month)?;

        let mut periods = Vec::new();
        let mut date = first;
        while date < next_start {
            periods.push(derive_period(date, &config)?);
            date = date
                .checked_add_days(Days::new(1))
                .ok_or_else(|| EtlError::Config(format!("date overflow after {date}")))?;
        }

        Ok(Self {
            config,
            first,
            periods,
        })
    }

    pub fn config(&self) -> &FiscalCalendarConfig {
        &self.config
    }

    pub fn first_date(&self) -> NaiveDate {
        self.first
    }

    pub fn last_date(&self) -> NaiveDate {
        self.periods.last().map(|p| p.date).unwrap_or(self.first)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FiscalPeriod> {
        self.periods.iter()
    }

    pub fn resolve(&self, date: NaiveDate) -> EtlResult<FiscalPeriod> {
        self.index_of(date).map(|idx| self.periods[idx])
    }

    fn index_of(&self, date: NaiveDate) -> EtlResult<usize> {
        let offset = (date - self.first).num_days();
        if offset < 0 || offset as usize >= self.periods.len() {
            return Err(EtlError::OutOfRange {
                date,
                first: self.first,
                last: self.last_date(),
            });
        }
        Ok(offset as usize)
    }

    /// First calendar date of the week or month containing `date`.
    pub fn period_start(&self, date: NaiveDate, grain: FiscalGrain) -> EtlResult<NaiveDate> {
        let mut idx = self.index_of(date)?;
        let key = self.periods[idx].key(grain);
        while idx > 0 && self.periods[idx - 1].key(grain) == key {
            idx -= 1;
        }
        Ok(self.periods[idx].date)
    }

    pub fn period_end(&self, date: NaiveDate, grain: FiscalGrain) -> EtlResult<NaiveDate> {
        let mut idx = self.index_of(date)?;
        let key = self.periods[idx].key(grain);
        while idx + 1 < self.periods.len() && self.periods[idx + 1].key(grain) == key {
            idx += 1;
        }
        Ok(self.periods[idx].date)
    }

    pub fn week_window(&self, fiscal_year: i32, from_week: u32, to_week: u32) -> EtlResult<FiscalWindow> {
        self.window_for(fiscal_year, FiscalGrain::Week, from_week, to_week)
    }

    pub fn month_window(
        &self,
        fiscal_year: i32,
        from_month: u32,
        to_month: u32,
    ) -> EtlResult<FiscalWindow> {
        self.window_for(fiscal_year, FiscalGrain::Month, from_month, to_month)
    }

    fn window_for(
        &self,
        fiscal_year: i32,
        grain: FiscalGrain,
        from: u32,
        to: u32,
    ) -> EtlResult<FiscalWindow> {
        let from_key = PeriodKey {
            fiscal_year,
            grain,
            number: from,
        };
        let to_key = PeriodKey {
            fiscal_year,
            grain,
            number: to,
        };
        let start = self
            .periods
            .iter()
            .find(|p| p.key(grain) == from_key)
            .map(|p| p.date)
            .ok_or_else(|| EtlError::NotFound(format!("fiscal period {from_key}")))?;
        let end = self
            .periods
            .iter()
            .rev()
            .find(|p| p.key(grain) == to_key)
            .map(|p| p.date)
            .ok_or_else(|| EtlError::NotFound(format!("fiscal period {to_key}")))?;
        FiscalWindow::new(start, end)
    }

    /// Window spanning the `count` most recent periods up to and including `today`.
    pub fn trailing_window(
        &self,
        today: NaiveDate,
        grain: FiscalGrain,
        count: u32,
    ) -> EtlResult<FiscalWindow> {
        let mut start = self.period_start(today, grain)?;
        for _ in 1..count.max(1) {
            let Some(prev) = start.pred_opt() else { break };
            if prev < self.first {
                break;
            }
            start = self.period_start(prev, grain)?;
        }
        FiscalWindow::new(start, today)
    }

    /// Distinct periods intersecting `window`, each paired with its first date inside the window.
    pub fn periods_in(
        &self,
        window: &FiscalWindow,
        grain: FiscalGrain,
    ) -> EtlResult<Vec<(PeriodKey, NaiveDate)>> {
        // The fields are public, so a window built by hand may be inverted.
        let window = FiscalWindow::new(window.start, window.end)?;
        let start = self.index_of(window.start)?;
        let end = self.index_of(window.end)?;
        let mut out: Vec<(PeriodKey, NaiveDate)> = Vec::new();
        for period in &self.periods[start..=end] {
            let key = period.key(grain);
            if out.last().map(|(k, _)| *k) != Some(key) {
                out.push((key, period.date));
            }
        }
        Ok(out)
    }
}

fn fiscal_year_start(fiscal_year: i32, end_month: u32) -> EtlResult<NaiveDate> {
    let (year, month) = if end_month == 12 {
        (fiscal_year, 1)
    } else {
        (fiscal_year - 1, end_month + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| EtlError::Config(format!("fiscal year {fiscal_year} is not representable")))
}

fn derive_period(date: NaiveDate, config: &FiscalCalendarConfig) -> EtlResult<FiscalPeriod> {
    let end_month = config.fiscal_year_end_month;
    let fiscal_year = if date.month() > end_month {
        date.year() + 1
    } else {
        date.year()
    };
    let fiscal_month = (date.month() + 12 - (end_month % 12) - 1) % 12 + 1;

    let start = fiscal_year_start(fiscal_year, end_month)?;
    let lead = (start.weekday().num_days_from_monday() + 7
        - config.week_start.num_days_from_monday())
        % 7;
    let fiscal_week = ((date - start).num_days() as u32 + lead) / 7 + 1;

    Ok(FiscalPeriod {
        date,
        fiscal_year,
        fiscal_week,
        fiscal_month,
    })
}
