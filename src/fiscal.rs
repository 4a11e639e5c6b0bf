use chrono::{Datelike, NaiveDate};

use crate::error::RollupError;
use crate::model::MetricSuffix;

/// A `(year, suffix)` metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricColumn {
    pub year: i32,
    pub suffix: MetricSuffix,
}

impl MetricColumn {
    pub fn name(&self) -> String {
        self.suffix.column_name(self.year)
    }
}

/// Fiscal years from a configured start year through the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiscalYearSet {
    start: i32,
    current: i32,
}

impl FiscalYearSet {
    pub fn new(start: i32, current: i32) -> Result<Self, RollupError> {
        if start > current {
            return Err(RollupError::Config(format!(
                "start year {start} is after the current fiscal year {current}"
            )));
        }
        Ok(Self { start, current })
    }

    /// The fiscal year rolls over on the first day of `rollover_month`.
    pub fn fiscal_year_of(date: NaiveDate, rollover_month: u32) -> i32 {
        if date.month() >= rollover_month {
            date.year()
        } else {
            date.year() - 1
        }
    }

    pub fn from_date(
        date: NaiveDate,
        start: i32,
        rollover_month: u32,
    ) -> Result<Self, RollupError> {
        Self::new(start, Self::fiscal_year_of(date, rollover_month))
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn start(&self) -> i32 {
        self.start
    }

    /// Descending, current year first.
    pub fn years(&self) -> impl Iterator<Item = i32> {
        (self.start..=self.current).rev()
    }

    fn contains(&self, year: i32) -> bool {
        (self.start..=self.current).contains(&year)
    }

    pub fn is_current(&self, year: i32) -> bool {
        year == self.current
    }

    /// Suffixes reported for `year`.
    pub fn suffixes_for(&self, year: i32) -> impl Iterator<Item = MetricSuffix> {
        let current = self.is_current(year);
        MetricSuffix::ALL
            .into_iter()
            .filter(move |s| current || !s.current_year_only())
    }

    /// Every expected metric column, in presentation order.
    pub fn expected_metrics(&self) -> Vec<MetricColumn> {
        self.years()
            .flat_map(|year| self.suffixes_for(year).map(move |suffix| MetricColumn { year, suffix }))
            .collect()
    }

    pub fn is_expected(&self, year: i32, suffix: MetricSuffix) -> bool {
        self.contains(year) && (self.is_current(year) || !suffix.current_year_only())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiscal_year_rolls_over_in_april() {
        let march = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let april = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        assert_eq!(FiscalYearSet::fiscal_year_of(march, 4), 2025);
        assert_eq!(FiscalYearSet::fiscal_year_of(april, 4), 2026);
    }

    #[test]
    fn expected_metrics_put_quantity_on_current_year_only() {
        let years = FiscalYearSet::new(2023, 2025).unwrap();
        let names: Vec<String> = years.expected_metrics().iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec![
                "2025売上数", "2025㎡", "2025売上", "2025粗利",
                "2024㎡", "2024売上", "2024粗利",
                "2023㎡", "2023売上", "2023粗利",
            ]
        );
        assert!(!years.is_expected(2024, MetricSuffix::Quantity));
        assert!(!years.is_expected(2022, MetricSuffix::Revenue));
    }

    #[test]
    fn start_after_current_is_rejected() {
        assert!(FiscalYearSet::new(2026, 2025).is_err());
    }
}
