use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, error, info, warn};

use crate::config::VerifyConfig;
use crate::error::RollupError;
use crate::fiscal::FiscalYearSet;
use crate::model::{Dimension, DimensionTable, PerDimension};

/// Sum of every metric column of one dimension table, captured once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TotalsSnapshot {
    totals: BTreeMap<String, f64>,
}

impl TotalsSnapshot {
    pub fn capture(table: &DimensionTable) -> Result<Self, RollupError> {
        let mut totals = BTreeMap::new();
        for column in table.metric_columns() {
            let series = table
                .frame()
                .column(&column.name)?
                .as_materialized_series()
                .clone();
            totals.insert(column.name.clone(), series.sum::<f64>()?);
        }
        Ok(Self { totals })
    }

    pub fn from_totals(totals: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            totals: totals.into_iter().collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        self.totals.get(column).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.totals.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

// ── Findings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Match,
    Negligible,
    Minor,
    Warning,
    Critical,
}

impl Severity {
    pub fn classify(diff: f64, thresholds: &VerifyConfig) -> Self {
        let magnitude = diff.abs();
        if magnitude == 0.0 {
            Severity::Match
        } else if magnitude <= thresholds.negligible_abs {
            Severity::Negligible
        } else if magnitude >= thresholds.critical_abs {
            Severity::Critical
        } else if magnitude >= thresholds.warning_abs {
            Severity::Warning
        } else {
            Severity::Minor
        }
    }

    /// Only critical differences fail a run; warnings are counted and logged.
    pub fn fails(&self) -> bool {
        matches!(self, Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Match => "match",
            Severity::Negligible => "negligible",
            Severity::Minor => "minor",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Expected totals → merged tables.
    Merge,
    /// Merged tables → backfilled and deduplicated tables.
    Dedup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Merge => write!(f, "merge"),
            Stage::Dedup => write!(f, "dedup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub stage: Stage,
    pub dimension: Dimension,
    pub column: String,
    pub before: f64,
    pub after: f64,
    pub diff: f64,
    pub relative_pct: f64,
    pub severity: Severity,
}

/// A column whose total differs between dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub column: String,
    pub totals: PerDimension<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissingColumn {
    pub stage: Stage,
    pub dimension: Dimension,
    pub column: String,
}

/// History carrying this year's columns with totals unlike the fresh aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleConflict {
    pub dimension: Dimension,
    pub column: String,
    pub current: f64,
    pub historical: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    pub discrepancies: Vec<Discrepancy>,
    pub divergences: Vec<Divergence>,
    pub missing: Vec<MissingColumn>,
    pub stale: Vec<StaleConflict>,
}

impl VerificationReport {
    /// Stale conflicts are advisory and never fail a run.
    pub fn passed(&self) -> bool {
        self.divergences.is_empty()
            && self.missing.is_empty()
            && !self.discrepancies.iter().any(|d| d.severity.fails())
    }

    pub fn worst(&self) -> Severity {
        self.discrepancies
            .iter()
            .map(|d| d.severity)
            .max()
            .unwrap_or(Severity::Match)
    }

    fn count(&self, severity: Severity) -> usize {
        self.discrepancies
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn log_summary(&self) {
        let compared = self.discrepancies.len();
        if self.passed() {
            info!(
                compared,
                warning = self.count(Severity::Warning),
                minor = self.count(Severity::Minor),
                negligible = self.count(Severity::Negligible),
                stale = self.stale.len(),
                "verification passed"
            );
        } else {
            error!(
                compared,
                critical = self.count(Severity::Critical),
                warning = self.count(Severity::Warning),
                divergences = self.divergences.len(),
                missing = self.missing.len(),
                "VERIFICATION FAILED"
            );
        }
    }
}

// ── Verifier ────────────────────────────────────────────────────────────────

/// Conservation checks around each merge stage. Advisory: findings are
/// logged and reported, never raised.
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    years: FiscalYearSet,
    thresholds: VerifyConfig,
}

impl IntegrityVerifier {
    pub fn new(years: FiscalYearSet, thresholds: VerifyConfig) -> Self {
        Self { years, thresholds }
    }

    pub fn compare(
        &self,
        stage: Stage,
        dimension: Dimension,
        before: &TotalsSnapshot,
        after: &TotalsSnapshot,
        report: &mut VerificationReport,
    ) {
        for (column, before_total) in before.iter() {
            let Some(after_total) = after.get(column) else {
                error!(%stage, %dimension, column, "column missing after stage");
                report.missing.push(MissingColumn {
                    stage,
                    dimension,
                    column: column.to_string(),
                });
                continue;
            };

            let diff = after_total - before_total;
            let relative_pct = diff.abs() / before_total.abs().max(1.0) * 100.0;
            let severity = Severity::classify(diff, &self.thresholds);
            match severity {
                Severity::Match | Severity::Negligible => {
                    debug!(%stage, %dimension, column, diff, "total conserved")
                }
                Severity::Minor => {
                    info!(%stage, %dimension, column, before_total, after_total, diff, relative_pct, "minor total change")
                }
                Severity::Warning => {
                    warn!(%stage, %dimension, column, before_total, after_total, diff, relative_pct, "total changed")
                }
                Severity::Critical => {
                    error!(%stage, %dimension, column, before_total, after_total, diff, relative_pct, "CRITICAL total change")
                }
            }
            report.discrepancies.push(Discrepancy {
                stage,
                dimension,
                column: column.to_string(),
                before: before_total,
                after: after_total,
                diff,
                relative_pct,
                severity,
            });
        }
    }

    /// Totals the merge should reproduce: this year from the fresh
    /// aggregate, prior years from history (else the fresh aggregate).
    pub fn baseline(&self, current: &TotalsSnapshot, historical: &TotalsSnapshot) -> TotalsSnapshot {
        TotalsSnapshot::from_totals(self.years.expected_metrics().into_iter().filter_map(|m| {
            let name = m.name();
            let total = if self.years.is_current(m.year) {
                current.get(&name)
            } else {
                historical.get(&name).or_else(|| current.get(&name))
            };
            total.map(|t| (name, t))
        }))
    }

    /// Every grouping partitions the same transactions, so totals must agree.
    pub fn cross_check(
        &self,
        snapshots: &PerDimension<TotalsSnapshot>,
        report: &mut VerificationReport,
    ) {
        for (column, company) in snapshots.company.iter() {
            let (Some(customer), Some(product)) = (
                snapshots.customer.get(column),
                snapshots.customer_product.get(column),
            ) else {
                continue;
            };
            let values = [company, customer, product];
            let max = values.iter().copied().fold(f64::MIN, f64::max);
            let min = values.iter().copied().fold(f64::MAX, f64::min);
            let tolerance = 1e-6 * max.abs().max(1.0);
            if max - min > tolerance {
                error!(column, company, customer, product, "CRITICAL totals diverge across dimensions");
                report.divergences.push(Divergence {
                    column: column.to_string(),
                    totals: PerDimension {
                        company,
                        customer,
                        customer_product: product,
                    },
                });
            }
        }
    }

    /// Historical tables should not carry this year's columns; when they do
    /// with different totals, the history predates a ledger correction.
    pub fn stale_check(
        &self,
        dimension: Dimension,
        current: &TotalsSnapshot,
        historical: &TotalsSnapshot,
        report: &mut VerificationReport,
    ) {
        for suffix in self.years.suffixes_for(self.years.current()) {
            let name = suffix.column_name(self.years.current());
            let (Some(now), Some(then)) = (current.get(&name), historical.get(&name)) else {
                continue;
            };
            if (now - then).abs() > self.thresholds.stale_current_year_abs {
                warn!(%dimension, column = %name, current = now, historical = then, "history carries a stale current-year total");
                report.stale.push(StaleConflict {
                    dimension,
                    column: name,
                    current: now,
                    historical: then,
                });
            }
        }
    }

    /// Verify both merge stages and the final cross-dimension consistency.
    pub fn verify(
        &self,
        current: &PerDimension<DimensionTable>,
        historical: &PerDimension<DimensionTable>,
        merged: &PerDimension<DimensionTable>,
        deduplicated: &PerDimension<DimensionTable>,
    ) -> Result<VerificationReport, RollupError> {
        let current = current.try_map(|_, t| TotalsSnapshot::capture(t))?;
        let historical = historical.try_map(|_, t| TotalsSnapshot::capture(t))?;
        let merged = merged.try_map(|_, t| TotalsSnapshot::capture(t))?;
        let deduplicated = deduplicated.try_map(|_, t| TotalsSnapshot::capture(t))?;

        let mut report = VerificationReport::default();
        for dimension in Dimension::ALL {
            let now = current.get(dimension);
            let past = historical.get(dimension);
            self.stale_check(dimension, now, past, &mut report);

            let baseline = self.baseline(now, past);
            self.compare(Stage::Merge, dimension, &baseline, merged.get(dimension), &mut report);
            self.compare(
                Stage::Dedup,
                dimension,
                merged.get(dimension),
                deduplicated.get(dimension),
                &mut report,
            );
        }
        self.cross_check(&deduplicated, &mut report);

        report.log_summary();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dimension;
    use polars::prelude::*;

    fn verifier() -> IntegrityVerifier {
        IntegrityVerifier::new(FiscalYearSet::new(2024, 2025).unwrap(), VerifyConfig::default())
    }

    fn snapshot(pairs: &[(&str, f64)]) -> TotalsSnapshot {
        TotalsSnapshot::from_totals(pairs.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    #[test]
    fn severity_tiers() {
        let t = VerifyConfig::default();
        assert_eq!(Severity::classify(0.0, &t), Severity::Match);
        assert_eq!(Severity::classify(-0.5, &t), Severity::Negligible);
        assert_eq!(Severity::classify(5_000.0, &t), Severity::Minor);
        assert_eq!(Severity::classify(-200_000.0, &t), Severity::Warning);
        assert_eq!(Severity::classify(2_000_000.0, &t), Severity::Critical);
    }

    #[test]
    fn capture_sums_metrics_only() {
        let table = DimensionTable::new(
            Dimension::Company,
            df!(
                "法人コード" => ["A", "B"],
                "2025売上" => [Some(10i64), None],
                "2025㎡" => [1.5f64, 2.0],
            )
            .unwrap(),
        );
        let snap = TotalsSnapshot::capture(&table).unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("2025売上"), Some(10.0));
        assert_eq!(snap.get("2025㎡"), Some(3.5));
    }

    #[test]
    fn relative_change_uses_unit_floor() {
        let mut report = VerificationReport::default();
        verifier().compare(
            Stage::Merge,
            Dimension::Company,
            &snapshot(&[("2025売上", 0.0)]),
            &snapshot(&[("2025売上", 3.0)]),
            &mut report,
        );
        assert_eq!(report.discrepancies[0].relative_pct, 300.0);
        assert_eq!(report.discrepancies[0].severity, Severity::Minor);
        assert!(report.passed());
    }

    #[test]
    fn warning_is_reported_but_only_critical_fails() {
        let mut report = VerificationReport::default();
        verifier().compare(
            Stage::Merge,
            Dimension::Company,
            &snapshot(&[("2025売上", 0.0), ("2024売上", 0.0)]),
            &snapshot(&[("2025売上", 200_000.0), ("2024売上", 0.0)]),
            &mut report,
        );
        assert_eq!(report.worst(), Severity::Warning);
        assert!(report.passed());

        verifier().compare(
            Stage::Dedup,
            Dimension::Company,
            &snapshot(&[("2024売上", 0.0)]),
            &snapshot(&[("2024売上", -1_500_000.0)]),
            &mut report,
        );
        assert_eq!(report.worst(), Severity::Critical);
        assert!(!report.passed());
    }

    #[test]
    fn missing_column_fails() {
        let mut report = VerificationReport::default();
        verifier().compare(
            Stage::Dedup,
            Dimension::Customer,
            &snapshot(&[("2024売上", 10.0)]),
            &TotalsSnapshot::default(),
            &mut report,
        );
        assert_eq!(report.missing.len(), 1);
        assert!(!report.passed());
    }

    #[test]
    fn baseline_takes_current_year_from_fresh_aggregate() {
        let current = snapshot(&[("2025売上", 100.0), ("2024売上", 1.0)]);
        let historical = snapshot(&[("2025売上", 999.0), ("2024売上", 50.0), ("2019売上", 7.0)]);
        let baseline = verifier().baseline(&current, &historical);
        assert_eq!(baseline.get("2025売上"), Some(100.0));
        assert_eq!(baseline.get("2024売上"), Some(50.0));
        assert_eq!(baseline.get("2019売上"), None);
    }

    #[test]
    fn cross_dimension_divergence_is_critical() {
        let snapshots = PerDimension {
            company: snapshot(&[("2025売上", 100.0), ("2024売上", 5.0)]),
            customer: snapshot(&[("2025売上", 100.0), ("2024売上", 5.0)]),
            customer_product: snapshot(&[("2025売上", 99.0), ("2024売上", 5.0)]),
        };
        let mut report = VerificationReport::default();
        verifier().cross_check(&snapshots, &mut report);
        assert_eq!(report.divergences.len(), 1);
        assert_eq!(report.divergences[0].column, "2025売上");
        assert!(!report.passed());
    }

    #[test]
    fn stale_current_year_history_is_advisory() {
        let mut report = VerificationReport::default();
        verifier().stale_check(
            Dimension::Company,
            &snapshot(&[("2025売上", 100_000.0)]),
            &snapshot(&[("2025売上", 90_000.0)]),
            &mut report,
        );
        assert_eq!(report.stale.len(), 1);
        assert!(report.passed());
    }
}
