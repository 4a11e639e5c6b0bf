use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::aggregation::null_preserving_sum;
use crate::config::{MergeConfig, OverwritePolicy};
use crate::error::RollupError;
use crate::fiscal::FiscalYearSet;
use crate::model::{Dimension, DimensionTable};
use crate::schema::merge::{KEY_COUNT, SHADOW_SUFFIX};

fn shadow_name(name: &str) -> String {
    format!("{name}{SHADOW_SUFFIX}")
}

/// Full-joins this period's aggregate with the carried-forward history.
///
/// Historical data columns travel through the join under a shadow name and
/// are folded back per column class:
///
/// * identity columns fill only their nulls from history;
/// * current-year metrics never read history;
/// * prior-year metrics follow the [`OverwritePolicy`].
///
/// Every expected `(year, suffix)` column exists in the output.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalMerger {
    years: FiscalYearSet,
    policy: OverwritePolicy,
}

impl IncrementalMerger {
    pub fn new(years: FiscalYearSet, policy: OverwritePolicy) -> Self {
        Self { years, policy }
    }

    pub fn from_config(years: FiscalYearSet, config: &MergeConfig) -> Self {
        Self::new(years, config.historical_overwrite_policy)
    }

    pub fn merge(
        &self,
        current: &DimensionTable,
        historical: &DimensionTable,
    ) -> Result<DimensionTable, RollupError> {
        let dimension = current.dimension();

        if historical.is_empty() {
            info!(%dimension, "no historical rows, keeping current aggregate as is");
            return Ok(current.clone());
        }

        let keys = join_keys(current, historical);
        if keys.is_empty() {
            warn!(%dimension, "no join key present on both sides, historical data ignored");
            return Ok(current.clone());
        }

        let historical = &collapse_historical_duplicates(historical, &keys)?;

        let key_exprs: Vec<Expr> = keys.iter().map(|k| col(*k)).collect();
        let as_text: Vec<Expr> = keys
            .iter()
            .map(|k| col(*k).cast(DataType::String))
            .collect();

        let left = current.frame().clone().lazy().with_columns(as_text.clone());
        let right = self.shadow_historical(historical, &keys).with_columns(as_text);

        let joined = left.join(
            right,
            key_exprs.clone(),
            key_exprs,
            JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
        );

        let (fills, output) = self.reconcile_columns(current, historical, &keys);
        let df = joined.with_columns(fills).select(output).collect()?;
        let df = consolidate_duplicate_keys(dimension, df, &keys)?;

        info!(
            %dimension,
            policy = %self.policy,
            current_rows = current.height(),
            historical_rows = historical.height(),
            merged_rows = df.height(),
            "merged with history"
        );
        Ok(DimensionTable::new(dimension, df))
    }

    /// Every non-key historical column is renamed to its shadow.
    fn shadow_historical(&self, historical: &DimensionTable, keys: &[&str]) -> LazyFrame {
        let (from, to): (Vec<&str>, Vec<String>) = historical
            .columns()
            .iter()
            .filter(|c| !keys.contains(&c.name.as_str()))
            .map(|c| (c.name.as_str(), shadow_name(&c.name)))
            .unzip();
        historical.frame().clone().lazy().rename(from, to, true)
    }

    /// Null-reconciliation expressions plus the output projection, which omits
    /// every shadow column.
    fn reconcile_columns(
        &self,
        current: &DimensionTable,
        historical: &DimensionTable,
        keys: &[&str],
    ) -> (Vec<Expr>, Vec<Expr>) {
        let dimension = current.dimension();
        let mut fills = Vec::new();
        let mut identity: Vec<String> = current
            .columns()
            .iter()
            .filter(|c| !c.is_metric())
            .map(|c| c.name.clone())
            .collect();

        // Identity: history only fills gaps.
        for column in historical.columns() {
            if column.is_metric() || keys.contains(&column.name.as_str()) {
                continue;
            }
            let name = column.name.as_str();
            let shadow = shadow_name(name);
            if current.has_column(name) {
                fills.push(
                    when(col(name).is_null())
                        .then(col(shadow.as_str()).cast(DataType::String))
                        .otherwise(col(name).cast(DataType::String))
                        .alias(name),
                );
            } else {
                fills.push(col(shadow.as_str()).cast(DataType::String).alias(name));
                identity.push(column.name.clone());
            }
        }

        // Metrics: one expression per expected column.
        let mut metrics = Vec::new();
        for metric in self.years.expected_metrics() {
            let name = metric.name();
            let shadow = shadow_name(&name);
            let dtype = metric.suffix.dtype();
            let in_current = current.has_column(&name);
            let in_history = historical.has_column(&name);

            let expr = if self.years.is_current(metric.year) {
                if in_current {
                    col(name.as_str()).cast(dtype)
                } else {
                    warn!(%dimension, column = %name, "current-year column missing, creating nulls");
                    lit(NULL).cast(dtype)
                }
            } else {
                match (in_current, in_history, self.policy) {
                    (true, true, OverwritePolicy::Protective) => {
                        when(col(name.as_str()).is_null())
                            .then(col(shadow.as_str()).cast(dtype.clone()))
                            .otherwise(col(name.as_str()).cast(dtype))
                    }
                    (_, true, _) => col(shadow.as_str()).cast(dtype),
                    (true, false, _) => col(name.as_str()).cast(dtype),
                    (false, false, _) => {
                        debug!(%dimension, column = %name, "prior-year column on neither side");
                        lit(NULL).cast(dtype)
                    }
                }
            };
            fills.push(expr.alias(name.as_str()));
            metrics.push(name);
        }

        // Metrics outside the fiscal year set survive only from the current side.
        let extra: Vec<String> = current
            .metric_columns()
            .filter(|c| !metrics.contains(&c.name))
            .map(|c| c.name.clone())
            .collect();
        let dropped = historical
            .metric_columns()
            .filter(|c| !metrics.contains(&c.name) && !extra.contains(&c.name))
            .count();
        if dropped > 0 {
            debug!(%dimension, dropped, "historical metrics outside the fiscal year set dropped");
        }

        let output = identity
            .iter()
            .chain(metrics.iter())
            .chain(extra.iter())
            .map(|name| col(name.as_str()))
            .collect();
        (fills, output)
    }
}

/// Dimension keys present on both sides, in key order.
fn join_keys(current: &DimensionTable, historical: &DimensionTable) -> Vec<&'static str> {
    let dimension = current.dimension();
    let configured = dimension.key_columns();
    let keys: Vec<&'static str> = configured
        .iter()
        .copied()
        .filter(|k| current.has_column(k) && historical.has_column(k))
        .collect();
    if keys.len() < configured.len() {
        let missing: Vec<&str> = configured
            .iter()
            .copied()
            .filter(|k| !keys.contains(k))
            .collect();
        warn!(%dimension, ?missing, ?keys, "join key reduced to the columns present on both sides");
    }
    keys
}

/// Historical rows repeating a non-null join key collapse to the first row
/// seen, so the join matches each current row at most once.
///
/// Rows with a null in any key column never match and are left as they are.
fn collapse_historical_duplicates(
    historical: &DimensionTable,
    keys: &[&str],
) -> Result<DimensionTable, RollupError> {
    let dimension = historical.dimension();
    let key_exprs: Vec<Expr> = keys.iter().map(|k| col(*k)).collect();
    let keyed = keys
        .iter()
        .map(|k| col(*k).is_not_null())
        .reduce(|a, b| a.and(b))
        .unwrap_or(lit(true));
    let frame = historical.frame().clone().lazy().with_columns(
        keys.iter()
            .map(|k| col(*k).cast(DataType::String))
            .collect::<Vec<_>>(),
    );

    let duplicated = frame
        .clone()
        .filter(keyed.clone())
        .group_by(key_exprs.clone())
        .agg([len().alias(KEY_COUNT)])
        .filter(col(KEY_COUNT).gt(lit(1)))
        .collect()?;
    if duplicated.height() == 0 {
        return Ok(historical.clone());
    }
    warn!(
        %dimension,
        groups = duplicated.height(),
        "duplicate historical keys collapsed to the first row seen"
    );

    let names: Vec<String> = historical.columns().iter().map(|c| c.name.clone()).collect();
    let firsts: Vec<Expr> = names
        .iter()
        .filter(|name| !keys.contains(&name.as_str()))
        .map(|name| col(name.as_str()).first())
        .collect();
    let order: Vec<Expr> = names.iter().map(|name| col(name.as_str())).collect();

    let collapsed = frame
        .clone()
        .filter(keyed.clone())
        .group_by_stable(key_exprs)
        .agg(firsts)
        .select(order.clone());
    let unkeyed = frame.filter(keyed.not()).select(order);
    let df = concat([collapsed, unkeyed], UnionArgs::default())?.collect()?;
    Ok(DimensionTable::new(dimension, df))
}

/// Collapse rows that share a composite key.
///
/// Null keys never match in the outer join, so a null-keyed row from each side
/// survives separately; metrics are summed (nulls preserved) and identity
/// columns take their first non-null value.
pub(crate) fn consolidate_duplicate_keys(
    dimension: Dimension,
    df: DataFrame,
    keys: &[&str],
) -> Result<DataFrame, RollupError> {
    let key_exprs: Vec<Expr> = keys.iter().map(|k| col(*k)).collect();
    let duplicated = df
        .clone()
        .lazy()
        .group_by(key_exprs.clone())
        .agg([len().alias(KEY_COUNT)])
        .filter(col(KEY_COUNT).gt(lit(1)))
        .collect()?;
    if duplicated.height() == 0 {
        return Ok(df);
    }

    warn!(%dimension, groups = duplicated.height(), "duplicate composite keys consolidated");
    let table = DimensionTable::new(dimension, df);
    let aggs: Vec<Expr> = table
        .columns()
        .iter()
        .filter(|c| !keys.contains(&c.name.as_str()))
        .map(|c| {
            let name = c.name.as_str();
            match c.suffix {
                Some(suffix) => null_preserving_sum(col(name)).cast(suffix.dtype()).alias(name),
                None => col(name).drop_nulls().first().alias(name),
            }
        })
        .collect();
    let order: Vec<Expr> = table.columns().iter().map(|c| col(c.name.as_str())).collect();

    Ok(table
        .into_frame()
        .lazy()
        .group_by_stable(key_exprs)
        .agg(aggs)
        .select(order)
        .collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::identity;

    fn years() -> FiscalYearSet {
        FiscalYearSet::new(2023, 2025).unwrap()
    }

    fn company(df: DataFrame) -> DimensionTable {
        DimensionTable::new(Dimension::Company, df)
    }

    fn lookup(df: &DataFrame, code: Option<&str>, column: &str) -> Option<i64> {
        let codes = df.column(identity::COMPANY_CODE).unwrap().str().unwrap();
        let values = df.column(column).unwrap().i64().unwrap();
        codes
            .into_iter()
            .zip(values.into_iter())
            .find(|(c, _)| *c == code)
            .and_then(|(_, v)| v)
    }

    fn total(df: &DataFrame, column: &str) -> Option<i64> {
        df.column(column).unwrap().i64().unwrap().sum()
    }

    fn scenario_current() -> DimensionTable {
        company(
            df!(
                identity::COMPANY_CODE => ["A"],
                "2025売上数" => [3.0f64],
                "2025㎡" => [1.0f64],
                "2025売上" => [100i64],
                "2025粗利" => [20i64],
            )
            .unwrap(),
        )
    }

    fn scenario_history() -> DimensionTable {
        company(
            df!(
                identity::COMPANY_CODE => ["A"],
                identity::COMPANY_NAME => ["エー商事"],
                "2024売上" => [50i64],
                "2023売上" => [30i64],
            )
            .unwrap(),
        )
    }

    #[test]
    fn carries_prior_years_forward() {
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let merged = merger.merge(&scenario_current(), &scenario_history()).unwrap();
        let df = merged.frame();

        assert_eq!(df.height(), 1);
        assert_eq!(lookup(df, Some("A"), "2025売上"), Some(100));
        assert_eq!(lookup(df, Some("A"), "2024売上"), Some(50));
        assert_eq!(lookup(df, Some("A"), "2023売上"), Some(30));
        let names = df.column(identity::COMPANY_NAME).unwrap().str().unwrap();
        assert_eq!(names.get(0), Some("エー商事"));
        assert!(!df.get_column_names_str().iter().any(|c| c.ends_with(SHADOW_SUFFIX)));
    }

    #[test]
    fn every_expected_column_exists() {
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let merged = merger.merge(&scenario_current(), &scenario_history()).unwrap();
        for metric in years().expected_metrics() {
            assert!(merged.has_column(&metric.name()), "{}", metric.name());
        }
        // neither side had 2023 margin: null, not absent
        assert_eq!(merged.frame().column("2023粗利").unwrap().null_count(), 1);
        assert_eq!(merged.frame().column("2023粗利").unwrap().dtype(), &DataType::Int64);
    }

    #[test]
    fn stale_current_year_history_never_leaks() {
        let history = company(
            df!(
                identity::COMPANY_CODE => ["A", "B"],
                "2025売上" => [999i64, 7],
                "2024売上" => [50i64, 5],
            )
            .unwrap(),
        );
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Authoritative);
        let merged = merger.merge(&scenario_current(), &history).unwrap();
        let df = merged.frame();

        assert_eq!(lookup(df, Some("A"), "2025売上"), Some(100));
        // a history-only row gets no current-year value at all
        assert_eq!(lookup(df, Some("B"), "2025売上"), None);
        assert_eq!(lookup(df, Some("B"), "2024売上"), Some(5));
    }

    #[test]
    fn re_merging_merged_output_is_idempotent() {
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let once = merger.merge(&scenario_current(), &scenario_history()).unwrap();
        let twice = merger.merge(&scenario_current(), &once).unwrap();

        for metric in years().expected_metrics() {
            let name = metric.name();
            let a = once.frame().column(&name).unwrap().as_materialized_series().clone();
            let b = twice.frame().column(&name).unwrap().as_materialized_series().clone();
            assert_eq!(
                a.sum::<f64>().unwrap(),
                b.sum::<f64>().unwrap(),
                "{name}"
            );
        }
        assert_eq!(total(twice.frame(), "2025売上"), Some(100));
        assert_eq!(twice.height(), 1);
    }

    #[test]
    fn prior_year_totals_are_conserved() {
        let current = company(df!(identity::COMPANY_CODE => ["N"], "2025売上" => [5i64]).unwrap());
        let history = company(
            df!(
                identity::COMPANY_CODE => ["A", "B", "C"],
                "2024売上" => [Some(10i64), None, Some(30)],
                "2023売上" => [1i64, 2, 3],
            )
            .unwrap(),
        );
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let merged = merger.merge(&current, &history).unwrap();

        assert_eq!(merged.height(), 4);
        assert_eq!(total(merged.frame(), "2024売上"), Some(40));
        assert_eq!(total(merged.frame(), "2023売上"), Some(6));
        assert_eq!(total(merged.frame(), "2025売上"), Some(5));
    }

    #[test]
    fn overwrite_policy_decides_prior_year_conflicts() {
        let current = company(
            df!(
                identity::COMPANY_CODE => ["A", "B"],
                "2025売上" => [1i64, 1],
                "2024売上" => [Some(70i64), None],
            )
            .unwrap(),
        );
        let history = company(
            df!(
                identity::COMPANY_CODE => ["A", "B"],
                "2024売上" => [50i64, 40],
            )
            .unwrap(),
        );

        let protective = IncrementalMerger::new(years(), OverwritePolicy::Protective)
            .merge(&current, &history)
            .unwrap();
        assert_eq!(lookup(protective.frame(), Some("A"), "2024売上"), Some(70));
        assert_eq!(lookup(protective.frame(), Some("B"), "2024売上"), Some(40));

        let authoritative = IncrementalMerger::new(years(), OverwritePolicy::Authoritative)
            .merge(&current, &history)
            .unwrap();
        assert_eq!(lookup(authoritative.frame(), Some("A"), "2024売上"), Some(50));
        assert_eq!(lookup(authoritative.frame(), Some("B"), "2024売上"), Some(40));
    }

    #[test]
    fn empty_history_returns_current() {
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let current = scenario_current();
        let merged = merger
            .merge(&current, &DimensionTable::empty(Dimension::Company))
            .unwrap();
        assert!(merged.frame().equals_missing(current.frame()));
    }

    #[test]
    fn join_key_is_reduced_to_shared_columns() {
        let current = DimensionTable::new(
            Dimension::Customer,
            df!(
                identity::CUSTOMER_CODE => ["C1"],
                identity::CUSTOMER_NAME => ["甲"],
                "2025売上" => [10i64],
            )
            .unwrap(),
        );
        let history = DimensionTable::new(
            Dimension::Customer,
            df!(identity::CUSTOMER_CODE => ["C1"], "2024売上" => [4i64]).unwrap(),
        );
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let merged = merger.merge(&current, &history).unwrap();

        assert_eq!(merged.height(), 1);
        let prior = merged.frame().column("2024売上").unwrap().i64().unwrap();
        assert_eq!(prior.get(0), Some(4));
    }

    #[test]
    fn repeated_history_key_does_not_multiply_current_year() {
        let current = company(df!(identity::COMPANY_CODE => ["A"], "2025売上" => [100i64]).unwrap());
        let history = company(
            df!(
                identity::COMPANY_CODE => [Some("A"), Some("A"), None],
                identity::COMPANY_NAME => ["甲", "甲（旧）", "丙"],
                "2024売上" => [50i64, 50, 7],
            )
            .unwrap(),
        );
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let merged = merger.merge(&current, &history).unwrap();
        let df = merged.frame();

        assert_eq!(df.height(), 2);
        assert_eq!(total(df, "2025売上"), Some(100));
        assert_eq!(lookup(df, Some("A"), "2024売上"), Some(50));
        assert_eq!(lookup(df, None, "2024売上"), Some(7));
        let names = df.column(identity::COMPANY_NAME).unwrap().str().unwrap();
        assert_eq!(names.get(0), Some("甲"));
    }

    #[test]
    fn null_keys_from_both_sides_collapse_into_one_row() {
        let current = company(
            df!(identity::COMPANY_CODE => [None::<&str>, Some("A")], "2025売上" => [10i64, 1]).unwrap(),
        );
        let history = company(
            df!(identity::COMPANY_CODE => [None::<&str>], "2024売上" => [5i64]).unwrap(),
        );
        let merger = IncrementalMerger::new(years(), OverwritePolicy::Protective);
        let merged = merger.merge(&current, &history).unwrap();
        let df = merged.frame();

        assert_eq!(df.height(), 2);
        assert_eq!(lookup(df, None, "2025売上"), Some(10));
        assert_eq!(lookup(df, None, "2024売上"), Some(5));
    }
}
