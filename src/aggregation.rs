use polars::prelude::*;
use tracing::{info, warn};

use crate::error::RollupError;
use crate::model::{Dimension, DimensionTable, MetricSuffix};
use crate::schema::ledger;

/// How a ledger measure is reduced within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    /// Floating-point sum.
    Sum,
    /// Floating-point sum truncated to integer (money).
    TruncatedSum,
}

/// Declarative aggregation of one ledger measure into a year-labelled metric.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub source: &'static str,
    pub suffix: MetricSuffix,
    pub kind: AggKind,
}

impl Aggregation {
    /// The four ledger measures and the metric each feeds.
    pub fn ledger_metrics() -> [Aggregation; 4] {
        [
            Aggregation {
                source: ledger::QUANTITY,
                suffix: MetricSuffix::Quantity,
                kind: AggKind::Sum,
            },
            Aggregation {
                source: ledger::AREA,
                suffix: MetricSuffix::Area,
                kind: AggKind::Sum,
            },
            Aggregation {
                source: ledger::REVENUE,
                suffix: MetricSuffix::Revenue,
                kind: AggKind::TruncatedSum,
            },
            Aggregation {
                source: ledger::GROSS_MARGIN,
                suffix: MetricSuffix::GrossMargin,
                kind: AggKind::TruncatedSum,
            },
        ]
    }

    fn expr(&self, year: i32) -> Expr {
        let summed = null_preserving_sum(col(self.source));
        let summed = match self.kind {
            AggKind::Sum => summed.cast(DataType::Float64),
            AggKind::TruncatedSum => summed.cast(DataType::Float64).cast(DataType::Int64),
        };
        summed.alias(self.suffix.column_name(year))
    }
}

/// Sum that stays null when every input is null (polars would return zero).
pub(crate) fn null_preserving_sum(expr: Expr) -> Expr {
    when(expr.clone().count().gt(lit(0)))
        .then(expr.sum())
        .otherwise(lit(NULL))
}

/// Groups ledger rows by a dimension key and sums the period metrics.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    year: i32,
}

impl Aggregator {
    pub fn new(year: i32) -> Self {
        Self { year }
    }

    /// One row per distinct key; null is a valid key value.
    pub fn aggregate(
        &self,
        rows: &DataFrame,
        dimension: Dimension,
    ) -> Result<DimensionTable, RollupError> {
        let schema = rows.schema().clone();
        let mut lazy = rows.clone().lazy();

        // Projection: synthesize anything the source is missing.
        let mut missing = Vec::new();
        for key in dimension.key_columns() {
            if !schema.contains(key) {
                warn!(%dimension, column = *key, "grouping column missing, grouping on null");
                missing.push(lit(NULL).cast(DataType::String).alias(*key));
            }
        }
        let aggregations = Aggregation::ledger_metrics();
        for agg in &aggregations {
            if !schema.contains(agg.source) {
                warn!(%dimension, column = agg.source, "metric column missing, summing nulls");
                missing.push(lit(NULL).cast(DataType::Float64).alias(agg.source));
            }
        }
        if !missing.is_empty() {
            lazy = lazy.with_columns(missing);
        }

        let keys: Vec<Expr> = dimension.key_columns().iter().map(|k| col(*k)).collect();
        let sums: Vec<Expr> = aggregations.iter().map(|agg| agg.expr(self.year)).collect();

        let df = lazy.group_by_stable(keys).agg(sums).collect()?;

        info!(
            %dimension,
            source_rows = rows.height(),
            groups = df.height(),
            "aggregated"
        );
        Ok(DimensionTable::new(dimension, df))
    }

    pub fn aggregate_all(
        &self,
        rows: &DataFrame,
    ) -> Result<crate::model::PerDimension<DimensionTable>, RollupError> {
        crate::model::PerDimension::try_from_fn(|dimension| self.aggregate(rows, dimension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::identity;

    fn ledger_rows() -> DataFrame {
        df!(
            identity::COMPANY_CODE => [Some("001"), Some("001"), None, Some("002")],
            identity::CUSTOMER_CODE => [Some("C1"), Some("C1"), Some("C2"), Some("C3")],
            identity::CUSTOMER_NAME => [Some("甲"), Some("甲"), Some("乙"), Some("丙")],
            ledger::QUANTITY => [Some(1.0), Some(2.0), Some(4.0), None],
            ledger::AREA => [Some(0.5), Some(0.25), None, None],
            ledger::REVENUE => [Some(100.6), Some(200.6), Some(50.0), None],
            ledger::GROSS_MARGIN => [Some(10.9), Some(20.9), Some(5.0), None],
        )
        .unwrap()
    }

    #[test]
    fn company_rollup_sums_and_truncates_money() {
        let table = Aggregator::new(2025)
            .aggregate(&ledger_rows(), Dimension::Company)
            .unwrap();
        let df = table.frame();

        assert_eq!(df.height(), 3);
        let codes = df.column(identity::COMPANY_CODE).unwrap().str().unwrap();
        assert_eq!(codes.get(0), Some("001"));
        assert_eq!(codes.get(1), None);

        let revenue = df.column("2025売上").unwrap().i64().unwrap();
        assert_eq!(revenue.get(0), Some(301));
        let margin = df.column("2025粗利").unwrap().i64().unwrap();
        assert_eq!(margin.get(0), Some(31));
        let area = df.column("2025㎡").unwrap().f64().unwrap();
        assert_eq!(area.get(0), Some(0.75));
    }

    #[test]
    fn null_key_forms_its_own_group() {
        let table = Aggregator::new(2025)
            .aggregate(&ledger_rows(), Dimension::Company)
            .unwrap();
        let df = table.frame();
        let qty = df.column("2025売上数").unwrap().f64().unwrap();
        assert_eq!(qty.get(1), Some(4.0));
    }

    #[test]
    fn all_null_metric_sums_to_null() {
        let table = Aggregator::new(2025)
            .aggregate(&ledger_rows(), Dimension::Company)
            .unwrap();
        let df = table.frame();
        let revenue = df.column("2025売上").unwrap().i64().unwrap();
        assert_eq!(revenue.get(2), None);
        let area = df.column("2025㎡").unwrap().f64().unwrap();
        assert_eq!(area.get(1), None);
    }

    #[test]
    fn missing_grouping_columns_are_synthesized() {
        let table = Aggregator::new(2025)
            .aggregate(&ledger_rows(), Dimension::CustomerProduct)
            .unwrap();
        let df = table.frame();
        // office/category/product columns are absent: grouping falls back to customer columns
        assert_eq!(df.height(), 3);
        assert_eq!(df.column(identity::OFFICE_NAME).unwrap().null_count(), 3);
        let names: Vec<&str> = df.get_column_names_str();
        assert_eq!(&names[..6], Dimension::CustomerProduct.key_columns());
    }

    #[test]
    fn totals_match_across_dimensions() {
        let rows = ledger_rows();
        let all = Aggregator::new(2025).aggregate_all(&rows).unwrap();
        for (_, table) in all.iter() {
            let revenue = table.frame().column("2025売上").unwrap().i64().unwrap();
            assert_eq!(revenue.sum(), Some(351));
        }
    }
}
