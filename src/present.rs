use polars::prelude::*;
use tracing::{info, warn};

use crate::config::PresentConfig;
use crate::error::RollupError;
use crate::fiscal::FiscalYearSet;
use crate::model::{Dimension, DimensionTable, MetricSuffix};
use crate::schema::identity;
use crate::schema::merge::OFFICE_RANK;

/// Final shaping of a merged table before it is handed to the workbook.
#[derive(Debug, Clone)]
pub struct Presenter {
    years: FiscalYearSet,
    office_order: Vec<String>,
    drop_inactive_rows: bool,
}

impl Presenter {
    pub fn new(years: FiscalYearSet, config: &PresentConfig) -> Self {
        Self {
            years,
            office_order: config.office_order.clone(),
            drop_inactive_rows: config.drop_inactive_rows,
        }
    }

    /// Output column order: identity columns, then metrics by descending year.
    pub fn column_order(&self, dimension: Dimension) -> Vec<String> {
        dimension
            .identity_columns()
            .iter()
            .map(|c| c.to_string())
            .chain(self.years.expected_metrics().iter().map(|m| m.name()))
            .collect()
    }

    pub fn present(&self, table: &DimensionTable) -> Result<DimensionTable, RollupError> {
        let dimension = table.dimension();

        let mut projection = Vec::new();
        for name in dimension.identity_columns() {
            let column = if table.has_column(name) {
                col(*name).cast(DataType::String)
            } else {
                warn!(%dimension, column = *name, "identity column missing, filling with nulls");
                lit(NULL).cast(DataType::String).alias(*name)
            };
            projection.push(column);
        }
        let metrics = self.years.expected_metrics();
        for metric in &metrics {
            let name = metric.name();
            let dtype = metric.suffix.dtype();
            let column = if table.has_column(&name) {
                col(name.as_str()).cast(dtype.clone())
            } else {
                lit(NULL).cast(dtype.clone())
            };
            projection.push(column.fill_null(lit(0)).cast(dtype).alias(name.as_str()));
        }

        let dropped: Vec<&str> = table
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .filter(|name| {
                !dimension.identity_columns().contains(name)
                    && !metrics.iter().any(|m| m.name() == *name)
            })
            .collect();
        if !dropped.is_empty() {
            info!(%dimension, ?dropped, "columns outside the report layout dropped");
        }

        let mut lazy = table.frame().clone().lazy().select(projection);

        if self.drop_inactive_rows {
            let active = metrics
                .iter()
                .map(|m| col(m.name().as_str()).neq(lit(0)))
                .reduce(|a, b| a.or(b));
            if let Some(active) = active {
                lazy = lazy.filter(active);
            }
        }

        let rows_in = table.height();
        let df = self.sort(dimension, lazy).collect()?;
        if df.height() < rows_in {
            info!(%dimension, removed = rows_in - df.height(), "inactive rows removed");
        }
        Ok(DimensionTable::new(dimension, df))
    }

    fn sort(&self, dimension: Dimension, lazy: LazyFrame) -> LazyFrame {
        let revenue = MetricSuffix::Revenue.column_name(self.years.current());
        let mut by = vec![col(revenue.as_str())];
        let mut descending = vec![true];

        let ranked = dimension == Dimension::CustomerProduct;
        if ranked {
            by.push(col(OFFICE_RANK));
            descending.push(false);
        }
        for name in dimension.tie_break_columns() {
            by.push(col(*name));
            descending.push(false);
        }

        let options = SortMultipleOptions::default()
            .with_order_descending_multi(descending)
            .with_nulls_last(true)
            .with_maintain_order(true);

        if !ranked {
            return lazy.sort_by_exprs(by, options);
        }
        let layout: Vec<Expr> = self
            .column_order(dimension)
            .iter()
            .map(|c| col(c.as_str()))
            .collect();
        lazy.with_column(self.office_rank())
            .sort_by_exprs(by, options)
            .select(layout)
    }

    /// Position in the configured office list; unknown offices sort last.
    fn office_rank(&self) -> Expr {
        let mut rank = lit(self.office_order.len() as u32);
        for (i, office) in self.office_order.iter().enumerate().rev() {
            rank = when(col(identity::OFFICE_NAME).eq(lit(office.as_str())))
                .then(lit(i as u32))
                .otherwise(rank);
        }
        rank.alias(OFFICE_RANK)
    }

    pub fn present_all(
        &self,
        tables: &crate::model::PerDimension<DimensionTable>,
    ) -> Result<crate::model::PerDimension<DimensionTable>, RollupError> {
        tables.try_map(|_, table| self.present(table))
    }
}
