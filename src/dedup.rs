use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::error::RollupError;
use crate::merge::consolidate_duplicate_keys;
use crate::model::{Dimension, DimensionTable};
use crate::schema::merge::{BACKFILL_CODE, LOOKUP_NAME, MAPPING_COUNT, MAPPING_RANK, ORIGIN_ROW};

/// Result of a code backfill, still carrying the origin row index the
/// [`Deduplicator`] needs.
#[derive(Debug, Clone)]
pub struct Backfilled {
    pub dimension: Dimension,
    pub frame: DataFrame,
    pub rows_before: usize,
    pub filled: usize,
    pub ambiguous_names: usize,
}

/// Recovers null codes from the historical name→code mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeBackfill;

impl CodeBackfill {
    pub fn apply(
        &self,
        table: &DimensionTable,
        historical: &DimensionTable,
    ) -> Result<Backfilled, RollupError> {
        let dimension = table.dimension();
        let unchanged = |frame: DataFrame| Backfilled {
            dimension,
            rows_before: frame.height(),
            frame,
            filled: 0,
            ambiguous_names: 0,
        };

        let Some((code, name)) = dimension.code_backfill() else {
            report_null_identities(table);
            return Ok(unchanged(table.frame().clone()));
        };
        if !table.has_column(code) || !table.has_column(name) {
            warn!(%dimension, code, name, "code or name column missing, backfill skipped");
            return Ok(unchanged(table.frame().clone()));
        }
        if !historical.has_column(code) || !historical.has_column(name) {
            debug!(%dimension, "history carries no name→code mapping");
            return Ok(unchanged(table.frame().clone()));
        }

        let candidates = table
            .frame()
            .clone()
            .lazy()
            .filter(col(code).is_null().and(col(name).is_not_null()))
            .collect()?
            .height();
        if candidates == 0 {
            return Ok(unchanged(table.frame().clone()));
        }

        let mapping = historical
            .frame()
            .clone()
            .lazy()
            .select([
                col(code).cast(DataType::String),
                col(name).cast(DataType::String),
            ])
            .filter(col(code).is_not_null().and(col(name).is_not_null()))
            .group_by_stable([col(name), col(code)])
            .agg([len().alias(MAPPING_COUNT)])
            .select([col(name).alias(LOOKUP_NAME), col(code).alias(BACKFILL_CODE)])
            .with_row_index(MAPPING_RANK, None)
            .collect()?;

        let ambiguous_names = mapping
            .clone()
            .lazy()
            .group_by([col(LOOKUP_NAME)])
            .agg([len().alias(MAPPING_COUNT)])
            .filter(col(MAPPING_COUNT).gt(lit(1)))
            .collect()?
            .height();
        if ambiguous_names > 0 {
            warn!(%dimension, ambiguous_names, "names mapping to several codes, first-seen code wins");
        }

        let rows_before = table.height();
        let joined = table
            .frame()
            .clone()
            .lazy()
            .with_row_index(ORIGIN_ROW, None)
            .with_column(
                when(col(code).is_null())
                    .then(col(name).cast(DataType::String))
                    .otherwise(lit(NULL).cast(DataType::String))
                    .alias(LOOKUP_NAME),
            )
            .join(
                mapping.lazy(),
                [col(LOOKUP_NAME)],
                [col(LOOKUP_NAME)],
                JoinArgs::new(JoinType::Left),
            )
            .sort_by_exprs(
                [col(ORIGIN_ROW), col(MAPPING_RANK)],
                SortMultipleOptions::default()
                    .with_nulls_last(true)
                    .with_maintain_order(true),
            )
            .collect()?;
        let filled = joined.column(BACKFILL_CODE)?.len() - joined.column(BACKFILL_CODE)?.null_count();

        let mut projection: Vec<Expr> = vec![col(ORIGIN_ROW)];
        for column in table.columns() {
            if column.name == code {
                projection.push(
                    when(col(code).is_null())
                        .then(col(BACKFILL_CODE))
                        .otherwise(col(code).cast(DataType::String))
                        .alias(code),
                );
            } else {
                projection.push(col(column.name.as_str()));
            }
        }
        let frame = joined.lazy().select(projection).collect()?;

        info!(
            %dimension,
            candidates,
            filled,
            rows_before,
            rows_after = frame.height(),
            "codes backfilled from history"
        );
        Ok(Backfilled {
            dimension,
            frame,
            rows_before,
            filled,
            ambiguous_names,
        })
    }
}

fn report_null_identities(table: &DimensionTable) {
    let dimension = table.dimension();
    for name in dimension.identity_columns() {
        if let Ok(column) = table.frame().column(name) {
            let nulls = column.null_count();
            if nulls > 0 {
                info!(%dimension, column = *name, nulls, "null identity values");
            }
        }
    }
}

/// Repairs row multiplication left behind by a code backfill.
///
/// This is a repair, not a guarantee: a name matching several historical
/// codes multiplies rows, and the first match is kept. Uniqueness of the
/// name→code mapping upstream would make it unnecessary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator;

impl Deduplicator {
    pub fn repair(&self, backfilled: Backfilled) -> Result<DimensionTable, RollupError> {
        let Backfilled {
            dimension,
            frame,
            rows_before,
            ..
        } = backfilled;

        let has_origin = frame.schema().contains(ORIGIN_ROW);
        let names: Vec<String> = frame
            .get_column_names_str()
            .iter()
            .filter(|c| **c != ORIGIN_ROW)
            .map(|c| c.to_string())
            .collect();

        let mut df = frame;
        if df.height() > rows_before {
            warn!(
                %dimension,
                rows_before,
                rows_after = df.height(),
                "row count grew during backfill, deduplicating"
            );
            if has_origin {
                let firsts: Vec<Expr> = names
                    .iter()
                    .map(|c| col(c.as_str()).first())
                    .collect();
                df = df
                    .lazy()
                    .group_by_stable([col(ORIGIN_ROW)])
                    .agg(firsts)
                    .collect()?;
            }
        }

        let projection: Vec<Expr> = names.iter().map(|c| col(c.as_str())).collect();
        df = df.lazy().select(projection).collect()?;

        let key: Vec<&str> = dimension
            .natural_key()
            .iter()
            .copied()
            .filter(|k| names.iter().any(|n| n == k))
            .collect();
        if !key.is_empty() {
            df = consolidate_duplicate_keys(dimension, df, &key)?;
        }

        debug!(%dimension, rows = df.height(), "deduplicated");
        Ok(DimensionTable::new(dimension, df))
    }
}
