use std::path::Path;

use polars::prelude::*;
use tracing::{info, warn};

use crate::error::RollupError;
use crate::ledger::LedgerReader;
use crate::model::{Dimension, DimensionTable};
use crate::schema::master::{COMPANY_CODE, COMPANY_NAME};
use crate::schema::merge::{MAPPING_COUNT, MASTER_NAME};

/// Company code → display name reference data.
#[derive(Debug, Clone)]
pub struct CompanyMaster {
    names: Option<DataFrame>,
}

impl CompanyMaster {
    /// Missing file is fatal; missing columns only disable the join.
    pub fn load(reader: &LedgerReader, path: &Path) -> Result<Self, RollupError> {
        let raw = reader.read_text_table(path)?;
        Self::from_frame(raw)
    }

    pub fn from_frame(raw: DataFrame) -> Result<Self, RollupError> {
        let schema = raw.schema().clone();
        for column in [COMPANY_CODE, COMPANY_NAME] {
            if !schema.contains(column) {
                warn!(column, "master column missing, company names will not be joined");
                return Ok(Self { names: None });
            }
        }

        let grouped = raw
            .lazy()
            .select([
                col(COMPANY_CODE).cast(DataType::String),
                col(COMPANY_NAME).cast(DataType::String),
            ])
            .filter(col(COMPANY_CODE).is_not_null())
            .group_by_stable([col(COMPANY_CODE)])
            .agg([
                col(COMPANY_NAME).drop_nulls().first().alias(MASTER_NAME),
                col(COMPANY_NAME).drop_nulls().n_unique().alias(MAPPING_COUNT),
            ])
            .collect()?;

        let ambiguous = grouped
            .clone()
            .lazy()
            .filter(col(MAPPING_COUNT).gt(lit(1)))
            .collect()?
            .height();
        if ambiguous > 0 {
            warn!(ambiguous, "master codes with several names, first-seen name kept");
        }

        let names = grouped
            .lazy()
            .select([col(COMPANY_CODE), col(MASTER_NAME)])
            .collect()?;
        info!(codes = names.height(), "company master loaded");
        Ok(Self { names: Some(names) })
    }

    /// Left-join names onto the company table; an existing name wins.
    pub fn apply(&self, table: &DimensionTable) -> Result<DimensionTable, RollupError> {
        let dimension = table.dimension();
        let Some(names) = &self.names else {
            return Ok(table.clone());
        };
        if dimension != Dimension::Company || !table.has_column(COMPANY_CODE) {
            return Ok(table.clone());
        }

        let name = if table.has_column(COMPANY_NAME) {
            when(col(COMPANY_NAME).is_null())
                .then(col(MASTER_NAME))
                .otherwise(col(COMPANY_NAME).cast(DataType::String))
        } else {
            col(MASTER_NAME)
        };

        let mut projection = vec![col(COMPANY_CODE), name.alias(COMPANY_NAME)];
        projection.extend(
            table
                .columns()
                .iter()
                .filter(|c| c.name != COMPANY_CODE && c.name != COMPANY_NAME)
                .map(|c| col(c.name.as_str())),
        );

        let df = table
            .frame()
            .clone()
            .lazy()
            .with_column(col(COMPANY_CODE).cast(DataType::String))
            .join(
                names.clone().lazy(),
                [col(COMPANY_CODE)],
                [col(COMPANY_CODE)],
                JoinArgs::new(JoinType::Left),
            )
            .select(projection)
            .collect()?;

        let unnamed = df.column(COMPANY_NAME)?.null_count();
        if unnamed > 0 {
            warn!(%dimension, unnamed, "companies without a display name");
        }
        Ok(DimensionTable::new(dimension, df))
    }
}
