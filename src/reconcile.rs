use polars::prelude::*;
use tracing::{info, warn};

use crate::config::{KeyAlias, ReconcileConfig};
use crate::error::RollupError;
use crate::model::{Dimension, DimensionTable};

/// Renames legacy key columns in historical tables to their canonical names.
///
/// Must run before the merge suffixes historical columns, since join keys are
/// recognised by canonical name.
#[derive(Debug, Clone, Default)]
pub struct KeyReconciler {
    aliases: Vec<KeyAlias>,
}

impl KeyReconciler {
    pub fn new(aliases: Vec<KeyAlias>) -> Self {
        Self { aliases }
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(config.aliases.clone())
    }

    pub fn aliases_for(&self, dimension: Dimension) -> impl Iterator<Item = &KeyAlias> {
        self.aliases.iter().filter(move |a| a.dimension == dimension)
    }

    pub fn reconcile(&self, table: &DimensionTable) -> Result<DimensionTable, RollupError> {
        let dimension = table.dimension();
        let mut renames_from = Vec::new();
        let mut renames_to = Vec::new();
        let mut folded = Vec::new();

        for alias in self.aliases_for(dimension) {
            if !table.has_column(&alias.legacy) {
                continue;
            }
            if table.has_column(&alias.canonical) {
                // Both vintages in one file: canonical wins, legacy only fills gaps.
                warn!(
                    %dimension,
                    legacy = %alias.legacy,
                    canonical = %alias.canonical,
                    "legacy and canonical key both present, folding legacy into canonical"
                );
                folded.push(alias);
            } else {
                renames_from.push(alias.legacy.as_str());
                renames_to.push(alias.canonical.as_str());
            }
        }

        if renames_from.is_empty() && folded.is_empty() {
            return Ok(table.clone());
        }

        let mut lazy = table.frame().clone().lazy();
        if !folded.is_empty() {
            let fills: Vec<Expr> = folded
                .iter()
                .map(|alias| {
                    when(col(alias.canonical.as_str()).is_null())
                        .then(col(alias.legacy.as_str()).cast(DataType::String))
                        .otherwise(col(alias.canonical.as_str()).cast(DataType::String))
                        .alias(alias.canonical.as_str())
                })
                .collect();
            lazy = lazy.with_columns(fills);
        }
        if !renames_from.is_empty() {
            info!(%dimension, renamed = ?renames_from, to = ?renames_to, "legacy key columns renamed");
            lazy = lazy.rename(renames_from.iter().copied(), renames_to.iter().copied(), true);
        }

        let kept: Vec<Expr> = table
            .columns()
            .iter()
            .filter(|c| !folded.iter().any(|alias| alias.legacy == c.name))
            .map(|c| {
                let name = renames_from
                    .iter()
                    .position(|from| *from == c.name)
                    .map(|i| renames_to[i])
                    .unwrap_or(c.name.as_str());
                col(name)
            })
            .collect();

        let df = lazy.select(kept).collect()?;
        Ok(DimensionTable::new(dimension, df))
    }

    pub fn reconcile_all(
        &self,
        tables: &crate::model::PerDimension<DimensionTable>,
    ) -> Result<crate::model::PerDimension<DimensionTable>, RollupError> {
        tables.try_map(|_, table| self.reconcile(table))
    }
}
