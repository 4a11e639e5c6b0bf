use std::fs::{self, File};
use std::path::PathBuf;

use polars::prelude::*;
use tracing::{info, warn};

use crate::error::RollupError;
use crate::model::{Dimension, DimensionTable, PerDimension};

/// One parquet file per dimension under a directory.
#[derive(Debug, Clone)]
pub struct AggregateStore {
    dir: PathBuf,
    term: String,
}

impl AggregateStore {
    pub fn new(dir: impl Into<PathBuf>, term: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            term: term.into(),
        }
    }

    pub fn path(&self, dimension: Dimension) -> PathBuf {
        self.dir.join(dimension.file_name(&self.term))
    }

    pub fn write(&self, table: &DimensionTable) -> Result<PathBuf, RollupError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(table.dimension());
        let mut df = table.frame().clone();
        let mut file = File::create(&path)?;
        ParquetWriter::new(&mut file).finish(&mut df)?;
        info!(dimension = %table.dimension(), rows = df.height(), path = %path.display(), "aggregate written");
        Ok(path)
    }

    pub fn write_all(&self, tables: &PerDimension<DimensionTable>) -> Result<(), RollupError> {
        for (_, table) in tables.iter() {
            self.write(table)?;
        }
        Ok(())
    }

    /// `None` when the file does not exist.
    pub fn read(&self, dimension: Dimension) -> Result<Option<DimensionTable>, RollupError> {
        let path = self.path(dimension);
        if !path.exists() {
            return Ok(None);
        }
        let df = ParquetReader::new(File::open(&path)?).finish()?;
        info!(%dimension, rows = df.height(), path = %path.display(), "aggregate loaded");
        Ok(Some(DimensionTable::new(dimension, df)))
    }

    pub fn read_required(&self, dimension: Dimension) -> Result<DimensionTable, RollupError> {
        self.read(dimension)?
            .ok_or_else(|| RollupError::MissingInput(self.path(dimension)))
    }

    pub fn read_all_required(&self) -> Result<PerDimension<DimensionTable>, RollupError> {
        PerDimension::try_from_fn(|dimension| self.read_required(dimension))
    }

    /// History may be absent only on the first-ever run.
    pub fn read_history(&self, allow_missing: bool) -> Result<PerDimension<DimensionTable>, RollupError> {
        PerDimension::try_from_fn(|dimension| match self.read(dimension)? {
            Some(table) => Ok(table),
            None if allow_missing => {
                warn!(%dimension, path = %self.path(dimension).display(), "no history, treating as first run");
                Ok(DimensionTable::empty(dimension))
            }
            None => Err(RollupError::MissingInput(self.path(dimension))),
        })
    }
}
