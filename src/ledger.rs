use std::io::Cursor;
use std::path::Path;

use encoding_rs::Encoding;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::RollupError;
use crate::schema::ledger;

/// Reads delimited text exports in a legacy encoding.
///
/// Every column is loaded as text so codes keep their leading zeros; metric
/// columns are parsed to Float64 afterwards.
#[derive(Debug, Clone, Copy)]
pub struct LedgerReader {
    encoding: &'static Encoding,
    delimiter: u8,
}

impl LedgerReader {
    pub fn new(encoding: &'static Encoding, delimiter: u8) -> Self {
        Self {
            encoding,
            delimiter,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Result<Self, RollupError> {
        Ok(Self::new(config.encoding()?, config.delimiter_byte()?))
    }

    /// Load the sales ledger with the fixed export schema.
    ///
    /// Absent ledger columns are synthesized as null so every downstream
    /// projection finds the columns it expects.
    pub fn read_ledger(&self, path: &Path) -> Result<DataFrame, RollupError> {
        let raw = self.read_text_table(path)?;

        let mut lazy = raw.lazy();
        let schema = lazy.collect_schema()?;

        let mut synthesized = Vec::new();
        for name in ledger::TEXT {
            if !schema.contains(name) {
                warn!(column = name, "ledger column missing, filling with nulls");
                synthesized.push(lit(NULL).cast(DataType::String).alias(name));
            }
        }
        for name in ledger::METRICS {
            if schema.contains(name) {
                synthesized.push(
                    col(name)
                        .str()
                        .strip_chars(lit(" \t\r\n"))
                        .cast(DataType::Float64),
                );
            } else {
                warn!(column = name, "ledger metric missing, filling with nulls");
                synthesized.push(lit(NULL).cast(DataType::Float64).alias(name));
            }
        }
        lazy = lazy.with_columns(synthesized);

        let projection: Vec<Expr> = ledger::TEXT
            .iter()
            .chain(ledger::METRICS.iter())
            .map(|name| col(*name))
            .collect();
        let df = lazy.select(projection).collect()?;

        info!(path = %path.display(), rows = df.height(), "ledger loaded");
        Ok(df)
    }

    /// Read any delimited file with all columns as String dtype.
    /// Trims whitespace from column names.
    pub fn read_text_table(&self, path: &Path) -> Result<DataFrame, RollupError> {
        if !path.exists() {
            return Err(RollupError::MissingInput(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        let text = self.decode(&bytes, path)?;

        let delimiter = self.delimiter;
        let mut df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0)) // all columns as String
            .map_parse_options(|opts| opts.with_separator(delimiter))
            .into_reader_with_file_handle(Cursor::new(text.into_bytes()))
            .finish()?;

        let trimmed: Vec<String> = df
            .get_column_names_str()
            .iter()
            .map(|c| c.trim().to_string())
            .collect();
        df.set_column_names(trimmed.as_slice())?;

        debug!(
            path = %path.display(),
            rows = df.height(),
            columns = df.width(),
            "delimited file read"
        );
        Ok(df)
    }

    fn decode(&self, bytes: &[u8], path: &Path) -> Result<String, RollupError> {
        let (text, used, had_errors) = self.encoding.decode(bytes);
        if had_errors {
            if text.chars().all(|c| c == char::REPLACEMENT_CHARACTER || c.is_whitespace()) {
                return Err(RollupError::Encoding(format!(
                    "{} is not readable as {}",
                    path.display(),
                    self.encoding.name()
                )));
            }
            warn!(
                path = %path.display(),
                encoding = used.name(),
                "undecodable bytes replaced while reading"
            );
        }
        Ok(text.into_owned())
    }
}
