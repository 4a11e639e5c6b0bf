use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RollupError {
    #[error("Missing input file: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Sheet not found in template: {0}")]
    MissingSheet(String),

    #[error("Config: {0}")]
    Config(String),

    #[error("Encoding: {0}")]
    Encoding(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),

    #[error("Workbook: {0}")]
    Workbook(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rust_xlsxwriter::XlsxError> for RollupError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        RollupError::Workbook(err.to_string())
    }
}

impl From<calamine::Error> for RollupError {
    fn from(err: calamine::Error) -> Self {
        RollupError::Workbook(err.to_string())
    }
}
