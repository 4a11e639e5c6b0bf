//! Yearly sales-ranking rollup: aggregate a ledger per company, customer and
//! customer+product, merge with the history carried forward from earlier
//! runs, verify totals and write the report workbook.

pub mod aggregation;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fiscal;
pub mod ledger;
pub mod master;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod present;
pub mod reconcile;
pub mod schema;
pub mod store;
pub mod verify;
pub mod workbook;

pub use aggregation::Aggregator;
pub use config::{OverwritePolicy, RollupConfig};
pub use dedup::{CodeBackfill, Deduplicator};
pub use error::RollupError;
pub use fiscal::FiscalYearSet;
pub use merge::IncrementalMerger;
pub use model::{Dimension, DimensionTable, MetricSuffix, PerDimension};
pub use pipeline::{RollupPipeline, RunOutcome};
pub use present::Presenter;
pub use reconcile::KeyReconciler;
pub use verify::{IntegrityVerifier, Severity, TotalsSnapshot, VerificationReport};
