use chrono::{Local, NaiveDate};
use tracing::{info, info_span};

use crate::aggregation::Aggregator;
use crate::config::RollupConfig;
use crate::dedup::{CodeBackfill, Deduplicator};
use crate::error::RollupError;
use crate::fiscal::FiscalYearSet;
use crate::ledger::LedgerReader;
use crate::master::CompanyMaster;
use crate::merge::IncrementalMerger;
use crate::model::{DimensionTable, PerDimension};
use crate::present::Presenter;
use crate::reconcile::KeyReconciler;
use crate::store::AggregateStore;
use crate::verify::{IntegrityVerifier, VerificationReport};
use crate::workbook::ReportTemplate;

/// Merged tables plus the verification of how they were produced.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub tables: PerDimension<DimensionTable>,
    pub report: VerificationReport,
}

/// What a step reports back to the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub report: Option<VerificationReport>,
}

impl RunOutcome {
    /// Steps without verification always pass.
    pub fn passed(&self) -> bool {
        self.report.as_ref().map_or(true, VerificationReport::passed)
    }
}

/// The yearly batch: aggregate, merge with history, export.
#[derive(Debug, Clone)]
pub struct RollupPipeline {
    config: RollupConfig,
    years: FiscalYearSet,
}

impl RollupPipeline {
    pub fn new(config: RollupConfig, today: NaiveDate) -> Result<Self, RollupError> {
        let years = config.calendar.fiscal_years(today)?;
        info!(
            current = years.current(),
            start = years.start(),
            term = %config.run.term,
            "fiscal years resolved"
        );
        Ok(Self { config, years })
    }

    pub fn from_clock(config: RollupConfig) -> Result<Self, RollupError> {
        Self::new(config, Local::now().date_naive())
    }

    pub fn years(&self) -> FiscalYearSet {
        self.years
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    fn store(&self, dir: &std::path::Path) -> AggregateStore {
        AggregateStore::new(dir, self.config.run.term.as_str())
    }

    /// Ledger → per-dimension aggregates for the current fiscal year.
    pub fn aggregate(&self) -> Result<PerDimension<DimensionTable>, RollupError> {
        let _span = info_span!("aggregate").entered();
        let reader = LedgerReader::from_config(&self.config.ledger)?;
        let rows = reader.read_ledger(&self.config.paths.ledger)?;

        let tables = Aggregator::new(self.years.current()).aggregate_all(&rows)?;
        self.store(&self.config.paths.current_dir).write_all(&tables)?;
        Ok(tables)
    }

    /// Current aggregates + history → merged tables, verified and persisted
    /// as next run's history.
    pub fn merge(&self) -> Result<MergeOutcome, RollupError> {
        let _span = info_span!("merge").entered();
        let paths = &self.config.paths;

        let current = self.store(&paths.current_dir).read_all_required()?;
        let historical = self
            .store(&paths.history_dir)
            .read_history(self.config.merge.allow_missing_history)?;
        let reader = LedgerReader::from_config(&self.config.ledger)?;
        let master = CompanyMaster::load(&reader, &paths.master)?;

        let historical = KeyReconciler::from_config(&self.config.reconcile).reconcile_all(&historical)?;

        let merger = IncrementalMerger::from_config(self.years, &self.config.merge);
        let merged = current.try_map(|dimension, table| merger.merge(table, historical.get(dimension)))?;

        let named = merged.try_map(|_, table| master.apply(table))?;
        let deduplicated = if self.config.merge.backfill_codes {
            named.try_map(|dimension, table| {
                let backfilled = CodeBackfill.apply(table, historical.get(dimension))?;
                Deduplicator.repair(backfilled)
            })?
        } else {
            named
        };

        let verifier = IntegrityVerifier::new(self.years, self.config.verify.clone());
        let report = verifier.verify(&current, &historical, &merged, &deduplicated)?;

        self.store(&paths.merged_dir).write_all(&deduplicated)?;
        Ok(MergeOutcome {
            tables: deduplicated,
            report,
        })
    }

    /// Merged tables from disk → workbook.
    pub fn export(&self) -> Result<(), RollupError> {
        let _span = info_span!("export").entered();
        let template = ReportTemplate::open(&self.config.paths.template)?;
        let merged = self.store(&self.config.paths.merged_dir).read_all_required()?;
        self.render(&template, &merged)
    }

    fn render(
        &self,
        template: &ReportTemplate,
        tables: &PerDimension<DimensionTable>,
    ) -> Result<(), RollupError> {
        let presented = Presenter::new(self.years, &self.config.present).present_all(tables)?;
        template.render(&presented, &self.config.paths.output)
    }

    /// All steps. The template is checked before any work is done.
    pub fn run(&self) -> Result<RunOutcome, RollupError> {
        let template = ReportTemplate::open(&self.config.paths.template)?;
        template.require_dimension_sheets()?;

        self.aggregate()?;
        let outcome = self.merge()?;
        {
            let _span = info_span!("export").entered();
            self.render(&template, &outcome.tables)?;
        }
        Ok(RunOutcome {
            report: Some(outcome.report),
        })
    }
}
