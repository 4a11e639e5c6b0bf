use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use encoding_rs::Encoding;
use serde::Deserialize;

use crate::error::RollupError;
use crate::fiscal::FiscalYearSet;
use crate::model::Dimension;
use crate::schema::{identity, legacy, report};

// ── Top-level config ────────────────────────────────────────────────────────

/// Everything a run needs, passed explicitly to each component.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    #[serde(default)]
    pub run: RunConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub present: PresentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            term: default_term(),
        }
    }
}

fn default_term() -> String {
    report::DEFAULT_TERM.to_string()
}

// ── Paths ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub ledger: PathBuf,
    pub master: PathBuf,
    pub current_dir: PathBuf,
    pub history_dir: PathBuf,
    pub merged_dir: PathBuf,
    pub template: PathBuf,
    pub output: PathBuf,
}

impl PathsConfig {
    fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.ledger,
            &mut self.master,
            &mut self.current_dir,
            &mut self.history_dir,
            &mut self.merged_dir,
            &mut self.template,
            &mut self.output,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

// ── Calendar ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    #[serde(default = "default_rollover_month")]
    pub rollover_month: u32,
    /// Pins the current fiscal year instead of deriving it from the clock.
    #[serde(default)]
    pub current_year: Option<i32>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            start_year: default_start_year(),
            rollover_month: default_rollover_month(),
            current_year: None,
        }
    }
}

fn default_start_year() -> i32 {
    2015
}

fn default_rollover_month() -> u32 {
    4
}

impl CalendarConfig {
    pub fn fiscal_years(&self, today: NaiveDate) -> Result<FiscalYearSet, RollupError> {
        match self.current_year {
            Some(current) => FiscalYearSet::new(self.start_year, current),
            None => FiscalYearSet::from_date(today, self.start_year, self.rollover_month),
        }
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// WHATWG encoding label; `windows-31j` is the cp932 code page.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            delimiter: default_delimiter(),
        }
    }
}

fn default_encoding() -> String {
    "windows-31j".to_string()
}

fn default_delimiter() -> char {
    ','
}

impl LedgerConfig {
    pub fn encoding(&self) -> Result<&'static Encoding, RollupError> {
        Encoding::for_label(self.encoding.as_bytes())
            .ok_or_else(|| RollupError::Config(format!("unknown encoding '{}'", self.encoding)))
    }

    pub fn delimiter_byte(&self) -> Result<u8, RollupError> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                RollupError::Config(format!(
                    "delimiter must be a single ASCII character, got '{}'",
                    self.delimiter
                ))
            })
    }
}

// ── Merge ───────────────────────────────────────────────────────────────────

/// How prior-year columns already present on the current side are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Only fill nulls from history; never overwrite a non-null value.
    #[default]
    Protective,
    /// Always take the historical value for prior years.
    Authoritative,
}

impl std::fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protective => write!(f, "protective"),
            Self::Authoritative => write!(f, "authoritative"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub historical_overwrite_policy: OverwritePolicy,
    #[serde(default = "default_true")]
    pub backfill_codes: bool,
    /// Treat absent historical aggregates as empty (first-ever run).
    #[serde(default)]
    pub allow_missing_history: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            historical_overwrite_policy: OverwritePolicy::default(),
            backfill_codes: true,
            allow_missing_history: false,
        }
    }
}

fn default_true() -> bool {
    true
}

// ── Key reconciliation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyAlias {
    pub dimension: Dimension,
    pub legacy: String,
    pub canonical: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_aliases")]
    pub aliases: Vec<KeyAlias>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            aliases: default_aliases(),
        }
    }
}

fn default_aliases() -> Vec<KeyAlias> {
    let alias = |dimension, legacy: &str, canonical: &str| KeyAlias {
        dimension,
        legacy: legacy.to_string(),
        canonical: canonical.to_string(),
    };
    vec![
        alias(
            Dimension::Customer,
            legacy::TRADING_PARTNER_CODE,
            identity::CUSTOMER_CODE,
        ),
        alias(
            Dimension::Customer,
            legacy::TRADING_PARTNER_NAME,
            identity::CUSTOMER_NAME,
        ),
        alias(
            Dimension::CustomerProduct,
            legacy::CUSTOMER,
            identity::CUSTOMER_NAME,
        ),
    ]
}

// ── Verification thresholds ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_negligible")]
    pub negligible_abs: f64,
    #[serde(default = "default_warning")]
    pub warning_abs: f64,
    #[serde(default = "default_critical")]
    pub critical_abs: f64,
    #[serde(default = "default_stale")]
    pub stale_current_year_abs: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            negligible_abs: default_negligible(),
            warning_abs: default_warning(),
            critical_abs: default_critical(),
            stale_current_year_abs: default_stale(),
        }
    }
}

fn default_negligible() -> f64 {
    1.0
}

fn default_warning() -> f64 {
    100_000.0
}

fn default_critical() -> f64 {
    1_000_000.0
}

fn default_stale() -> f64 {
    1_000.0
}

// ── Presentation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PresentConfig {
    #[serde(default = "default_office_order")]
    pub office_order: Vec<String>,
    #[serde(default)]
    pub drop_inactive_rows: bool,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            office_order: default_office_order(),
            drop_inactive_rows: false,
        }
    }
}

fn default_office_order() -> Vec<String> {
    report::DEFAULT_OFFICE_ORDER
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ── Parse + Validate ────────────────────────────────────────────────────────

impl RollupConfig {
    pub fn from_toml(input: &str) -> Result<Self, RollupError> {
        let config: RollupConfig =
            toml::from_str(input).map_err(|e| RollupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; relative paths are resolved against its directory.
    pub fn load(path: &Path) -> Result<Self, RollupError> {
        if !path.exists() {
            return Err(RollupError::MissingInput(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.paths.resolve_against(base);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RollupError> {
        if !(1..=12).contains(&self.calendar.rollover_month) {
            return Err(RollupError::Config(format!(
                "rollover_month must be 1..=12, got {}",
                self.calendar.rollover_month
            )));
        }

        if let Some(current) = self.calendar.current_year {
            FiscalYearSet::new(self.calendar.start_year, current)?;
        }

        self.ledger.encoding()?;
        self.ledger.delimiter_byte()?;

        let v = &self.verify;
        if !(0.0 <= v.negligible_abs && v.negligible_abs < v.warning_abs && v.warning_abs < v.critical_abs) {
            return Err(RollupError::Config(format!(
                "thresholds must satisfy 0 <= negligible < warning < critical, got {} / {} / {}",
                v.negligible_abs, v.warning_abs, v.critical_abs
            )));
        }

        if self.run.term.trim().is_empty() {
            return Err(RollupError::Config("term must not be empty".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[paths]
ledger = "CSV/実績.csv"
master = "マスタ/法人マスタ.csv"
current_dir = "current"
history_dir = "history"
merged_dir = "merged"
template = "format.xlsx"
output = "out/report.xlsx"
"#;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = RollupConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.run.term, "年度");
        assert_eq!(config.calendar.start_year, 2015);
        assert_eq!(config.calendar.rollover_month, 4);
        assert_eq!(config.merge.historical_overwrite_policy, OverwritePolicy::Protective);
        assert!(config.merge.backfill_codes);
        assert!(!config.merge.allow_missing_history);
        assert_eq!(config.reconcile.aliases.len(), 3);
        assert_eq!(config.present.office_order.first().map(String::as_str), Some("札幌"));
        assert_eq!(config.ledger.encoding().unwrap(), encoding_rs::SHIFT_JIS);
        assert_eq!(config.ledger.delimiter_byte().unwrap(), b',');
    }

    #[test]
    fn parse_authoritative_policy_and_aliases() {
        let input = format!(
            r#"{MINIMAL}
[merge]
historical_overwrite_policy = "authoritative"

[[reconcile.aliases]]
dimension = "company"
legacy = "旧法人コード"
canonical = "法人コード"
"#
        );
        let config = RollupConfig::from_toml(&input).unwrap();
        assert_eq!(
            config.merge.historical_overwrite_policy,
            OverwritePolicy::Authoritative
        );
        assert_eq!(config.reconcile.aliases.len(), 1);
        assert_eq!(config.reconcile.aliases[0].dimension, Dimension::Company);
    }

    #[test]
    fn reject_unknown_policy() {
        let input = format!("{MINIMAL}\n[merge]\nhistorical_overwrite_policy = \"sometimes\"\n");
        assert!(RollupConfig::from_toml(&input).is_err());
    }

    #[test]
    fn reject_bad_rollover_month() {
        let input = format!("{MINIMAL}\n[calendar]\nrollover_month = 13\n");
        let err = RollupConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("rollover_month"));
    }

    #[test]
    fn reject_unknown_encoding() {
        let input = format!("{MINIMAL}\n[ledger]\nencoding = \"cp-nonsense\"\n");
        let err = RollupConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("cp-nonsense"));
    }

    #[test]
    fn reject_unordered_thresholds() {
        let input = format!("{MINIMAL}\n[verify]\nwarning_abs = 5000000.0\n");
        assert!(RollupConfig::from_toml(&input).is_err());
    }

    #[test]
    fn pinned_current_year_overrides_clock() {
        let input = format!("{MINIMAL}\n[calendar]\nstart_year = 2020\ncurrent_year = 2023\n");
        let config = RollupConfig::from_toml(&input).unwrap();
        let today = NaiveDate::from_ymd_opt(2030, 6, 1).unwrap();
        let years = config.calendar.fiscal_years(today).unwrap();
        assert_eq!(years.current(), 2023);
        assert_eq!(years.years().collect::<Vec<_>>(), vec![2023, 2022, 2021, 2020]);
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollup.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = RollupConfig::load(&path).unwrap();
        assert_eq!(config.paths.current_dir, dir.path().join("current"));
        assert_eq!(config.paths.output, dir.path().join("out/report.xlsx"));
    }
}
