use std::fmt;

use polars::prelude::*;
use serde::Deserialize;

use crate::schema::{identity, metric, report};

// ── Metric suffixes ─────────────────────────────────────────────────────────

/// The measure a metric column carries; the column name is `{year}{suffix}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricSuffix {
    Quantity,
    Area,
    Revenue,
    GrossMargin,
}

impl MetricSuffix {
    /// Presentation order within one fiscal year.
    pub const ALL: [MetricSuffix; 4] = [
        MetricSuffix::Quantity,
        MetricSuffix::Area,
        MetricSuffix::Revenue,
        MetricSuffix::GrossMargin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quantity => metric::QUANTITY,
            Self::Area => metric::AREA,
            Self::Revenue => metric::REVENUE,
            Self::GrossMargin => metric::GROSS_MARGIN,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|suffix| suffix.as_str() == s)
    }

    /// Sales quantity is only reported for the current fiscal year.
    pub fn current_year_only(&self) -> bool {
        matches!(self, Self::Quantity)
    }

    /// Money is summed as float and truncated to integer.
    pub fn dtype(&self) -> DataType {
        match self {
            Self::Quantity | Self::Area => DataType::Float64,
            Self::Revenue | Self::GrossMargin => DataType::Int64,
        }
    }

    pub fn column_name(&self, year: i32) -> String {
        format!("{year}{}", self.as_str())
    }
}

impl fmt::Display for MetricSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Column descriptors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Identity,
    Metric,
}

/// Typed view of a column name, computed once when a table is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub year: Option<i32>,
    pub suffix: Option<MetricSuffix>,
    pub role: ColumnRole,
}

impl ColumnDescriptor {
    /// A metric column is a four-digit year followed by exactly one known suffix.
    /// Anything else is an identity column.
    pub fn classify(name: &str) -> Self {
        let metric = name
            .get(..4)
            .filter(|year| year.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|year| {
                let suffix = MetricSuffix::parse(&name[4..])?;
                Some((year.parse::<i32>().ok()?, suffix))
            });

        match metric {
            Some((year, suffix)) => Self {
                name: name.to_string(),
                year: Some(year),
                suffix: Some(suffix),
                role: ColumnRole::Metric,
            },
            None => Self {
                name: name.to_string(),
                year: None,
                suffix: None,
                role: ColumnRole::Identity,
            },
        }
    }

    pub fn is_metric(&self) -> bool {
        self.role == ColumnRole::Metric
    }
}

// ── Dimensions ──────────────────────────────────────────────────────────────

/// One of the three reporting granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Company,
    Customer,
    CustomerProduct,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::Company,
        Dimension::Customer,
        Dimension::CustomerProduct,
    ];

    /// Sheet name in the report template, also used in file names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Company => "法人",
            Self::Customer => "得意先",
            Self::CustomerProduct => "得意先（商品）",
        }
    }

    /// Grouping key of the aggregate and join key of the incremental merge.
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Company => &[identity::COMPANY_CODE],
            Self::Customer => &[identity::CUSTOMER_CODE, identity::CUSTOMER_NAME],
            Self::CustomerProduct => &[
                identity::OFFICE_NAME,
                identity::CUSTOMER_CODE,
                identity::CUSTOMER_NAME,
                identity::CATEGORY,
                identity::PRODUCT_CODE,
                identity::PRODUCT_NAME,
            ],
        }
    }

    /// Identity columns of the finished report, in output order.
    pub fn identity_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Company => &[identity::COMPANY_CODE, identity::COMPANY_NAME],
            _ => self.key_columns(),
        }
    }

    /// Key used to collapse rows multiplied by a code backfill.
    pub fn natural_key(&self) -> &'static [&'static str] {
        self.identity_columns()
    }

    /// `(code, name)` pair whose code can be recovered from historical names.
    pub fn code_backfill(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Company => Some((identity::COMPANY_CODE, identity::COMPANY_NAME)),
            Self::Customer => Some((identity::CUSTOMER_CODE, identity::CUSTOMER_NAME)),
            Self::CustomerProduct => None,
        }
    }

    /// Secondary sort keys after current-year revenue.
    pub fn tie_break_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Company => &[identity::COMPANY_CODE],
            Self::Customer => &[identity::CUSTOMER_CODE],
            Self::CustomerProduct => &[
                identity::OFFICE_NAME,
                identity::CUSTOMER_CODE,
                identity::PRODUCT_CODE,
            ],
        }
    }

    pub fn file_name(&self, term: &str) -> String {
        format!("{term}_{}_{}.parquet", report::TITLE, self.label())
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Company => write!(f, "company"),
            Self::Customer => write!(f, "customer"),
            Self::CustomerProduct => write!(f, "customer_product"),
        }
    }
}

/// One value per dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerDimension<T> {
    pub company: T,
    pub customer: T,
    pub customer_product: T,
}

impl<T> PerDimension<T> {
    pub fn try_from_fn<E>(mut f: impl FnMut(Dimension) -> Result<T, E>) -> Result<Self, E> {
        Ok(Self {
            company: f(Dimension::Company)?,
            customer: f(Dimension::Customer)?,
            customer_product: f(Dimension::CustomerProduct)?,
        })
    }

    pub fn from_fn(mut f: impl FnMut(Dimension) -> T) -> Self {
        Self {
            company: f(Dimension::Company),
            customer: f(Dimension::Customer),
            customer_product: f(Dimension::CustomerProduct),
        }
    }

    pub fn get(&self, dimension: Dimension) -> &T {
        match dimension {
            Dimension::Company => &self.company,
            Dimension::Customer => &self.customer,
            Dimension::CustomerProduct => &self.customer_product,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &T)> {
        Dimension::ALL.into_iter().map(move |d| (d, self.get(d)))
    }

    pub fn try_map<U, E>(
        &self,
        mut f: impl FnMut(Dimension, &T) -> Result<U, E>,
    ) -> Result<PerDimension<U>, E> {
        PerDimension::try_from_fn(|d| f(d, self.get(d)))
    }
}

// ── Dimension tables ────────────────────────────────────────────────────────

/// A rollup table for one dimension together with its classified columns.
///
/// Every stage consumes a table by reference and returns a new one.
#[derive(Debug, Clone)]
pub struct DimensionTable {
    dimension: Dimension,
    frame: DataFrame,
    columns: Vec<ColumnDescriptor>,
}

impl DimensionTable {
    pub fn new(dimension: Dimension, frame: DataFrame) -> Self {
        let columns = frame
            .get_column_names_str()
            .iter()
            .map(|name| ColumnDescriptor::classify(name))
            .collect();
        Self {
            dimension,
            frame,
            columns,
        }
    }

    pub fn empty(dimension: Dimension) -> Self {
        Self::new(dimension, DataFrame::empty())
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn descriptor(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.descriptor(name).is_some()
    }

    pub fn metric_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_metric())
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    /// No rows at all - the first-ever run has no history.
    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }
}
