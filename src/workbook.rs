use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use polars::prelude::*;
use rust_xlsxwriter::{Workbook as XlsxWorkbook, Worksheet};
use tracing::{debug, info};

use crate::error::RollupError;
use crate::model::{Dimension, DimensionTable, PerDimension};

/// Rows an xlsx worksheet can hold.
const MAX_ROWS: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq)]
enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone)]
struct TemplateSheet {
    name: String,
    cells: Vec<(u32, u16, CellValue)>,
}

/// Sheet layout and static content of the report template.
#[derive(Debug, Clone)]
pub struct ReportTemplate {
    sheets: Vec<TemplateSheet>,
}

impl ReportTemplate {
    pub fn open(path: &Path) -> Result<Self, RollupError> {
        if !path.exists() {
            return Err(RollupError::MissingInput(path.to_path_buf()));
        }
        let mut workbook = open_workbook_auto(path)?;
        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();

        let mut sheets = Vec::with_capacity(sheet_names.len());
        for name in sheet_names {
            let range = workbook.worksheet_range(&name)?;
            let (row0, col0) = range.start().unwrap_or((0, 0));
            let mut cells = Vec::new();
            for (row, col, cell) in range.cells() {
                let value = match cell {
                    Data::Empty => continue,
                    Data::String(s) => CellValue::Text(s.clone()),
                    Data::Float(n) => CellValue::Number(*n),
                    Data::Int(n) => CellValue::Number(*n as f64),
                    Data::Bool(b) => CellValue::Bool(*b),
                    Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
                    other => CellValue::Text(other.to_string()),
                };
                let col = u16::try_from(col0 as usize + col).map_err(|_| {
                    RollupError::Workbook(format!("column out of range in sheet '{name}'"))
                })?;
                cells.push((row0 + row as u32, col, value));
            }
            debug!(sheet = %name, cells = cells.len(), "template sheet read");
            sheets.push(TemplateSheet { name, cells });
        }

        Ok(Self { sheets })
    }

    pub fn sheet_names(&self) -> impl Iterator<Item = &str> {
        self.sheets.iter().map(|s| s.name.as_str())
    }

    /// Every dimension needs its own sheet.
    pub fn require_dimension_sheets(&self) -> Result<(), RollupError> {
        for dimension in Dimension::ALL {
            if !self.sheet_names().any(|name| name == dimension.label()) {
                return Err(RollupError::MissingSheet(dimension.label().to_string()));
            }
        }
        Ok(())
    }

    /// Writes a new workbook in template sheet order: dimension sheets are
    /// replaced by their table, other sheets keep their values.
    pub fn render(
        &self,
        tables: &PerDimension<DimensionTable>,
        output: &Path,
    ) -> Result<(), RollupError> {
        self.require_dimension_sheets()?;

        let mut workbook = XlsxWorkbook::new();
        for sheet in &self.sheets {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(&sheet.name)?;

            match Dimension::ALL.into_iter().find(|d| d.label() == sheet.name) {
                Some(dimension) => write_table(worksheet, tables.get(dimension))?,
                None => {
                    for (row, col, value) in &sheet.cells {
                        match value {
                            CellValue::Text(s) => worksheet.write_string(*row, *col, s)?,
                            CellValue::Number(n) => worksheet.write_number(*row, *col, *n)?,
                            CellValue::Bool(b) => worksheet.write_boolean(*row, *col, *b)?,
                        };
                    }
                }
            }
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        workbook.save(output)?;
        info!(path = %output.display(), "report written");
        Ok(())
    }
}

/// Header row at A1, values below. Nulls stay blank.
fn write_table(worksheet: &mut Worksheet, table: &DimensionTable) -> Result<(), RollupError> {
    let df = table.frame();
    if df.height() + 1 > MAX_ROWS {
        return Err(RollupError::InvalidData(format!(
            "{} rows do not fit in sheet '{}'",
            df.height(),
            table.dimension().label()
        )));
    }

    for (i, column) in df.get_columns().iter().enumerate() {
        let col = u16::try_from(i)
            .map_err(|_| RollupError::InvalidData(format!("too many columns: {}", df.width())))?;
        worksheet.write_string(0, col, column.name().as_str())?;

        match column.dtype() {
            DataType::String => {
                for (r, value) in column.str()?.into_iter().enumerate() {
                    if let Some(s) = value {
                        worksheet.write_string(r as u32 + 1, col, s)?;
                    }
                }
            }
            DataType::Int64 => {
                for (r, value) in column.i64()?.into_iter().enumerate() {
                    if let Some(n) = value {
                        worksheet.write_number(r as u32 + 1, col, n as f64)?;
                    }
                }
            }
            dtype if dtype.is_numeric() => {
                let floats = column.cast(&DataType::Float64)?;
                for (r, value) in floats.f64()?.into_iter().enumerate() {
                    if let Some(n) = value {
                        worksheet.write_number(r as u32 + 1, col, n)?;
                    }
                }
            }
            _ => {
                let text = column.cast(&DataType::String)?;
                for (r, value) in text.str()?.into_iter().enumerate() {
                    if let Some(s) = value {
                        worksheet.write_string(r as u32 + 1, col, s)?;
                    }
                }
            }
        }
    }

    info!(
        dimension = %table.dimension(),
        rows = df.height(),
        columns = df.width(),
        "sheet written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_template(path: &Path, sheets: &[&str]) {
        let mut workbook = XlsxWorkbook::new();
        for name in sheets {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(*name).unwrap();
            worksheet.write_string(0, 0, "old").unwrap();
            worksheet.write_number(5, 2, 42.0).unwrap();
        }
        workbook.save(path).unwrap();
    }

    fn tables() -> PerDimension<DimensionTable> {
        PerDimension::from_fn(|dimension| {
            DimensionTable::new(
                dimension,
                df!(
                    "コード" => [Some("001"), None],
                    "2025売上" => [Some(10i64), Some(20)],
                    "2025㎡" => [1.5f64, 0.0],
                )
                .unwrap(),
            )
        })
    }

    #[test]
    fn dimension_sheets_replaced_others_kept() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("format.xlsx");
        build_template(&template_path, &["表紙", "法人", "得意先", "得意先（商品）"]);

        let template = ReportTemplate::open(&template_path).unwrap();
        let output = dir.path().join("out").join("report.xlsx");
        template.render(&tables(), &output).unwrap();

        let mut book = open_workbook_auto(&output).unwrap();
        assert_eq!(
            book.sheet_names().to_vec(),
            vec!["表紙", "法人", "得意先", "得意先（商品）"]
        );

        let cover = book.worksheet_range("表紙").unwrap();
        assert_eq!(cover.get_value((0, 0)), Some(&Data::String("old".into())));
        assert_eq!(cover.get_value((5, 2)), Some(&Data::Float(42.0)));

        let company = book.worksheet_range("法人").unwrap();
        assert_eq!(company.get_value((0, 0)), Some(&Data::String("コード".into())));
        assert_eq!(company.get_value((0, 1)), Some(&Data::String("2025売上".into())));
        assert_eq!(company.get_value((1, 0)), Some(&Data::String("001".into())));
        assert_eq!(company.get_value((2, 1)), Some(&Data::Float(20.0)));
        assert_eq!(company.get_value((1, 2)), Some(&Data::Float(1.5)));
        // stale template content below the header is gone
        assert_ne!(company.get_value((5, 2)), Some(&Data::Float(42.0)));
    }

    #[test]
    fn missing_dimension_sheet_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("format.xlsx");
        build_template(&template_path, &["法人", "得意先"]);

        let template = ReportTemplate::open(&template_path).unwrap();
        let err = template
            .render(&tables(), &dir.path().join("report.xlsx"))
            .unwrap_err();
        assert!(matches!(err, RollupError::MissingSheet(ref s) if s == "得意先（商品）"));
    }

    #[test]
    fn missing_template_is_fatal() {
        let err = ReportTemplate::open(Path::new("/nonexistent/format.xlsx")).unwrap_err();
        assert!(matches!(err, RollupError::MissingInput(_)));
    }
}
