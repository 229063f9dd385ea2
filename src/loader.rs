#![cfg(not(tarpaulin_include))]

use crate::error::{DashError, Result};
use calamine::{Data, Reader, open_workbook_auto};
use chrono::{Duration, NaiveDate, Timelike};
use encoding_rs::{SHIFT_JIS, UTF_8};
use std::borrow::Cow;
use std::path::Path;

/// An in-memory table: one header row plus string cells
///
/// Every source (CSV, workbook, generated sample data) is flattened into
/// this shape first; typed views such as the execution log or the
/// detection records are built on top of it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    /// Header names, in file order
    pub columns: Vec<String>,

    /// Data rows; each row has exactly `columns.len()` cells
    pub rows: Vec<Vec<String>>,

    /// Where the table came from, used in error messages
    pub source: String,
}

impl Table {
    /// Build a table from a header and rows, padding or cutting rows to the
    /// header width
    pub fn new(source: impl Into<String>, columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();

        Table {
            columns,
            rows,
            source: source.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by exact header name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Like [`Table::column_index`] but a missing column is an error
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| DashError::MissingColumn {
            column: name.to_string(),
            source_name: self.source.clone(),
        })
    }
}

/// Load a table from a CSV file
///
/// The first record is the header. Files are read as UTF-8 (a leading BOM
/// is dropped); anything that is not valid UTF-8 is decoded as CP932, the
/// encoding the detection and ticker exports are written in.
///
/// # Arguments
/// * `filepath` - Path to the CSV file
///
/// # Returns
/// * The table, or an error if the file cannot be read or parsed
///
/// # Examples
/// ```no_run
/// use dashboard::loader::from_csv;
///
/// match from_csv("data/detection_tbl.csv") {
///     Ok(table) => println!("Loaded {} rows", table.len()),
///     Err(e) => eprintln!("Error loading CSV: {}", e),
/// }
/// ```
pub fn from_csv(filepath: impl AsRef<Path>) -> Result<Table> {
    let path = filepath.as_ref();
    let bytes = std::fs::read(path)?;
    let text = decode_text(&bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(Table::new(path.display().to_string(), columns, rows))
}

/// UTF-8 when the bytes are valid UTF-8, CP932 otherwise
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let (text, _, malformed) = UTF_8.decode(bytes);
    if !malformed {
        return text;
    }
    let (text, _, malformed) = SHIFT_JIS.decode(bytes);
    if malformed {
        log::warn!("input is neither UTF-8 nor CP932; undecodable bytes were replaced");
    }
    text
}

/// Load the first worksheet of an Excel/OpenDocument workbook
///
/// Date cells are written as `YYYY-MM-DD`, or `YYYY-MM-DD HH:MM:SS` when
/// they carry a time of day, so that downstream date parsing sees the same
/// text it would see in a CSV export.
///
/// # Arguments
/// * `filepath` - Path to the workbook (`xlsx`, `xlsm`, `xls` or `ods`)
///
/// # Returns
/// * The first sheet as a table; the first row becomes the header
///
/// # Errors
/// * `DashError::Workbook` if the file cannot be opened or read
/// * `DashError::UnsupportedFormat` if the workbook has no sheets
pub fn from_excel(filepath: impl AsRef<Path>) -> Result<Table> {
    let path = filepath.as_ref();
    let mut workbook = open_workbook_auto(path)?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| DashError::UnsupportedFormat(format!("{}: no sheets", path.display())))??;

    let mut rows = range.rows();
    let columns = match rows.next() {
        Some(header) => header.iter().map(|c| cell_text(c).trim().to_string()).collect(),
        None => Vec::new(),
    };
    let rows = rows
        .map(|row| row.iter().map(cell_text).collect())
        .collect();

    Ok(Table::new(path.display().to_string(), columns, rows))
}

/// Detect the file type by extension and load it
///
/// # Arguments
/// * `filepath` - Path to a `csv`, `xlsx`, `xlsm`, `xls` or `ods` file
///
/// # Returns
/// * The loaded table, or `DashError::UnsupportedFormat` for any other
///   extension
///
/// # Examples
/// ```no_run
/// use dashboard::loader::load_table;
///
/// match load_table("dataset/execute_table/execute_tble.xlsx") {
///     Ok(table) => println!("Columns: {:?}", table.columns),
///     Err(e) => eprintln!("Error loading file: {}", e),
/// }
/// ```
pub fn load_table(filepath: impl AsRef<Path>) -> Result<Table> {
    let path = filepath.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    match extension.as_deref() {
        Some("csv") => from_csv(path),
        Some("xlsx") | Some("xlsm") | Some("xls") | Some("ods") => from_excel(path),
        Some(ext) => Err(DashError::UnsupportedFormat(format!(
            "unsupported file extension: {}",
            ext
        ))),
        None => Err(DashError::UnsupportedFormat(format!(
            "{} has no extension",
            path.display()
        ))),
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::DateTime(dt) => excel_serial_to_text(dt.as_f64()),
        other => other.to_string(),
    }
}

// Excel serial dates count days from 1899-12-30. Serials outside the
// calendar are left as numbers, which later fail date parsing.
fn excel_serial_to_text(serial: f64) -> String {
    let moment = serial
        .is_finite()
        .then(|| (serial * 86_400.0).round())
        .filter(|s| s.abs() < i64::MAX as f64)
        .and_then(|s| Duration::try_seconds(s as i64))
        .and_then(|offset| {
            NaiveDate::from_ymd_opt(1899, 12, 30)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .and_then(|epoch| epoch.checked_add_signed(offset))
        });
    let Some(moment) = moment else {
        return serial.to_string();
    };

    if moment.num_seconds_from_midnight() == 0 {
        moment.format("%Y-%m-%d").to_string()
    } else {
        moment.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(&path, "id,name\n1,alpha\n2,\"beta, gamma\"\n").unwrap();

        let table = from_csv(&path).unwrap();
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1], vec!["2", "beta, gamma"]);
    }

    #[test]
    fn short_rows_are_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.csv");
        fs::write(&path, "a,b,c\n1,2\n").unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn reads_first_sheet_of_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.xlsx");

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "更新日").unwrap();
        sheet.write_string(0, 1, "異常検知種").unwrap();
        sheet.write_string(1, 0, "2024-01-03").unwrap();
        sheet.write_string(1, 1, "detectA").unwrap();
        sheet.write_number(2, 0, 45292.0).unwrap();
        sheet.write_string(2, 1, "detectB").unwrap();
        workbook.save(&path).unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table.columns, vec!["更新日", "異常検知種"]);
        assert_eq!(table.rows[0], vec!["2024-01-03", "detectA"]);
        // plain numbers stay numbers
        assert_eq!(table.rows[1][0], "45292");
    }

    #[test]
    fn serial_dates_render_as_calendar_dates() {
        assert_eq!(excel_serial_to_text(45292.0), "2024-01-01");
        assert_eq!(excel_serial_to_text(45292.5), "2024-01-01 12:00:00");
    }

    #[test]
    fn out_of_range_serials_stay_numbers() {
        assert_eq!(excel_serial_to_text(1.0e9), "1000000000");
        assert_eq!(excel_serial_to_text(-1.0e9), "-1000000000");
        assert_eq!(excel_serial_to_text(1.0e300), 1.0e300_f64.to_string());
        assert_eq!(excel_serial_to_text(f64::NAN), "NaN");

        // the execution log then reports these as bad dates
        assert!(crate::execlog::parse_datetime(&excel_serial_to_text(1.0e9)).is_none());
    }

    #[test]
    fn reads_cp932_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nikkei.csv");
        let (bytes, _, unmappable) = SHIFT_JIS.encode("コード,銘柄名,業種\n7203,トヨタ自動車,輸送用機器\n");
        assert!(!unmappable);
        fs::write(&path, &bytes).unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table.columns, vec!["コード", "銘柄名", "業種"]);
        assert_eq!(table.rows[0], vec!["7203", "トヨタ自動車", "輸送用機器"]);

        let tickers = crate::market::TickerTable::from_table(
            &table,
            crate::market::TickerTable::NAME_COLUMN,
            crate::market::TickerTable::CODE_COLUMN,
        )
        .unwrap();
        assert_eq!(tickers.get("トヨタ自動車").map(|t| t.code.as_str()), Some("7203"));
    }

    #[test]
    fn utf8_bom_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bom.csv");
        fs::write(&path, "\u{feff}更新日,異常検知種\n2024-01-01,detectA\n").unwrap();

        let table = from_csv(&path).unwrap();
        assert_eq!(table.columns, vec!["更新日", "異常検知種"]);
    }

    #[test]
    fn rejects_unknown_extensions() {
        assert!(matches!(
            load_table("table.parquet"),
            Err(DashError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            load_table("table"),
            Err(DashError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn missing_file_propagates() {
        assert!(load_table("/definitely/not/here.csv").is_err());
    }

    #[test]
    fn require_column_names_the_source() {
        let table = Table::new("mem", vec!["a".into()], vec![]);
        match table.require_column("b") {
            Err(DashError::MissingColumn { column, source_name }) => {
                assert_eq!(column, "b");
                assert_eq!(source_name, "mem");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
