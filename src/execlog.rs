use crate::error::{DashError, Result};
use crate::loader::Table;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::HashMap;

/// Marker shown in the `latest` column
pub const LATEST_MARK: &str = "●";

/// Rows kept after sorting
pub const DEFAULT_MAX_ROWS: usize = 20;

/// One run of a detection type
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub updated: NaiveDateTime,
    pub category: String,
    /// All cells of the source row, the date cell rewritten in canonical form
    pub cells: Vec<String>,
    pub latest: bool,
}

/// The execution log shown on the dashboard
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionLog {
    pub columns: Vec<String>,
    pub entries: Vec<LogEntry>,
}

/// Which columns of the source table drive the log
#[derive(Debug, Clone)]
pub struct LogColumns<'a> {
    pub date: &'a str,
    pub category: &'a str,
    pub max_rows: usize,
}

impl Default for LogColumns<'_> {
    fn default() -> Self {
        LogColumns {
            date: "更新日",
            category: "異常検知種",
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

impl ExecutionLog {
    /// Build the log from a loaded table
    ///
    /// Rows are stable-sorted ascending by the date column. Every row whose
    /// date equals the minimum date of its category gets the latest marker
    /// (ties are all marked). The marker is computed over the full table,
    /// then the table is cut to the first `max_rows` rows.
    ///
    /// # Errors
    /// * `DashError::MissingColumn` if either column is absent
    /// * `DashError::InvalidDate` for the first cell that does not parse
    pub fn from_table(table: &Table, columns: &LogColumns<'_>) -> Result<Self> {
        let date_idx = table.require_column(columns.date)?;
        let category_idx = table.require_column(columns.category)?;

        let mut entries = table
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let raw = &row[date_idx];
                let updated = parse_datetime(raw).ok_or_else(|| DashError::InvalidDate {
                    row: i + 1,
                    value: raw.clone(),
                })?;

                let mut cells = row.clone();
                cells[date_idx] = format_datetime(&updated);

                Ok(LogEntry {
                    updated,
                    category: row[category_idx].trim().to_string(),
                    cells,
                    latest: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        entries.sort_by_key(|e| e.updated);
        mark_earliest(&mut entries);
        entries.truncate(columns.max_rows);

        Ok(ExecutionLog {
            columns: table.columns.clone(),
            entries,
        })
    }

    /// Header for display, with the marker column appended
    pub fn display_columns(&self) -> Vec<String> {
        let mut cols = self.columns.clone();
        cols.push("latest".to_string());
        cols
    }

    /// Rows for display, with the marker cell appended
    pub fn display_rows(&self) -> Vec<Vec<String>> {
        self.entries
            .iter()
            .map(|e| {
                let mut cells = e.cells.clone();
                cells.push(if e.latest { LATEST_MARK.to_string() } else { String::new() });
                cells
            })
            .collect()
    }
}

// Rows with an empty category never get the marker.
fn mark_earliest(entries: &mut [LogEntry]) {
    let mut earliest: HashMap<&str, NaiveDateTime> = HashMap::new();
    for e in entries.iter() {
        if e.category.is_empty() {
            continue;
        }
        earliest
            .entry(e.category.as_str())
            .and_modify(|d| *d = (*d).min(e.updated))
            .or_insert(e.updated);
    }

    let flags = entries
        .iter()
        .map(|e| earliest.get(e.category.as_str()) == Some(&e.updated))
        .collect::<Vec<_>>();

    for (entry, flag) in entries.iter_mut().zip(flags) {
        entry.latest = flag;
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"];

/// Parse the date formats found in the execution tables
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn format_datetime(dt: &NaiveDateTime) -> String {
    if dt.num_seconds_from_midnight() == 0 {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}
