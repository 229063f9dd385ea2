use crate::error::{DashError, Result};
use crate::loader::Table;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Suffix of Tokyo Stock Exchange listings
pub const DEFAULT_MARKET_SUFFIX: &str = ".T";

/// A quotable ticker symbol such as `7203.T`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Symbol(String);

impl Symbol {
    /// Derive a symbol from a listing code
    ///
    /// Numeric codes are zero-padded to four digits before the market
    /// suffix is appended.
    ///
    /// # Examples
    /// ```
    /// use dashboard::market::Symbol;
    ///
    /// assert_eq!(Symbol::from_code("7203", ".T").as_str(), "7203.T");
    /// assert_eq!(Symbol::from_code("52", ".T").as_str(), "0052.T");
    /// ```
    pub fn from_code(code: &str, suffix: &str) -> Self {
        let code = code.trim();
        let code = match code.parse::<f64>() {
            // spreadsheets hand integer codes back as "7203" or "7203.0"
            Ok(n) if n.fract() == 0.0 && n >= 0.0 => format!("{:04}", n as u64),
            _ => code.to_string(),
        };
        Symbol(format!("{}{}", code, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One listing of the ticker reference table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerRecord {
    pub name: String,
    pub code: String,
    /// All cells of the source row
    pub cells: Vec<String>,
}

/// Ticker reference table, sorted and indexed by display name
#[derive(Debug, Clone, Default)]
pub struct TickerTable {
    pub columns: Vec<String>,
    entries: BTreeMap<String, TickerRecord>,
}

impl TickerTable {
    pub const NAME_COLUMN: &'static str = "銘柄名";
    pub const CODE_COLUMN: &'static str = "コード";

    /// Index a loaded table by its name column
    ///
    /// When a name repeats, the later row wins.
    pub fn from_table(table: &Table, name_column: &str, code_column: &str) -> Result<Self> {
        let name_idx = table.require_column(name_column)?;
        let code_idx = table.require_column(code_column)?;

        let entries = table
            .rows
            .iter()
            .filter(|row| !row[name_idx].trim().is_empty())
            .map(|row| {
                let name = row[name_idx].trim().to_string();
                let record = TickerRecord {
                    name: name.clone(),
                    code: row[code_idx].trim().to_string(),
                    cells: row.clone(),
                };
                (name, record)
            })
            .collect();

        Ok(TickerTable {
            columns: table.columns.clone(),
            entries,
        })
    }

    pub fn get(&self, name: &str) -> Option<&TickerRecord> {
        self.entries.get(name)
    }

    /// Listings in name order
    pub fn records(&self) -> impl Iterator<Item = &TickerRecord> {
        self.entries.values()
    }

    pub fn first(&self) -> Option<&TickerRecord> {
        self.entries.values().next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load a flat JSON object of label translations
///
/// Non-string values are skipped.
pub fn load_translations(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)?;

    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect())
}

/// Descriptive fields about a listing, keyed by the API's field names
pub type CompanyInfo = BTreeMap<String, serde_json::Value>;

/// One trading day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
}

/// Remote market-data capability
///
/// Calls are blocking; web handlers run them on the blocking pool. The
/// symbol is passed on every call, there is no selected-company state.
pub trait QuoteSource: Send + Sync {
    /// Current descriptive info for a listing
    fn info(&self, symbol: &Symbol) -> Result<CompanyInfo>;

    /// Daily bars covering the last `days` calendar days, newest first
    fn history(&self, symbol: &Symbol, days: u32) -> Result<Vec<PriceBar>>;
}

/// [`QuoteSource`] backed by the Yahoo Finance chart endpoint
///
/// Nothing is cached: every call is a fresh request.
#[derive(Debug, Clone)]
pub struct YahooQuotes {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for YahooQuotes {
    fn default() -> Self {
        YahooQuotes {
            base_url: "https://query2.finance.yahoo.com".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl YahooQuotes {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        YahooQuotes {
            base_url: base_url.into(),
            timeout,
        }
    }

    fn fetch_chart(&self, symbol: &Symbol, query: &[(&str, String)]) -> Result<ChartResult> {
        let url = format!(
            "{}/v8/finance/chart/{}",
            self.base_url.trim_end_matches('/'),
            symbol
        );
        log::debug!("fetching {} {:?}", url, query);

        let body = reqwest::blocking::Client::new()
            .get(&url)
            .query(query)
            .header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .timeout(self.timeout)
            .send()?
            .error_for_status()?
            .text()?;

        parse_chart(&body)
    }
}

impl QuoteSource for YahooQuotes {
    fn info(&self, symbol: &Symbol) -> Result<CompanyInfo> {
        let chart = self.fetch_chart(symbol, &[("range", "1d".to_string()), ("interval", "1d".to_string())])?;
        Ok(chart.meta.into_iter().collect())
    }

    fn history(&self, symbol: &Symbol, days: u32) -> Result<Vec<PriceBar>> {
        let now = chrono::Utc::now().timestamp();
        let start = now - i64::from(days) * 86_400;
        let chart = self.fetch_chart(
            symbol,
            &[
                ("period1", start.to_string()),
                ("period2", now.to_string()),
                ("interval", "1d".to_string()),
            ],
        )?;
        Ok(bars_from_chart(&chart))
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// One symbol's payload from the chart endpoint
#[derive(Debug, Deserialize, Default)]
pub struct ChartResult {
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub timestamp: Vec<i64>,
    #[serde(default)]
    pub indicators: Indicators,
}

#[derive(Debug, Deserialize, Default)]
pub struct Indicators {
    #[serde(default)]
    pub quote: Vec<QuoteColumns>,
}

#[derive(Debug, Deserialize, Default)]
pub struct QuoteColumns {
    #[serde(default)]
    pub open: Vec<Option<f64>>,
    #[serde(default)]
    pub high: Vec<Option<f64>>,
    #[serde(default)]
    pub low: Vec<Option<f64>>,
    #[serde(default)]
    pub close: Vec<Option<f64>>,
    #[serde(default)]
    pub volume: Vec<Option<u64>>,
}

/// Decode a chart endpoint response body
///
/// # Errors
/// * `DashError::Market` when the API reports an error or returns no result
pub fn parse_chart(body: &str) -> Result<ChartResult> {
    let envelope: ChartEnvelope = serde_json::from_str(body)?;

    if let Some(err) = envelope.chart.error.filter(|e| !e.is_null()) {
        return Err(DashError::Market(err.to_string()));
    }

    envelope
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DashError::Market("empty chart result".to_string()))
}

/// Turn a chart payload into daily bars, newest first
///
/// Timestamps are shifted by the exchange's `gmtoffset` so that each bar
/// lands on its local trading date.
pub fn bars_from_chart(chart: &ChartResult) -> Vec<PriceBar> {
    let offset = chart
        .meta
        .get("gmtoffset")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let empty = QuoteColumns::default();
    let quote = chart.indicators.quote.first().unwrap_or(&empty);
    let at = |col: &[Option<f64>], i: usize| col.get(i).copied().flatten();

    let mut bars = chart
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let date = DateTime::from_timestamp(ts + offset, 0)?.date_naive();
            Some(PriceBar {
                date,
                open: at(&quote.open, i),
                high: at(&quote.high, i),
                low: at(&quote.low, i),
                close: at(&quote.close, i),
                volume: quote.volume.get(i).copied().flatten(),
            })
        })
        .collect::<Vec<_>>();

    bars.sort_by(|a, b| b.date.cmp(&a.date));
    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART: &str = r#"{
        "chart": {
            "result": [{
                "meta": {"symbol": "7203.T", "currency": "JPY", "gmtoffset": 32400,
                         "regularMarketPrice": 2950.5, "longName": "Toyota Motor Corporation"},
                "timestamp": [1704243600, 1704330000, 1704416400],
                "indicators": {"quote": [{
                    "open": [2800.0, null, 2900.0],
                    "high": [2850.0, 2870.0, 2950.0],
                    "low": [2790.0, 2810.0, 2890.0],
                    "close": [2840.0, 2860.0, 2940.0],
                    "volume": [1000, 2000, null]
                }]}
            }],
            "error": null
        }
    }"#;

    #[test]
    fn symbols_are_padded_and_suffixed() {
        assert_eq!(Symbol::from_code("7203", ".T").to_string(), "7203.T");
        assert_eq!(Symbol::from_code("7203.0", ".T").to_string(), "7203.T");
        assert_eq!(Symbol::from_code("52", ".T").to_string(), "0052.T");
        assert_eq!(Symbol::from_code("130A", ".T").to_string(), "130A.T");
    }

    #[test]
    fn history_is_newest_first() {
        let chart = parse_chart(CHART).unwrap();
        let bars = bars_from_chart(&chart);

        assert_eq!(bars.len(), 3);
        assert!(bars[0].date > bars[1].date && bars[1].date > bars[2].date);
        assert_eq!(bars[0].open, Some(2900.0));
        assert_eq!(bars[1].open, None);
        assert_eq!(bars[0].volume, None);
        assert_eq!(bars[2].volume, Some(1000));
    }

    #[test]
    fn bars_use_exchange_local_dates() {
        // 2024-01-03 01:00 UTC is 10:00 in Tokyo on the same day
        let chart = parse_chart(CHART).unwrap();
        let bars = bars_from_chart(&chart);
        assert_eq!(bars[2].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
    }

    #[test]
    fn api_errors_surface() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#;
        assert!(matches!(parse_chart(body), Err(DashError::Market(_))));
        assert!(parse_chart("not json").is_err());
    }

    #[test]
    fn ticker_table_is_sorted_by_name() {
        let table = Table::new(
            "nikkei",
            vec!["コード".into(), "銘柄名".into(), "業種".into()],
            vec![
                vec!["9984".into(), "ソフトバンクグループ".into(), "情報・通信".into()],
                vec!["7203".into(), "トヨタ自動車".into(), "輸送用機器".into()],
                vec!["".into(), "".into(), "".into()],
            ],
        );
        let tickers =
            TickerTable::from_table(&table, TickerTable::NAME_COLUMN, TickerTable::CODE_COLUMN)
                .unwrap();

        assert_eq!(tickers.len(), 2);
        let names = tickers.records().map(|r| r.name.as_str()).collect::<Vec<_>>();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(tickers.get("トヨタ自動車").unwrap().code, "7203");
    }

    #[test]
    fn translations_keep_string_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.json");
        std::fs::write(&path, r#"{"currency": "通貨", "nested": {"a": 1}}"#).unwrap();

        let dict = load_translations(&path).unwrap();
        assert_eq!(dict.get("currency").map(String::as_str), Some("通貨"));
        assert!(!dict.contains_key("nested"));
    }
}
