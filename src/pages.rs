//! Server-rendered HTML pages.
//!
//! Templates are compiled into the binary and rendered with handlebars,
//! which HTML-escapes every value. Each page has a small serializable view
//! struct so that handlers only decide *what* to show.

use crate::detection::{self, DETECTION_TYPES, DetectionRecord};
use crate::error::Result;
use crate::execlog::ExecutionLog;
use crate::market::{CompanyInfo, TickerTable};
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::BTreeMap;

/// Bounds and default of the market page's day-period input
pub const PERIOD_MIN: u32 = 7;
pub const PERIOD_MAX: u32 = 168;
pub const DEFAULT_PERIOD: u32 = 28;

/// The compiled template registry
pub struct Pages {
    registry: Handlebars<'static>,
}

impl Pages {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_partial("head", include_str!("templates/head.hbs"))?;
        registry.register_partial("nav", include_str!("templates/nav.hbs"))?;

        for (name, source) in [
            ("login", include_str!("templates/login.hbs")),
            ("dashboard", include_str!("templates/dashboard.hbs")),
            ("anomaly", include_str!("templates/anomaly.hbs")),
            ("kabu", include_str!("templates/kabu.hbs")),
        ] {
            registry.register_template_string(name, source)?;
        }

        Ok(Pages { registry })
    }

    pub fn login(&self, error: Option<&str>, username: &str) -> Result<String> {
        let data = serde_json::json!({ "error": error, "username": username });
        Ok(self.registry.render("login", &data)?)
    }

    pub fn dashboard(&self, view: &DashboardView) -> Result<String> {
        Ok(self.registry.render("dashboard", view)?)
    }

    pub fn anomaly(&self, view: &AnomalyView) -> Result<String> {
        Ok(self.registry.render("anomaly", view)?)
    }

    pub fn kabu(&self, view: &KabuView) -> Result<String> {
        Ok(self.registry.render("kabu", view)?)
    }
}

#[derive(Debug, Serialize)]
pub struct TypeLink {
    pub id: u8,
    pub label: &'static str,
}

/// An `<option>` of a select box
#[derive(Debug, Serialize)]
pub struct Choice {
    pub name: String,
    pub selected: bool,
}

#[derive(Debug, Serialize)]
pub struct DashboardView {
    pub user: String,
    pub types: Vec<TypeLink>,
    pub has_log: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DashboardView {
    pub fn new(user: &str, log: Option<&ExecutionLog>) -> Self {
        DashboardView {
            user: user.to_string(),
            types: DETECTION_TYPES
                .iter()
                .map(|t| TypeLink { id: t.id, label: t.label })
                .collect(),
            has_log: log.is_some(),
            columns: log.map(|l| l.display_columns()).unwrap_or_default(),
            rows: log.map(|l| l.display_rows()).unwrap_or_default(),
        }
    }
}

/// One detection record, formatted for display
#[derive(Debug, Serialize)]
pub struct RecordRow {
    pub no: String,
    pub product: String,
    pub test: String,
    pub score: String,
    pub judge: String,
    pub judge_class: &'static str,
    pub lcl: String,
    pub ucl: String,
    pub download: String,
    pub download_url: Option<String>,
    pub graph_path: String,
}

fn fmt_number(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

impl From<&DetectionRecord> for RecordRow {
    fn from(r: &DetectionRecord) -> Self {
        RecordRow {
            no: r.no.clone(),
            product: r.product.clone(),
            test: r.test.clone(),
            score: fmt_number(r.score),
            judge: r.judge.clone(),
            judge_class: r.judgement().css_class(),
            lcl: fmt_number(r.lcl),
            ucl: fmt_number(r.ucl),
            download: r.download.clone(),
            download_url: (!r.download.is_empty())
                .then(|| format!("/download/{}", urlencoding::encode(&r.download))),
            graph_path: r.graph_path.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnomalyView {
    pub user: String,
    pub id: i64,
    pub title: String,
    /// Whether `id` is a registered detection type
    pub known: bool,
    pub tests: Vec<Choice>,
    pub records: Vec<RecordRow>,
    pub boxplot_url: String,
    pub scatter_url: Option<String>,
}

impl AnomalyView {
    /// `records` are the rows of detection type `id`; a non-empty `test`
    /// narrows them to one metric
    pub fn new(user: &str, id: i64, records: &[&DetectionRecord], test: Option<&str>) -> Self {
        let test = test.filter(|t| !t.is_empty());
        let tests = detection::unique_in_order(records.iter().map(|r| r.test.as_str()))
            .into_iter()
            .map(|name| Choice {
                selected: Some(name.as_str()) == test,
                name,
            })
            .collect();

        let rows = records
            .iter()
            .filter(|r| test.is_none_or(|t| r.test == t))
            .map(|r| RecordRow::from(*r))
            .collect();

        let query = test
            .map(|t| format!("?test={}", urlencoding::encode(t)))
            .unwrap_or_default();

        AnomalyView {
            user: user.to_string(),
            id,
            title: detection::page_title(id),
            known: detection::lookup(id).is_some(),
            tests,
            records: rows,
            boxplot_url: format!("/anomaly/{}/boxplot.png{}", id, query),
            scatter_url: test.map(|_| format!("/anomaly/{}/scatter.png{}", id, query)),
        }
    }
}

/// A translated line of the company info panel
#[derive(Debug, Serialize)]
pub struct InfoRow {
    pub label: String,
    pub value: String,
}

/// Label info fields through the translation dictionary
///
/// Keys missing from the dictionary keep their API name; null values are
/// left out.
pub fn info_rows(info: &CompanyInfo, translations: &BTreeMap<String, String>) -> Vec<InfoRow> {
    info.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| InfoRow {
            label: translations.get(k).cloned().unwrap_or_else(|| k.clone()),
            value: match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct KabuView {
    pub user: String,
    pub category: String,
    pub has_tickers: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub tickers: Vec<Choice>,
    pub period: u32,
    pub period_min: u32,
    pub period_max: u32,
    pub chart_url: Option<String>,
    pub info: Vec<InfoRow>,
    pub info_error: Option<String>,
}

impl KabuView {
    /// Ticker table and chart form; the info panel is filled in by the caller
    pub fn new(
        user: &str,
        category: &str,
        tickers: Option<&TickerTable>,
        selected: Option<&str>,
        period: u32,
    ) -> Self {
        let chart_url = selected.map(|name| {
            format!(
                "/kabu/{}/trend.png?name={}&period={}",
                urlencoding::encode(category),
                urlencoding::encode(name),
                period
            )
        });

        KabuView {
            user: user.to_string(),
            category: category.to_string(),
            has_tickers: tickers.is_some(),
            columns: tickers.map(|t| t.columns.clone()).unwrap_or_default(),
            rows: tickers
                .map(|t| t.records().map(|r| r.cells.clone()).collect())
                .unwrap_or_default(),
            tickers: tickers
                .map(|t| {
                    t.records()
                        .map(|r| Choice {
                            name: r.name.clone(),
                            selected: Some(r.name.as_str()) == selected,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            period,
            period_min: PERIOD_MIN,
            period_max: PERIOD_MAX,
            chart_url,
            info: Vec::new(),
            info_error: None,
        }
    }
}

/// Clamp a requested period into the accepted range
///
/// The raw query value may be missing, blank (a cleared input field) or not
/// a number; all of those give [`DEFAULT_PERIOD`].
pub fn clamp_period(period: Option<&str>) -> u32 {
    period
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .and_then(|p| p.parse::<i64>().ok())
        .map_or(DEFAULT_PERIOD, |p| {
            p.clamp(i64::from(PERIOD_MIN), i64::from(PERIOD_MAX)) as u32
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::records_from_table;
    use crate::execlog::LogColumns;
    use crate::loader::Table;

    fn pages() -> Pages {
        Pages::new().unwrap()
    }

    #[test]
    fn login_page_escapes_and_shows_error() {
        let html = pages().login(Some("Invalid username or password"), "<b>").unwrap();
        assert!(html.contains("Invalid username or password"));
        assert!(html.contains("&lt;b&gt;"));
        assert!(!pages().login(None, "").unwrap().contains("class=\"error\""));
    }

    #[test]
    fn dashboard_lists_log_and_links() {
        let table = Table::new(
            "log",
            vec!["更新日".into(), "異常検知種".into()],
            vec![vec!["2024-01-02".into(), "detectA".into()]],
        );
        let log = ExecutionLog::from_table(&table, &LogColumns::default()).unwrap();
        let html = pages().dashboard(&DashboardView::new("alice", Some(&log))).unwrap();

        assert!(html.contains("2024-01-02"));
        assert!(html.contains("●"));
        assert!(html.contains("/anomaly/4"));
        assert!(html.contains("/kabu/A"));

        let empty = pages().dashboard(&DashboardView::new("alice", None)).unwrap();
        assert!(empty.contains("No execution log loaded."));
    }

    #[test]
    fn anomaly_view_filters_by_test() {
        let rows = [
            ["1", "detectA", "P1", "T1", "5", "OK", "1", "9", "a b.zip", "graphs/x.png"],
            ["2", "detectA", "P2", "T2", "12", "", "1", "9", "", ""],
        ];
        let table = Table::new(
            "t",
            detection::DETECTION_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect(),
        );
        let records = records_from_table(&table).unwrap();
        let refs = records.iter().collect::<Vec<_>>();

        let all = AnomalyView::new("u", 1, &refs, None);
        assert_eq!(all.records.len(), 2);
        assert_eq!(all.tests.len(), 2);
        assert!(all.scatter_url.is_none());
        assert_eq!(all.records[0].download_url.as_deref(), Some("/download/a%20b.zip"));
        assert_eq!(all.records[1].judge_class, "judge-over");

        let one = AnomalyView::new("u", 1, &refs, Some("T2"));
        assert_eq!(one.records.len(), 1);
        assert!(one.tests[1].selected);
        assert_eq!(one.boxplot_url, "/anomaly/1/boxplot.png?test=T2");
        assert_eq!(one.scatter_url.as_deref(), Some("/anomaly/1/scatter.png?test=T2"));
    }

    #[test]
    fn unknown_type_renders_undefined_title() {
        let html = pages().anomaly(&AnomalyView::new("u", 99, &[], None)).unwrap();
        assert!(html.contains("Anomaly detection 99: undefined"));
    }

    #[test]
    fn info_rows_use_translations() {
        let mut info = CompanyInfo::new();
        info.insert("currency".into(), serde_json::json!("JPY"));
        info.insert("regularMarketPrice".into(), serde_json::json!(2950.5));
        info.insert("missing".into(), serde_json::Value::Null);
        let mut dict = BTreeMap::new();
        dict.insert("currency".to_string(), "通貨".to_string());

        let rows = info_rows(&info, &dict);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].label, "通貨");
        assert_eq!(rows[0].value, "JPY");
        assert_eq!(rows[1].label, "regularMarketPrice");
        assert_eq!(rows[1].value, "2950.5");
    }

    #[test]
    fn period_is_clamped() {
        assert_eq!(clamp_period(None), 28);
        assert_eq!(clamp_period(Some("1")), 7);
        assert_eq!(clamp_period(Some("-5")), 7);
        assert_eq!(clamp_period(Some("500")), 168);
        assert_eq!(clamp_period(Some("99999999999")), 168);
        assert_eq!(clamp_period(Some(" 30 ")), 30);
        assert_eq!(clamp_period(Some("")), 28);
        assert_eq!(clamp_period(Some("abc")), 28);
    }
}
