use crate::error::Result;
use crate::loader::Table;
use crate::pathmap::{archive_basename, convert_graph_path};
use serde::Serialize;

/// A registered anomaly-detection category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionType {
    /// Integer used in `/anomaly/<id>` routes
    pub id: u8,
    /// Tag stored in the result tables' `detect_category` column
    pub key: &'static str,
    /// Short display name
    pub label: &'static str,
}

/// The four detection types, in page order
pub const DETECTION_TYPES: [DetectionType; 4] = [
    DetectionType { id: 1, key: "detectA", label: "ValueA" },
    DetectionType { id: 2, key: "detectB", label: "ValueB" },
    DetectionType { id: 3, key: "detectC", label: "ValueC" },
    DetectionType { id: 4, key: "detectD", label: "ValueD" },
];

/// Label used for ids outside the registry
pub const UNDEFINED_LABEL: &str = "undefined";

/// Map a stored category tag to its detection-type id
pub fn type_id(category: &str) -> Option<u8> {
    DETECTION_TYPES
        .iter()
        .find(|t| t.key == category.trim())
        .map(|t| t.id)
}

pub fn lookup(id: i64) -> Option<&'static DetectionType> {
    DETECTION_TYPES.iter().find(|t| i64::from(t.id) == id)
}

/// Heading of a detail page; unknown ids get the generic label
///
/// # Examples
/// ```
/// use dashboard::detection::page_title;
///
/// assert_eq!(page_title(2), "Anomaly detection 2: ValueB");
/// assert_eq!(page_title(99), "Anomaly detection 99: undefined");
/// ```
pub fn page_title(id: i64) -> String {
    let label = lookup(id).map(|t| t.label).unwrap_or(UNDEFINED_LABEL);
    format!("Anomaly detection {}: {}", id, label)
}

/// Outcome of comparing a score against its control limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Judgement {
    Normal,
    OverSpec,
    UnderSpec,
}

impl Judgement {
    pub const OVER_LABEL: &'static str = "NG_over_spec";
    pub const UNDER_LABEL: &'static str = "NG_under_spec";
    pub const NORMAL_LABEL: &'static str = "OK";

    /// Classify a stored judge label; anything not flagged NG counts as normal
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            Self::OVER_LABEL => Judgement::OverSpec,
            Self::UNDER_LABEL => Judgement::UnderSpec,
            _ => Judgement::Normal,
        }
    }

    /// Classify a score against `lcl`/`ucl`; a missing limit never trips
    pub fn from_limits(score: f64, lcl: Option<f64>, ucl: Option<f64>) -> Self {
        if ucl.is_some_and(|u| score > u) {
            Judgement::OverSpec
        } else if lcl.is_some_and(|l| score < l) {
            Judgement::UnderSpec
        } else {
            Judgement::Normal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Judgement::Normal => Self::NORMAL_LABEL,
            Judgement::OverSpec => Self::OVER_LABEL,
            Judgement::UnderSpec => Self::UNDER_LABEL,
        }
    }

    /// CSS class used to colour the judge cell
    pub fn css_class(&self) -> &'static str {
        match self {
            Judgement::Normal => "",
            Judgement::OverSpec => "judge-over",
            Judgement::UnderSpec => "judge-under",
        }
    }
}

/// One row of a detection result table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub no: String,
    pub category: String,
    pub detection_type: Option<u8>,
    pub product: String,
    pub test: String,
    pub score: Option<f64>,
    /// Label as stored, or derived from the limits when the cell is blank
    pub judge: String,
    pub lcl: Option<f64>,
    pub ucl: Option<f64>,
    /// Archive file name, served from `/download/<name>`
    pub download: String,
    /// Public URL of the row's graph image
    pub graph_path: String,
}

impl DetectionRecord {
    pub fn judgement(&self) -> Judgement {
        Judgement::from_label(&self.judge)
    }
}

/// Column names of a detection result table
pub const DETECTION_COLUMNS: [&str; 10] = [
    "no",
    "detect_category",
    "product",
    "test",
    "score",
    "judge",
    "lcl",
    "ucl",
    "zipfile",
    "graphpath",
];

/// Build typed detection records from a loaded result table
///
/// Category tags are mapped through the registry, graph paths are
/// normalized to `/my_images/...` URLs and archive paths are reduced to
/// their file names. Numeric cells that do not parse are kept as absent
/// values rather than failing the load.
///
/// # Errors
/// * `DashError::MissingColumn` if any of [`DETECTION_COLUMNS`] is absent
pub fn records_from_table(table: &Table) -> Result<Vec<DetectionRecord>> {
    let idx = DETECTION_COLUMNS
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<Vec<_>>>()?;

    let records = table
        .rows
        .iter()
        .map(|row| {
            let cell = idx.iter().map(|&i| row[i].trim()).collect::<Vec<_>>();

            let score = parse_number(cell[4]);
            let lcl = parse_number(cell[6]);
            let ucl = parse_number(cell[7]);
            let judge = match (cell[5], score) {
                ("", Some(s)) => Judgement::from_limits(s, lcl, ucl).label().to_string(),
                (label, _) => label.to_string(),
            };

            DetectionRecord {
                no: cell[0].to_string(),
                category: cell[1].to_string(),
                detection_type: type_id(cell[1]),
                product: cell[2].to_string(),
                test: cell[3].to_string(),
                score,
                judge,
                lcl,
                ucl,
                download: archive_basename(cell[8]),
                graph_path: if cell[9].trim().is_empty() {
                    String::new()
                } else {
                    convert_graph_path(cell[9])
                },
            }
        })
        .collect();

    Ok(records)
}

/// Records of one detection type, in table order
pub fn filter_by_type(records: &[DetectionRecord], id: i64) -> Vec<&DetectionRecord> {
    records
        .iter()
        .filter(|r| r.detection_type.map(i64::from) == Some(id))
        .collect()
}

/// Distinct values in first-seen order
pub fn unique_in_order<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = Vec::<String>::new();
    for v in values {
        if !seen.iter().any(|s| s == v) {
            seen.push(v.to_string());
        }
    }
    seen
}

fn parse_number(cell: &str) -> Option<f64> {
    if cell.is_empty() {
        return None;
    }
    match cell.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            log::warn!("ignoring non-numeric cell `{}`", cell);
            None
        }
    }
}
