use crate::error::{DashError, Result};
use crate::execlog::{DEFAULT_MAX_ROWS, LogColumns};
use crate::market::DEFAULT_MARKET_SUFFIX;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted session lifetime, one leap year
pub const MAX_SESSION_HOURS: u64 = 366 * 24;

/// Server configuration
///
/// Loaded from a JSON file; every field is optional in the file. Relative
/// paths are taken relative to `root` (see [`Config::resolve`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub root: PathBuf,

    /// Detection results table (`.csv`/`.xlsx`/...)
    pub detection_table: Option<PathBuf>,
    /// Execution log table
    pub execution_log: Option<PathBuf>,
    /// Ticker reference table for the market page
    pub ticker_list: Option<PathBuf>,
    /// JSON object mapping market info keys to display labels
    pub translation_dict: Option<PathBuf>,

    /// Archives served by `/download`
    pub files_dir: PathBuf,
    /// Images served by `/my_images`
    pub graphs_dir: PathBuf,
    pub static_dir: PathBuf,
    pub users_file: PathBuf,
    pub session_hours: u64,

    pub market_suffix: String,
    pub log_date_column: String,
    pub log_category_column: String,
    pub log_max_rows: usize,

    /// Use generated tables instead of the configured files
    pub sample_data: bool,
    /// Fixed seed for the generated tables
    pub sample_seed: Option<u64>,

    pub quote_base_url: String,
    pub quote_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let log = LogColumns::default();
        Self {
            bind: "127.0.0.1:5000".into(),
            root: PathBuf::from("."),
            detection_table: None,
            execution_log: None,
            ticker_list: None,
            translation_dict: None,
            files_dir: PathBuf::from("data/files"),
            graphs_dir: PathBuf::from("data/graphs"),
            static_dir: PathBuf::from("static"),
            users_file: PathBuf::from("users.json"),
            session_hours: 24,
            market_suffix: DEFAULT_MARKET_SUFFIX.into(),
            log_date_column: log.date.into(),
            log_category_column: log.category.into(),
            log_max_rows: DEFAULT_MAX_ROWS,
            sample_data: false,
            sample_seed: None,
            quote_base_url: "https://query2.finance.yahoo.com".into(),
            quote_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DashError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_max_rows == 0 {
            return Err(DashError::Config("log_max_rows must be at least 1".into()));
        }
        if !(1..=MAX_SESSION_HOURS).contains(&self.session_hours) {
            return Err(DashError::Config(format!(
                "session_hours must be between 1 and {}",
                MAX_SESSION_HOURS
            )));
        }
        Ok(())
    }

    /// Join every relative path onto `root`
    pub fn resolve(mut self) -> Self {
        let root = self.root.clone();
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };

        for p in [
            &mut self.detection_table,
            &mut self.execution_log,
            &mut self.ticker_list,
            &mut self.translation_dict,
        ]
        .into_iter()
        .flatten()
        {
            join(p);
        }
        join(&mut self.files_dir);
        join(&mut self.graphs_dir);
        join(&mut self.static_dir);
        join(&mut self.users_file);
        self
    }

    pub fn log_columns(&self) -> LogColumns<'_> {
        LogColumns {
            date: &self.log_date_column,
            category: &self.log_category_column,
            max_rows: self.log_max_rows,
        }
    }

    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_hours.min(MAX_SESSION_HOURS) * 3600)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_secs(self.quote_timeout_secs)
    }
}
