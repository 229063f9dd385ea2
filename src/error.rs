use thiserror::Error;

/// Every failure the dashboard can report.
///
/// Load-time variants end up in the startup log; request-time variants are
/// turned into HTTP responses by the `IntoResponse` impl below.
#[derive(Error, Debug)]
pub enum DashError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("access outside the served directory: {0}")]
    Forbidden(String),

    #[error("unsupported table format: {0}")]
    UnsupportedFormat(String),

    #[error("column `{column}` missing from {source_name}")]
    MissingColumn { column: String, source_name: String },

    #[error("row {row}: cannot parse `{value}` as a date")]
    InvalidDate { row: usize, value: String },

    #[error("chart error: {0}")]
    Chart(String),

    #[error("market data error: {0}")]
    Market(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("spreadsheet error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "web")]
    #[error("template error: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[cfg(feature = "web")]
    #[error("render error: {0}")]
    Render(#[from] handlebars::RenderError),

    #[cfg(feature = "web")]
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DashError>;

#[cfg(feature = "web")]
impl axum::response::IntoResponse for DashError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            DashError::NotFound(_) => StatusCode::NOT_FOUND,
            DashError::Forbidden(_) => StatusCode::FORBIDDEN,
            DashError::Market(_) | DashError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("{}", self);
        } else {
            log::warn!("{}", self);
        }

        (status, self.to_string()).into_response()
    }
}
