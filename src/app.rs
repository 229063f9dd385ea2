#![cfg(not(tarpaulin_include))]

use axum::{
    Extension, Router,
    extract::{Path, Query, Request, State},
    http::header,
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::config::Config;
use crate::detection::{self, DetectionRecord, Judgement};
use crate::error::{DashError, Result};
use crate::execlog::ExecutionLog;
use crate::graph::{self, Figure, Rgb};
use crate::loader::load_table;
use crate::login::{self, CredentialVerifier, CurrentUser, SessionStore, UserStore};
use crate::market::{self, QuoteSource, Symbol, TickerTable, YahooQuotes};
use crate::pages::{self, AnomalyView, DashboardView, KabuView, Pages};
use crate::pathmap::resolve_within;
use crate::sample;

/// Everything the handlers read, loaded once at startup
#[derive(Debug, Default)]
pub struct DataSet {
    pub execution_log: Option<ExecutionLog>,
    pub detections: Vec<DetectionRecord>,
    pub tickers: Option<TickerTable>,
    pub translations: BTreeMap<String, String>,
}

fn report<T>(what: &str, path: &FsPath, result: Result<T>, size: impl Fn(&T) -> usize) -> Option<T> {
    match result {
        Ok(value) => {
            log::info!("loaded {} from {} ({} rows)", what, path.display(), size(&value));
            Some(value)
        }
        Err(e) => {
            log::error!("failed to load {} from {}: {}", what, path.display(), e);
            None
        }
    }
}

impl DataSet {
    /// Load every configured source
    ///
    /// A source that fails to load is logged and left empty; the server
    /// still starts. With `sample_data` set, generated tables replace the
    /// execution log and the detection results.
    pub fn load(config: &Config) -> Self {
        let columns = config.log_columns();

        let (execution_log, detections) = if config.sample_data {
            log::info!("using generated sample data");
            let log = ExecutionLog::from_table(&sample::execution_table(config.sample_seed), &columns);
            let records = detection::records_from_table(&sample::detection_table(config.sample_seed));
            (
                report("sample execution log", FsPath::new("-"), log, |l| l.entries.len()),
                report("sample detections", FsPath::new("-"), records, Vec::len).unwrap_or_default(),
            )
        } else {
            let log = config.execution_log.as_deref().and_then(|p| {
                let loaded = load_table(p).and_then(|t| ExecutionLog::from_table(&t, &columns));
                report("execution log", p, loaded, |l| l.entries.len())
            });
            let records = config
                .detection_table
                .as_deref()
                .and_then(|p| {
                    let loaded = load_table(p).and_then(|t| detection::records_from_table(&t));
                    report("detection table", p, loaded, Vec::len)
                })
                .unwrap_or_default();
            (log, records)
        };

        let tickers = config.ticker_list.as_deref().and_then(|p| {
            let loaded = load_table(p).and_then(|t| {
                TickerTable::from_table(&t, TickerTable::NAME_COLUMN, TickerTable::CODE_COLUMN)
            });
            report("ticker list", p, loaded, TickerTable::len)
        });

        let translations = config
            .translation_dict
            .as_deref()
            .and_then(|p| report("translation dictionary", p, market::load_translations(p), BTreeMap::len))
            .unwrap_or_default();

        DataSet {
            execution_log,
            detections,
            tickers,
            translations,
        }
    }
}

/// Shared, read-only server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub data: Arc<DataSet>,
    pub pages: Arc<Pages>,
    pub users: Arc<dyn CredentialVerifier>,
    pub sessions: Arc<SessionStore>,
    pub quotes: Arc<dyn QuoteSource>,
}

impl AppState {
    pub fn new(
        config: Config,
        data: DataSet,
        users: Arc<dyn CredentialVerifier>,
        quotes: Arc<dyn QuoteSource>,
    ) -> Result<Self> {
        Ok(AppState {
            sessions: Arc::new(SessionStore::new(config.session_lifetime())),
            config: Arc::new(config),
            data: Arc::new(data),
            pages: Arc::new(Pages::new()?),
            users,
            quotes,
        })
    }
}

/// Build the router: public login routes and static files, plus every
/// other route behind [`login::require_auth`]
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/dashboard", get(dashboard))
        .route("/anomaly/:id", get(anomaly_page))
        .route("/anomaly/:id/boxplot.png", get(boxplot_png))
        .route("/anomaly/:id/scatter.png", get(scatter_png))
        .route("/download/*filename", get(download))
        .route("/my_images/*filename", get(my_image))
        .route("/kabu/:category", get(kabu_page))
        .route("/kabu/:category/trend.png", get(trend_png))
        .route_layer(middleware::from_fn_with_state(state.clone(), login::require_auth));

    Router::new()
        .route("/", get(login::login_page).post(login::handle_login))
        .route("/login", get(login::login_page).post(login::handle_login))
        .route("/logout", get(login::handle_logout))
        .nest_service("/static", ServeDir::new(&state.config.static_dir))
        .merge(protected)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;
    log::info!(
        "{} {} {} {:.1?}",
        method,
        path,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

/// Run blocking work (remote calls, chart drawing) off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

async fn png(fig: Figure) -> Result<Response> {
    let bytes = blocking(move || graph::render_png(&fig)).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

async fn dashboard(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Html<String>> {
    let view = DashboardView::new(&user, state.data.execution_log.as_ref());
    Ok(Html(state.pages.dashboard(&view)?))
}

#[derive(Debug, Deserialize)]
struct TestQuery {
    test: Option<String>,
}

impl TestQuery {
    fn selected(&self) -> Option<&str> {
        self.test.as_deref().filter(|t| !t.is_empty())
    }
}

async fn anomaly_page(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Query(query): Query<TestQuery>,
) -> Result<Html<String>> {
    let records = detection::filter_by_type(&state.data.detections, id);
    let view = AnomalyView::new(&user, id, &records, query.selected());
    Ok(Html(state.pages.anomaly(&view)?))
}

/// Scored records of one type, narrowed to one test when asked
fn scored<'a>(state: &'a AppState, id: i64, test: Option<&str>) -> Result<Vec<(&'a DetectionRecord, f64)>> {
    let rows = detection::filter_by_type(&state.data.detections, id)
        .into_iter()
        .filter(|r| test.is_none_or(|t| r.test == t))
        .filter_map(|r| r.score.map(|s| (r, s)))
        .collect::<Vec<_>>();

    if rows.is_empty() {
        return Err(DashError::NotFound(format!(
            "no scores for detection type {}",
            id
        )));
    }
    Ok(rows)
}

/// Per-product box plot of one test, or per-test counts across all tests
async fn boxplot_png(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TestQuery>,
) -> Result<Response> {
    let rows = scored(&state, id, query.selected())?;
    let scores = rows.iter().map(|(_, s)| *s).collect::<Vec<_>>();

    let fig = match query.selected() {
        Some(test) => {
            let products = rows.iter().map(|(r, _)| r.product.as_str()).collect::<Vec<_>>();
            graph::box_plot(&scores, Some(products.as_slice()), "product", test)?
        }
        None => {
            let tests = rows.iter().map(|(r, _)| r.test.as_str()).collect::<Vec<_>>();
            graph::box_plot_with_count(&scores, Some(tests.as_slice()), &detection::page_title(id))?
        }
    };
    png(fig).await
}

/// Scores in table order, coloured by judgement
async fn scatter_png(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TestQuery>,
) -> Result<Response> {
    let rows = scored(&state, id, query.selected())?;

    let x = (1..=rows.len()).map(|i| i as f64).collect::<Vec<_>>();
    let y = rows.iter().map(|(_, s)| *s).collect::<Vec<_>>();
    let judges = rows.iter().map(|(r, _)| r.judge.as_str()).collect::<Vec<_>>();
    let colors = HashMap::from([
        (Judgement::NORMAL_LABEL.to_string(), Rgb::GRAY),
        (Judgement::OVER_LABEL.to_string(), Rgb::BLUE),
        (Judgement::UNDER_LABEL.to_string(), Rgb::RED),
    ]);

    let fig = graph::scatter_plot(&x, &y, Some(judges.as_slice()), Some(&colors), "index", "score")?;
    png(fig).await
}

async fn read_served_file(base: &FsPath, requested: &str) -> Result<(String, Vec<u8>)> {
    let path = resolve_within(base, requested)?;
    let bytes = tokio::fs::read(&path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok((name, bytes))
}

/// Send a file from the files directory as an attachment
async fn download(State(state): State<AppState>, Path(filename): Path<String>) -> Result<Response> {
    let (name, bytes) = read_served_file(&state.config.files_dir, &filename).await?;
    let disposition = format!("attachment; filename*=UTF-8''{}", urlencoding::encode(&name));

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

fn image_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Serve a stored graph image inline
async fn my_image(State(state): State<AppState>, Path(filename): Path<String>) -> Result<Response> {
    let (name, bytes) = read_served_file(&state.config.graphs_dir, &filename).await?;
    Ok(([(header::CONTENT_TYPE, image_type(&name))], bytes).into_response())
}

#[derive(Debug, Deserialize)]
struct KabuQuery {
    name: Option<String>,
    period: Option<String>,
}

/// The requested listing, or the first one by name
fn selected_ticker<'a>(state: &'a AppState, name: Option<&str>) -> Option<&'a market::TickerRecord> {
    let tickers = state.data.tickers.as_ref()?;
    match name.filter(|n| !n.is_empty()) {
        Some(n) => tickers.get(n),
        None => tickers.first(),
    }
}

async fn kabu_page(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(category): Path<String>,
    Query(query): Query<KabuQuery>,
) -> Result<Html<String>> {
    let period = pages::clamp_period(query.period.as_deref());
    let ticker = selected_ticker(&state, query.name.as_deref());
    let mut view = KabuView::new(
        &user,
        &category,
        state.data.tickers.as_ref(),
        ticker.map(|t| t.name.as_str()),
        period,
    );

    if let Some(ticker) = ticker {
        let symbol = Symbol::from_code(&ticker.code, &state.config.market_suffix);
        log::info!("selected {} / {}", ticker.name, symbol);

        let quotes = state.quotes.clone();
        match blocking(move || quotes.info(&symbol)).await {
            Ok(info) => view.info = pages::info_rows(&info, &state.data.translations),
            Err(e) => {
                log::warn!("company info unavailable: {}", e);
                view.info_error = Some(format!("Company info unavailable: {}", e));
            }
        }
    }

    Ok(Html(state.pages.kabu(&view)?))
}

/// Opening prices over the requested period
async fn trend_png(
    State(state): State<AppState>,
    Path(_category): Path<String>,
    Query(query): Query<KabuQuery>,
) -> Result<Response> {
    let period = pages::clamp_period(query.period.as_deref());
    let ticker = selected_ticker(&state, query.name.as_deref()).ok_or_else(|| {
        DashError::NotFound(format!("ticker {}", query.name.as_deref().unwrap_or_default()))
    })?;
    let symbol = Symbol::from_code(&ticker.code, &state.config.market_suffix);

    let quotes = state.quotes.clone();
    let bars = blocking(move || quotes.history(&symbol, period)).await?;

    let (dates, opens): (Vec<_>, Vec<_>) = bars
        .iter()
        .filter_map(|b| b.open.map(|o| (b.date, o)))
        .unzip();
    if dates.is_empty() {
        return Err(DashError::Market(format!("no price history for {}", ticker.name)));
    }

    let fig = graph::trend_plot(&dates, &opens, "Trend plot", "Date", "Price")?;
    png(fig).await
}

/// Load data, users and templates, then serve until the process stops
pub async fn run(config: Config) -> Result<()> {
    let config = config.resolve();

    let users: Arc<dyn CredentialVerifier> = match UserStore::load(&config.users_file) {
        Ok(store) => {
            log::info!("loaded {} users from {}", store.len(), config.users_file.display());
            Arc::new(store)
        }
        Err(e) => {
            log::warn!("no users loaded, nobody can log in: {}", e);
            Arc::new(UserStore::default())
        }
    };
    let quotes = Arc::new(YahooQuotes::new(
        config.quote_base_url.clone(),
        config.quote_timeout(),
    ));

    let data = DataSet::load(&config);
    let bind = config.bind.clone();
    let app = router(AppState::new(config, data, users, quotes)?);

    let listener = TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    log::info!("Listening on http://{}", addr);
    if addr.ip().is_unspecified() {
        match local_ip_address::local_ip() {
            Ok(ip) => log::info!("On your network: http://{}:{}", ip, addr.port()),
            Err(e) => log::debug!("cannot determine LAN address: {}", e),
        }
    }

    axum::serve(listener, app).await?;
    Ok(())
}
