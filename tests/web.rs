#![cfg(feature = "web")]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode, header};
use dashboard::app::{self, AppState, DataSet};
use dashboard::detection::{DETECTION_COLUMNS, records_from_table};
use dashboard::execlog::{ExecutionLog, LogColumns};
use dashboard::login::UserStore;
use dashboard::market::{CompanyInfo, PriceBar, QuoteSource, Symbol, TickerTable};
use dashboard::{Config, DashError, Result, Table};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct FakeQuotes {
    requested: Mutex<Vec<String>>,
}

impl QuoteSource for FakeQuotes {
    fn info(&self, symbol: &Symbol) -> Result<CompanyInfo> {
        self.requested.lock().unwrap().push(symbol.to_string());
        if symbol.as_str() == "9999.T" {
            return Err(DashError::Market("symbol delisted".into()));
        }
        let mut info = CompanyInfo::new();
        info.insert("longName".into(), serde_json::json!("Toyota Motor Corporation"));
        info.insert("currency".into(), serde_json::json!("JPY"));
        Ok(info)
    }

    fn history(&self, _symbol: &Symbol, _days: u32) -> Result<Vec<PriceBar>> {
        Ok(Vec::new())
    }
}

struct Fixture {
    _dir: TempDir,
    app: Router,
    quotes: Arc<FakeQuotes>,
}

fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
    Table::new(
        "fixture",
        columns.iter().map(|c| c.to_string()).collect(),
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect(),
    )
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let files = dir.path().join("files");
    let graphs = dir.path().join("graphs");
    fs::create_dir_all(&files).unwrap();
    fs::create_dir_all(graphs.join("data_0")).unwrap();
    fs::write(files.join("data_0.zip"), b"PK-archive").unwrap();
    fs::write(graphs.join("data_0").join("graph.png"), b"\x89PNG-bytes").unwrap();
    fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();

    let log = table(
        &["更新日", "異常検知種", "memo"],
        &[
            &["2024-01-03", "detectA", "third"],
            &["2024-01-01", "detectA", "first"],
            &["2024-01-02", "detectB", "second"],
        ],
    );
    let detections = table(
        &DETECTION_COLUMNS,
        &[
            &["1", "detectA", "P-alpha", "T1", "5", "OK", "1", "9", r"C:\out\data_0.zip", r"data\graphs\data_0\graph.png"],
            &["2", "detectA", "P-alpha", "T2", "11", "", "1", "9", "data_0.zip", ""],
            &["3", "detectB", "P-beta", "T1", "4", "OK", "1", "9", "data_1.zip", ""],
        ],
    );
    let tickers = table(
        &["コード", "銘柄名"],
        &[&["7203", "トヨタ自動車"], &["9999", "廃止銘柄"]],
    );

    let data = DataSet {
        execution_log: Some(ExecutionLog::from_table(&log, &LogColumns::default()).unwrap()),
        detections: records_from_table(&detections).unwrap(),
        tickers: Some(
            TickerTable::from_table(&tickers, TickerTable::NAME_COLUMN, TickerTable::CODE_COLUMN)
                .unwrap(),
        ),
        translations: BTreeMap::from([("longName".to_string(), "会社名".to_string())]),
    };

    let config = Config {
        files_dir: files,
        graphs_dir: graphs,
        static_dir: dir.path().join("static"),
        ..Config::default()
    };
    let users = Arc::new(UserStore::from_plain(&[("admin", "secret")]).unwrap());
    let quotes = Arc::new(FakeQuotes::default());
    let state = AppState::new(config, data, users, quotes.clone()).unwrap();

    Fixture {
        _dir: dir,
        app: app::router(state),
        quotes,
    }
}

impl Fixture {
    async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(c) = cookie {
            req = req.header(header::COOKIE, c);
        }
        self.app
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_login(&self, username: &str, password: &str) -> Response<Body> {
        let body = format!("username={}&password={}", username, password);
        let req = Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();
        self.app.clone().oneshot(req).await.unwrap()
    }

    /// Log in as the fixture user and return the `Cookie` header value
    async fn login(&self) -> String {
        let resp = self.post_login("admin", "secret").await;
        let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }
}

async fn body_text(resp: Response<Body>) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(resp: &Response<Body>) -> &str {
    resp.headers()[header::LOCATION].to_str().unwrap()
}

#[tokio::test]
async fn protected_routes_redirect_to_login() {
    let fx = fixture();
    for uri in ["/dashboard", "/anomaly/1", "/download/data_0.zip", "/my_images/data_0/graph.png", "/kabu/A"] {
        let resp = fx.get(uri, None).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER, "{}", uri);
        assert_eq!(location(&resp), "/login");
    }

    let resp = fx.get("/dashboard", Some("session=not-a-session")).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn login_form_is_public() {
    let fx = fixture();
    for uri in ["/", "/login"] {
        let resp = fx.get(uri, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("name=\"password\""));
    }
}

#[tokio::test]
async fn valid_login_sets_session_and_opens_dashboard() {
    let fx = fixture();
    let resp = fx.post_login("admin", "secret").await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/dashboard");

    let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.starts_with("session="));
    assert!(set_cookie.contains("HttpOnly"));

    let cookie = set_cookie.split(';').next().unwrap().to_string();
    let resp = fx.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let html = body_text(resp).await;
    assert!(html.contains("admin"));
    assert!(html.contains("first"));
    assert!(html.contains("●"));
    // sorted ascending: the 2024-01-01 row comes first
    assert!(html.find("first").unwrap() < html.find("third").unwrap());

    // a logged-in user skips the form
    let resp = fx.get("/login", Some(&cookie)).await;
    assert_eq!(location(&resp), "/dashboard");
}

#[tokio::test]
async fn invalid_login_shows_error_without_session() {
    let fx = fixture();
    let resp = fx.post_login("admin", "wrong").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
    assert!(body_text(resp).await.contains("Invalid username or password"));

    let resp = fx.post_login("", "").await;
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn unknown_detection_type_renders_undefined() {
    let fx = fixture();
    let cookie = fx.login().await;
    let resp = fx.get("/anomaly/99", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let html = body_text(resp).await;
    assert!(html.contains("Anomaly detection 99: undefined"));
    assert!(!html.contains("P-alpha"));
}

#[tokio::test]
async fn detail_page_shows_only_its_type() {
    let fx = fixture();
    let cookie = fx.login().await;

    let html = body_text(fx.get("/anomaly/1", Some(&cookie)).await).await;
    assert!(html.contains("Anomaly detection 1: ValueA"));
    assert!(html.contains("P-alpha"));
    assert!(!html.contains("P-beta"));
    assert!(html.contains("/download/data_0.zip"));
    assert!(html.contains("/my_images/data_0/graph.png"));
    assert!(html.contains("judge-over"));

    let html = body_text(fx.get("/anomaly/1?test=T2", Some(&cookie)).await).await;
    assert!(html.contains("/anomaly/1/scatter.png?test=T2"));
    assert_eq!(html.matches("<td>P-alpha</td>").count(), 1);
}

#[tokio::test]
async fn charts_without_data_are_not_found() {
    let fx = fixture();
    let cookie = fx.login().await;
    let resp = fx.get("/anomaly/99/boxplot.png", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = fx.get("/anomaly/1/scatter.png?test=missing", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn downloads_are_attachments_confined_to_files_dir() {
    let fx = fixture();
    let cookie = fx.login().await;

    let resp = fx.get("/download/data_0.zip", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment"));
    assert!(disposition.contains("data_0.zip"));
    assert_eq!(body_text(resp).await, "PK-archive");

    let resp = fx.get("/download/..%2Fsecret.txt", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = fx.get("/download/nothing.zip", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stored_images_are_served_inline() {
    let fx = fixture();
    let cookie = fx.login().await;

    let resp = fx.get("/my_images/data_0/graph.png", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    assert!(resp.headers().get(header::CONTENT_DISPOSITION).is_none());

    let resp = fx.get("/my_images/..%2Fsecret.txt", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn market_page_uses_selected_symbol() {
    let fx = fixture();
    let cookie = fx.login().await;

    let uri = format!("/kabu/A?name={}&period=3", urlencoding::encode("トヨタ自動車"));
    let resp = fx.get(&uri, Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let html = body_text(resp).await;
    assert!(html.contains("会社名"));
    assert!(html.contains("Toyota Motor Corporation"));
    // period below the minimum is raised to 7
    assert!(html.contains("value=\"7\""));
    assert_eq!(fx.quotes.requested.lock().unwrap().as_slice(), ["7203.T"]);
}

#[tokio::test]
async fn cleared_period_falls_back_to_default() {
    let fx = fixture();
    let cookie = fx.login().await;

    let uri = format!("/kabu/A?name={}&period=", urlencoding::encode("トヨタ自動車"));
    let resp = fx.get(&uri, Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let html = body_text(resp).await;
    assert!(html.contains("value=\"28\""));
    assert!(html.contains("period=28"));
}

#[tokio::test]
async fn market_errors_are_shown_inline() {
    let fx = fixture();
    let cookie = fx.login().await;

    let uri = format!("/kabu/A?name={}", urlencoding::encode("廃止銘柄"));
    let html = body_text(fx.get(&uri, Some(&cookie)).await).await;
    assert!(html.contains("Company info unavailable"));

    // empty history is a bad gateway, unknown names are not found
    let uri = format!("/kabu/A/trend.png?name={}", urlencoding::encode("トヨタ自動車"));
    let resp = fx.get(&uri, Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let resp = fx.get("/kabu/A/trend.png?name=nope", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logout_ends_the_session() {
    let fx = fixture();
    let cookie = fx.login().await;
    assert_eq!(fx.get("/dashboard", Some(&cookie)).await.status(), StatusCode::OK);

    let resp = fx.get("/logout", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&resp), "/login");

    let resp = fx.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
}
