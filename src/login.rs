#![cfg(not(tarpaulin_include))]

use crate::error::{DashError, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::collections::HashMap;
use std::path::Path;

#[cfg(feature = "web")]
use crate::app::AppState;
#[cfg(feature = "web")]
use axum::{
    Form,
    extract::{Request, State},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
#[cfg(feature = "web")]
use axum_extra::extract::cookie::{Cookie, CookieJar};
#[cfg(feature = "web")]
use serde::Deserialize;
#[cfg(feature = "web")]
use std::sync::{PoisonError, RwLock};
#[cfg(feature = "web")]
use std::time::{Duration, SystemTime};
#[cfg(feature = "web")]
use uuid::Uuid;

/// Name of the cookie carrying the session id
pub const SESSION_COOKIE: &str = "session";

/// Message shown on the login page after a failed attempt
pub const LOGIN_FAILED: &str = "Invalid username or password";

/// Anything that can check a username/password pair
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Users loaded from a JSON file mapping user names to argon2 hashes
///
/// ```json
/// { "admin": "$argon2id$v=19$m=19456,t=2,p=1$..." }
/// ```
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: HashMap<String, String>,
}

impl UserStore {
    /// Read the users file
    ///
    /// # Errors
    /// * `DashError::NotFound` if the file does not exist
    /// * `DashError::Json` if it is not a JSON object of strings
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DashError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let users: HashMap<String, String> = serde_json::from_str(&content)?;

        for (name, hash) in &users {
            if PasswordHash::new(hash).is_err() {
                log::warn!("user `{}` has a malformed password hash and cannot log in", name);
            }
        }
        Ok(UserStore { users })
    }

    /// Build a store from plaintext pairs, hashing each password
    pub fn from_plain(pairs: &[(&str, &str)]) -> Result<Self> {
        let users = pairs
            .iter()
            .map(|(user, pass)| Ok((user.to_string(), hash_password(pass)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(UserStore { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialVerifier for UserStore {
    fn verify(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let Some(hash) = self.users.get(username) else {
            return false;
        };
        verify_password(password, hash).unwrap_or_else(|e| {
            log::warn!("cannot verify `{}`: {}", username, e);
            false
        })
    }
}

/// Hash a password with Argon2id and a random salt
///
/// # Arguments
/// * `password` - The plaintext password
///
/// # Returns
/// * The PHC-format hash string stored in the users file
///
/// # Errors
/// * `DashError::PasswordHash` if hashing fails
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DashError::PasswordHash(e.to_string()))
}

/// Check a password against a stored hash
///
/// # Arguments
/// * `password` - The submitted plaintext password
/// * `hash` - A PHC-format argon2 hash from the users file
///
/// # Returns
/// * `Ok(true)` on a match, `Ok(false)` for a wrong password; only a
///   malformed hash is an error
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| DashError::PasswordHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// An authenticated user session
#[cfg(feature = "web")]
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub expires_at: SystemTime,
}

/// In-memory sessions keyed by the cookie value
#[cfg(feature = "web")]
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    lifetime: Duration,
}

#[cfg(feature = "web")]
impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            lifetime,
        }
    }

    /// Start a session and return its id; expired sessions are dropped
    pub fn create(&self, username: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let now = SystemTime::now();

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(
            id.clone(),
            Session {
                username: username.to_string(),
                expires_at: now + self.lifetime,
            },
        );
        id
    }

    /// User name of a live session
    pub fn validate(&self, id: &str) -> Option<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(id)
            .filter(|s| s.expires_at > SystemTime::now())
            .map(|s| s.username.clone())
    }

    pub fn remove(&self, id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }
}

/// User name of the authenticated request, set by [`require_auth`]
#[cfg(feature = "web")]
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

/// Login form fields
#[cfg(feature = "web")]
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[cfg(feature = "web")]
fn session_user(state: &AppState, jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .and_then(|c| state.sessions.validate(c.value()))
}

/// Show the login form, or go straight to the dashboard with a live session
#[cfg(feature = "web")]
pub async fn login_page(State(state): State<AppState>, jar: CookieJar) -> Result<Response> {
    if session_user(&state, &jar).is_some() {
        return Ok(Redirect::to("/dashboard").into_response());
    }
    Ok(Html(state.pages.login(None, "")?).into_response())
}

/// Check submitted credentials
///
/// Success stores a session, sets the cookie and redirects to the
/// dashboard. Failure renders the form again with an error message and
/// leaves the cookie jar untouched.
#[cfg(feature = "web")]
pub async fn handle_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response> {
    let username = form.username.trim();

    if !state.users.verify(username, &form.password) {
        log::warn!("failed login for `{}`", username);
        return Ok(Html(state.pages.login(Some(LOGIN_FAILED), username)?).into_response());
    }

    let session_id = state.sessions.create(username);
    let max_age = time::Duration::seconds(state.sessions.lifetime().as_secs() as i64);
    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .max_age(max_age);

    log::info!("`{}` logged in", username);
    Ok((jar.add(cookie), Redirect::to("/dashboard")).into_response())
}

/// End the session and clear the cookie
#[cfg(feature = "web")]
pub async fn handle_logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value());
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Redirect::to("/login"),
    )
}

/// Authentication middleware for every protected route
///
/// # Arguments
/// * `state` - Application state holding the session store
/// * `jar` - Request cookies, searched for [`SESSION_COOKIE`]
/// * `request`, `next` - The request and the rest of the stack
///
/// # Returns
/// * The inner response with a [`CurrentUser`] extension set for a live
///   session, otherwise a redirect to `/login`
#[cfg(feature = "web")]
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    match session_user(&state, &jar) {
        Some(username) => {
            request.extensions_mut().insert(CurrentUser(username));
            next.run(request).await
        }
        None => Redirect::to("/login").into_response(),
    }
}
