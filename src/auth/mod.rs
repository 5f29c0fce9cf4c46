//! Session authentication
//!
//! Logs in once before fuzzing starts and hands the resulting session
//! cookies to every synthesized request. Failure is never fatal: the
//! fuzzer proceeds unauthenticated and the state says why.

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::contract::{join_paths, Contract, HttpMethod};
use crate::request::{normalize_target_url, Credentials};

/// Used when neither configuration nor the contract names a login endpoint
pub const DEFAULT_LOGIN_PATH: &str = "/api/v3/user/login";

const LOGIN_PATH_PATTERNS: &[&str] = &[
    "/login",
    "/users/login",
    "/user/login",
    "/api/login",
    "/auth/login",
    "/users/v1/login",
    "/api/v3/user/login",
];

const LOGIN_OPERATION_TERMS: &[&str] = &["login", "authenticate"];

/// One cookie obtained from the login response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
}

/// Outcome of the login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No username/password supplied; no login was attempted
    NotConfigured,
    /// Login was attempted and failed
    Unavailable(String),
    Established(Vec<SessionCookie>),
}

impl SessionState {
    /// Cookies to attach to every request (empty unless established)
    pub fn cookies(&self) -> &[SessionCookie] {
        match self {
            SessionState::Established(cookies) => cookies,
            _ => &[],
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established(_))
    }
}

/// POST `{"username", "password"}` to `target + login_path` and collect
/// the session cookies from a `200` response
pub async fn login(
    client: &reqwest::Client,
    credentials: &Credentials,
    target: &str,
    login_path: &str,
) -> SessionState {
    let Some((username, password)) = credentials.basic() else {
        debug!("no username/password supplied, skipping login");
        return SessionState::NotConfigured;
    };

    let url = format!("{}{}", normalize_target_url(target), login_path);
    let body = serde_json::json!({
        "username": username,
        "password": password,
    });

    let response = match client
        .post(&url)
        .header(ACCEPT, "application/json")
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "login request failed, fuzzing unauthenticated");
            return SessionState::Unavailable(format!("login request failed: {}", e));
        }
    };

    let status = response.status();
    if status != StatusCode::OK {
        warn!(url = %url, status = %status, "login rejected, fuzzing unauthenticated");
        return SessionState::Unavailable(format!("login returned HTTP {}", status));
    }

    let cookies: Vec<SessionCookie> = response
        .cookies()
        .map(|c| SessionCookie {
            name: c.name().to_string(),
            value: c.value().to_string(),
        })
        .collect();

    info!(url = %url, cookies = cookies.len(), "session established");
    SessionState::Established(cookies)
}

/// First `POST` operation that looks like a login endpoint, by path or by
/// operation id
pub fn detect_login_path(contract: &Contract) -> Option<&str> {
    for (path, item) in &contract.paths {
        let Some(item) = item else { continue };
        let Some(post) = item.operation(HttpMethod::Post) else {
            continue;
        };

        let lower_path = path.to_lowercase();
        if LOGIN_PATH_PATTERNS.iter().any(|p| lower_path.contains(p)) {
            return Some(path);
        }

        let by_id = post.operation_id.as_deref().is_some_and(|id| {
            let id = id.to_lowercase();
            LOGIN_OPERATION_TERMS.iter().any(|term| id.contains(term))
        });
        if by_id {
            return Some(path);
        }
    }
    None
}

/// Resolve the login path: configured value verbatim, else the detected
/// endpoint under the contract base path, else [`DEFAULT_LOGIN_PATH`]
pub fn resolve_login_path(contract: &Contract, configured: Option<&str>) -> String {
    if let Some(path) = configured.filter(|p| !p.is_empty()) {
        return path.to_string();
    }
    match detect_login_path(contract) {
        Some(path) => {
            info!(path, "detected login endpoint");
            join_paths(&contract.base_path(), path)
        }
        None => {
            warn!(path = DEFAULT_LOGIN_PATH, "no login endpoint found in contract, using default");
            DEFAULT_LOGIN_PATH.to_string()
        }
    }
}
