//! End-to-end fuzzing against a local target
//!
//! Each test starts an axum server on an ephemeral port that records every
//! request it receives, points a [`Fuzzer`] at it and checks what reached
//! the wire and what ended up in the artifact directory.

use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use oasfuzz::auth::SessionState;
use oasfuzz::contract::Contract;
use oasfuzz::fuzz::{FileArtifactSink, FuzzSettings, FuzzState, Fuzzer};
use oasfuzz::request::Credentials;

#[derive(Debug, Clone)]
struct SeenRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
}

#[derive(Clone, Default)]
struct Seen(Arc<Mutex<Vec<SeenRequest>>>);

impl Seen {
    fn all(&self) -> Vec<SeenRequest> {
        self.0.lock().clone()
    }
}

/// Target that answers every request with `status`. `POST /login` always
/// succeeds and sets a session cookie.
async fn serve(seen: Seen, status: StatusCode) -> String {
    let app = axum::Router::new().fallback(move |method: Method, uri: Uri, headers: HeaderMap| {
        let seen = seen.clone();
        async move {
            let path = uri.path().to_string();
            seen.0.lock().push(SeenRequest {
                method: method.clone(),
                path: path.clone(),
                headers,
            });
            respond(&method, &path, status)
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn respond(method: &Method, path: &str, status: StatusCode) -> Response {
    if method == Method::POST && path == "/login" {
        return (StatusCode::OK, [(SET_COOKIE, "sid=xyz; Path=/")], "ok").into_response();
    }
    if status == StatusCode::OK {
        (status, Json(json!({"id": 1}))).into_response()
    } else {
        (status, "not json").into_response()
    }
}

fn items_contract(extra: Value) -> Arc<Contract> {
    let mut document = json!({
        "openapi": "3.0.0",
        "info": {"title": "items", "version": "1"},
        "paths": {
            "/items/{id}": {
                "get": {
                    "parameters": [{
                        "name": "id",
                        "in": "path",
                        "required": true,
                        "schema": {"type": "integer"}
                    }],
                    "responses": {
                        "200": {
                            "description": "ok",
                            "content": {"application/json": {"schema": {"type": "object"}}}
                        }
                    }
                }
            },
            "/login": {
                "post": {"responses": {"200": {"description": "ok"}}}
            }
        }
    });
    if let (Some(target), Some(extra)) = (document.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    Arc::new(Contract::from_document(document).unwrap())
}

fn settings() -> FuzzSettings {
    FuzzSettings {
        progress: false,
        timeout: Duration::from_secs(5),
        seed: Some(7),
        exclude: Regex::new("login$|logout$").unwrap(),
        ..Default::default()
    }
}

fn artifacts(dir: &Path) -> Vec<Value> {
    let mut docs: Vec<Value> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
        })
        .collect();
    docs.sort_by_key(|doc| doc["time"].as_str().unwrap_or_default().to_string());
    docs
}

#[tokio::test]
async fn test_undeclared_status_produces_one_crash_artifact() {
    let seen = Seen::default();
    let target = serve(seen.clone(), StatusCode::NOT_FOUND).await;
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArtifactSink::new(out.path()).unwrap());

    let mut fuzzer = Fuzzer::new(
        items_contract(json!({})),
        &target,
        Credentials::default(),
        sink,
        settings(),
    )
    .unwrap();
    let report = fuzzer.run_cycle().await;

    assert_eq!(report.synthesized, 1);
    assert_eq!(report.crashed, 1);
    assert_eq!(report.passed, 0);

    let docs = artifacts(out.path());
    assert_eq!(docs.len(), 1);
    let crash = &docs[0];
    assert_eq!(crash["kind"], "crash");
    assert_eq!(crash["method"], "GET");
    assert_eq!(crash["status"], 404);
    assert_eq!(crash["response_body"], "not json");
    assert!(crash["response_validation"].is_string());

    let path_re = Regex::new(r"^/items/-?\d+$").unwrap();
    let path = crash["path"].as_str().unwrap();
    assert!(path_re.is_match(path), "unexpected path {path}");
    assert_eq!(seen.all()[0].path, path);
}

#[tokio::test]
async fn test_excluded_operations_never_reach_the_target() {
    let seen = Seen::default();
    let target = serve(seen.clone(), StatusCode::OK).await;
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArtifactSink::new(out.path()).unwrap());

    let mut fuzzer = Fuzzer::new(
        items_contract(json!({})),
        &target,
        Credentials::default(),
        sink,
        settings(),
    )
    .unwrap();
    for _ in 0..3 {
        fuzzer.run_cycle().await;
    }

    let seen = seen.all();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|r| r.method == Method::GET && r.path.starts_with("/items/")));
    assert!(artifacts(out.path()).is_empty());
}

#[tokio::test]
async fn test_api_key_alone_never_satisfies_bearer() {
    let seen = Seen::default();
    let target = serve(seen.clone(), StatusCode::OK).await;
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArtifactSink::new(out.path()).unwrap());

    let contract = items_contract(json!({
        "components": {
            "securitySchemes": {"bearerAuth": {"type": "http", "scheme": "bearer"}}
        },
        "security": [{"bearerAuth": []}]
    }));
    let credentials = Credentials {
        api_key: Some("k-123456".into()),
        ..Default::default()
    };
    let mut fuzzer = Fuzzer::new(contract, &target, credentials, sink, settings()).unwrap();
    fuzzer.run_cycle().await;

    let seen = seen.all();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].headers.get(AUTHORIZATION).is_none());
}

#[tokio::test]
async fn test_bearer_token_is_injected() {
    let seen = Seen::default();
    let target = serve(seen.clone(), StatusCode::OK).await;
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArtifactSink::new(out.path()).unwrap());

    let contract = items_contract(json!({
        "components": {
            "securitySchemes": {"bearerAuth": {"type": "http", "scheme": "bearer"}}
        },
        "security": [{"bearerAuth": []}]
    }));
    let credentials = Credentials {
        token: Some("tok-abc".into()),
        ..Default::default()
    };
    let mut fuzzer = Fuzzer::new(contract, &target, credentials, sink, settings()).unwrap();
    fuzzer.run_cycle().await;

    let seen = seen.all();
    assert_eq!(seen[0].headers[AUTHORIZATION], "Bearer tok-abc");
}

#[tokio::test]
async fn test_session_cookie_rides_along() {
    let seen = Seen::default();
    let target = serve(seen.clone(), StatusCode::OK).await;
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArtifactSink::new(out.path()).unwrap());

    let credentials = Credentials {
        username: Some("alice".into()),
        password: Some("pw".into()),
        ..Default::default()
    };
    let mut fuzzer = Fuzzer::new(
        items_contract(json!({})),
        &target,
        credentials,
        sink,
        settings(),
    )
    .unwrap();

    let session = fuzzer.establish_session("/login").await;
    assert!(matches!(session, SessionState::Established(_)));
    fuzzer.run_cycle().await;

    let item = seen
        .all()
        .into_iter()
        .find(|r| r.path.starts_with("/items/"))
        .unwrap();
    let cookie = item.headers[COOKIE].to_str().unwrap().to_string();
    assert!(cookie.contains("sid=xyz"), "cookie header was {cookie}");
}

#[tokio::test]
async fn test_run_stops_once_duration_has_elapsed() {
    let seen = Seen::default();
    let target = serve(seen.clone(), StatusCode::OK).await;
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(FileArtifactSink::new(out.path()).unwrap());

    let duration = Duration::from_millis(300);
    let mut fuzzer = Fuzzer::new(
        items_contract(json!({})),
        &target,
        Credentials::default(),
        sink,
        FuzzSettings {
            duration,
            detailed: true,
            ..settings()
        },
    )
    .unwrap();

    let summary = fuzzer.run().await.unwrap();
    assert_eq!(fuzzer.state(), FuzzState::Completed);
    assert!(summary.elapsed >= duration);
    assert!(summary.elapsed < duration + Duration::from_secs(10));
    assert!(summary.cycles >= 1);
    assert_eq!(summary.crashes, 0);
    assert_eq!(summary.sent, summary.passes);
    assert_eq!(summary.sent, seen.all().len());

    let docs = artifacts(out.path());
    assert_eq!(docs.len(), summary.passes);
    assert!(docs.iter().all(|doc| doc["kind"] == "test"));
}
