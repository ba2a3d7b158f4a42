//! HTTP surface: REST API, install-progress streaming and the module
//! reverse proxy.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{any, delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::ModuleError;
use crate::installer::Installer;
use crate::registry::Registry;
use crate::task::TaskStore;

/// Upload limit for module archives.
const MAX_ARCHIVE_BYTES: usize = 200 * 1024 * 1024;

/// SSE keep-alive interval so intermediary proxies do not drop idle
/// streams.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub installer: Arc<Installer>,
    pub tasks: Arc<TaskStore>,
    pub http_client: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/modules", get(list_modules))
        .route("/api/modules/install/github", post(install_github))
        .route("/api/modules/install/archive", post(install_archive))
        .route("/api/modules/install/:id/stream", get(stream_task))
        .route("/api/modules/:name/activate", post(activate_module))
        .route("/api/modules/:name/deactivate", post(deactivate_module))
        .route("/api/modules/:name", delete(delete_module))
        .route("/api/navigation", get(navigation))
        .route("/module-proxy/:name", any(proxy_root))
        .route("/module-proxy/:name/*path", any(proxy_sub))
        .layer(DefaultBodyLimit::max(MAX_ARCHIVE_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_modules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

async fn navigation(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.nav_items().await)
}

#[derive(Debug, Deserialize)]
struct GitHubInstallRequest {
    url: String,
}

async fn install_github(
    State(state): State<AppState>,
    Json(req): Json<GitHubInstallRequest>,
) -> Result<impl IntoResponse, ModuleError> {
    let url = req.url.trim().to_string();
    if url.is_empty() {
        return Err(ModuleError::Validation {
            field: "url",
            reason: "repository URL is required".into(),
        });
    }
    let task = state
        .installer
        .install_from_github(url, CancellationToken::new())
        .await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task.id }))))
}

async fn install_archive(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ModuleError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ModuleError::Validation {
            field: "file",
            reason: e.to_string(),
        }
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if !filename.ends_with(".zip") {
            return Err(ModuleError::Validation {
                field: "file",
                reason: "only .zip archives are accepted".into(),
            });
        }
        let bytes = field.bytes().await.map_err(|e| ModuleError::Validation {
            field: "file",
            reason: e.to_string(),
        })?;
        let tmp = std::env::temp_dir().join(format!("modhost-upload-{}.zip", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;

        let task = state
            .installer
            .install_from_archive(tmp, CancellationToken::new())
            .await;
        return Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task.id }))));
    }
    Err(ModuleError::Validation {
        field: "file",
        reason: "multipart field 'file' is missing".into(),
    })
}

/// Replay the task's buffered lines, then forward live ones until the
/// terminal line arrives. Dropping the connection only ends the stream; the
/// underlying install keeps running.
async fn stream_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ModuleError> {
    let task = state
        .tasks
        .get(&id)
        .await
        .ok_or_else(|| ModuleError::TaskNotFound(id.clone()))?;

    // Subscribe before snapshotting so nothing falls between replay and
    // live delivery.
    let rx = task.subscribe();
    let (buffered, _) = task.snapshot().await;

    let stream = async_stream::stream! {
        let mut last_seq = None;
        let mut finished = false;
        for event in buffered {
            last_seq = Some(event.seq);
            finished = event.line.done;
            let data = serde_json::to_string(&event.line).unwrap_or_default();
            yield Ok::<Event, Infallible>(Event::default().data(data));
        }
        let mut rx = rx;
        while !finished {
            match rx.recv().await {
                Ok(event) if last_seq.is_some_and(|s| event.seq <= s) => continue,
                Ok(event) => {
                    finished = event.line.done;
                    let data = serde_json::to_string(&event.line).unwrap_or_default();
                    yield Ok(Event::default().data(data));
                }
                // Live delivery is best-effort; the buffer kept the history.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

async fn activate_module(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ModuleError> {
    state.registry.activate(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deactivate_module(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ModuleError> {
    state.registry.deactivate(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_module(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ModuleError> {
    state.registry.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn proxy_root(
    State(state): State<AppState>,
    Path(name): Path<String>,
    req: Request,
) -> Response {
    forward(state, name, String::new(), req).await
}

async fn proxy_sub(
    State(state): State<AppState>,
    Path((name, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    forward(state, name, format!("/{}", rest), req).await
}

/// Forward method, headers and body to the module's loopback port and relay
/// the response unmodified.
async fn forward(state: AppState, name: String, sub_path: String, req: Request) -> Response {
    let query = req.uri().query().map(str::to_string);
    let target = match state
        .registry
        .proxy_target(&name, &sub_path, query.as_deref())
        .await
    {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_ARCHIVE_BYTES).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = state.http_client.request(method, &target).body(body.to_vec());
    for (key, value) in parts.headers.iter() {
        if key == header::HOST {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes());
    }

    let upstream = match builder.send().await {
        Ok(r) => r,
        Err(_) => return (StatusCode::BAD_GATEWAY, "module unreachable").into_response(),
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    for (key, value) in upstream.headers().iter() {
        // Hop-by-hop and length headers are recomputed by the server.
        let skip = matches!(
            key.as_str(),
            "connection" | "transfer-encoding" | "content-length"
        );
        if !skip {
            response = response.header(key.as_str(), value.as_bytes());
        }
    }
    let bytes = upstream.bytes().await.unwrap_or_default();
    response
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::UnsafeEntryPolicy;
    use crate::store::ModuleStore;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleStore::open_in_memory().unwrap();
        let registry = Registry::new(dir.path().to_path_buf(), store);
        let tasks = TaskStore::new();
        let installer = Installer::new(registry.clone(), tasks.clone(), UnsafeEntryPolicy::Skip);
        let state = AppState {
            registry,
            installer,
            tasks,
            http_client: reqwest::Client::new(),
        };
        (router(state), dir)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _dir) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn test_stream_unknown_task_is_404() {
        let (app, _dir) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/modules/install/no-such-task/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_unknown_module_is_unavailable() {
        let (app, _dir) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/module-proxy/ghost/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_install_github_requires_url() {
        let (app, _dir) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/modules/install/github")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"url":"  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
