//! HTTP command surface for the presentation layer.
//!
//! Command intents come in as JSON over loopback HTTP, status flows back
//! out; the daemon neither knows nor cares what kind of frontend is on the
//! other side. Errors map through [`ManagerError`]'s status codes.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::manager::error::ManagerError;
use crate::manager::{InstallSource, RegisterSpec, ServerManager};

// ─── Request / response types ────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerJarRequest {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EulaRequest {
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleQuery {
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionsQuery {
    #[serde(default)]
    pub stable_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub success: bool,
}

// ─── Server ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct IpcServer {
    pub manager: Arc<ServerManager>,
    pub listen_addr: String,
}

impl IpcServer {
    pub fn new(manager: Arc<ServerManager>, listen_addr: &str) -> Self {
        Self {
            manager,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/instances", get(list_instances).post(register_instance))
            .route(
                "/api/instance/:id",
                get(get_instance).delete(delete_instance),
            )
            .route("/api/instance/:id/start", post(start_instance))
            .route("/api/instance/:id/stop", post(stop_instance))
            .route("/api/instance/:id/install", post(install_content))
            .route("/api/instance/:id/server-jar", post(install_server_jar))
            .route("/api/instance/:id/command", post(send_command))
            .route("/api/instance/:id/console", get(get_console))
            .route("/api/instance/:id/stats", get(get_stats))
            .route(
                "/api/instance/:id/config",
                get(get_config).put(put_config),
            )
            .route("/api/instance/:id/eula", axum::routing::put(put_eula))
            .route("/api/versions", get(list_versions))
            .layer(TraceLayer::new_for_http())
            .with_state(self.manager.clone())
    }

    pub async fn start(self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

// ─── Handlers ────────────────────────────────────────────────

async fn list_instances(State(manager): State<Arc<ServerManager>>) -> Json<Value> {
    let instances = manager.list().await;
    Json(json!({ "instances": instances }))
}

async fn register_instance(
    State(manager): State<Arc<ServerManager>>,
    Json(spec): Json<RegisterSpec>,
) -> Result<Json<Value>, ManagerError> {
    let record = manager.register(spec).await?;
    Ok(Json(json!({ "success": true, "instance": record })))
}

async fn get_instance(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ManagerError> {
    let status = manager.status(&id).await?;
    Ok(Json(json!(status)))
}

async fn delete_instance(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ManagerError> {
    manager.remove(&id).await?;
    Ok(Json(OkResponse { success: true }))
}

async fn start_instance(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ManagerError> {
    let pid = manager.start(&id).await?;
    Ok(Json(json!({ "success": true, "pid": pid })))
}

async fn stop_instance(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Result<Json<Value>, ManagerError> {
    let timeout = body
        .and_then(|Json(req)| req.timeout_secs)
        .map(Duration::from_secs);
    let outcome = manager.stop(&id, timeout).await?;
    Ok(Json(json!({ "success": true, "outcome": outcome })))
}

async fn install_content(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    Json(source): Json<InstallSource>,
) -> Result<Json<Value>, ManagerError> {
    let task = manager.install_content(&id, source).await?;
    Ok(Json(json!({ "success": true, "task": task })))
}

async fn install_server_jar(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    body: Option<Json<ServerJarRequest>>,
) -> Result<Json<Value>, ManagerError> {
    let version = body.and_then(|Json(req)| req.version);
    let task = manager.install_server_jar(&id, version.as_deref()).await?;
    Ok(Json(json!({ "success": true, "task": task })))
}

async fn send_command(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<OkResponse>, ManagerError> {
    manager.send_command(&id, &req.command).await?;
    Ok(Json(OkResponse { success: true }))
}

async fn get_console(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    Query(query): Query<ConsoleQuery>,
) -> Result<Json<Value>, ManagerError> {
    let lines = match query.since {
        Some(since) => manager.console_since(&id, since).await?,
        None => {
            manager
                .recent_console(&id, query.limit.unwrap_or(100))
                .await?
        }
    };
    Ok(Json(json!({ "lines": lines })))
}

async fn get_stats(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ManagerError> {
    let usage = manager.stats(&id).await?;
    Ok(Json(json!(usage)))
}

async fn get_config(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ManagerError> {
    let cfg = manager.get_config(&id).await?;
    let map: BTreeMap<&str, &str> = cfg.entries().collect();
    Ok(Json(json!({ "config": map })))
}

async fn put_config(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    Json(entries): Json<BTreeMap<String, String>>,
) -> Result<Json<OkResponse>, ManagerError> {
    let mut cfg = ServerConfig::new();
    for (key, value) in entries {
        cfg.set(key, value);
    }
    manager.put_config(&id, &cfg).await?;
    Ok(Json(OkResponse { success: true }))
}

async fn put_eula(
    State(manager): State<Arc<ServerManager>>,
    Path(id): Path<String>,
    Json(req): Json<EulaRequest>,
) -> Result<Json<OkResponse>, ManagerError> {
    manager.set_eula(&id, req.accepted).await?;
    Ok(Json(OkResponse { success: true }))
}

async fn list_versions(
    State(manager): State<Arc<ServerManager>>,
    Query(query): Query<VersionsQuery>,
) -> Result<Json<Value>, ManagerError> {
    let versions = manager.list_versions(query.stable_only).await?;
    Ok(Json(json!({ "versions": versions })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_server() -> (IpcServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let global = crate::config::GlobalConfig {
            data_dir: Some(dir.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        let manager = Arc::new(ServerManager::new(&global));
        manager.initialize().await.unwrap();
        (IpcServer::new(manager, "127.0.0.1:0"), dir)
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_instances_empty() {
        let (server, _dir) = test_server().await;
        let response = server
            .router()
            .oneshot(Request::get("/api/instances").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_then_duplicate_conflicts() {
        let (server, _dir) = test_server().await;
        let router = server.router();

        let response = router
            .clone()
            .oneshot(json_post("/api/instances", r#"{"name":"survival"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(json_post("/api/instances", r#"{"name":"survival"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_404() {
        let (server, _dir) = test_server().await;
        let router = server.router();

        let response = router
            .clone()
            .oneshot(
                Request::get("/api/instance/no-such-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(json_post("/api/instance/no-such-id/start", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_console_on_stopped_instance_is_empty_ok() {
        let (server, _dir) = test_server().await;
        let router = server.router();

        let response = router
            .clone()
            .oneshot(json_post(
                "/api/instances",
                r#"{"name":"survival","accept_eula":true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let id = {
            let list = server.manager.list().await;
            list[0].id.clone()
        };
        let response = router
            .oneshot(
                Request::get(format!("/api/instance/{}/console", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
