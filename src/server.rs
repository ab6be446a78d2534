// HTTP control surface
//
// GET  /version                -> build and uptime information
// POST /api/agent/syncConfig   -> request a registry sync as soon as possible

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::manager::TaskManager;

#[derive(Clone)]
pub struct AppState {
    manager: Arc<TaskManager>,
    started: Instant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub build_time: String,
    pub commit: String,
    pub uptime: String,
    pub rust_version: String,
}

impl VersionInfo {
    fn new(uptime: Duration) -> Self {
        VersionInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
            commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            uptime: humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string(),
            rust_version: option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string(),
        }
    }
}

pub fn router(manager: Arc<TaskManager>) -> Router {
    let state = AppState {
        manager,
        started: Instant::now(),
    };
    Router::new()
        .route("/version", get(version))
        .route("/api/agent/syncConfig", post(sync_config))
        .with_state(state)
}

async fn version(State(state): State<AppState>) -> Json<VersionInfo> {
    Json(VersionInfo::new(state.started.elapsed()))
}

async fn sync_config(State(state): State<AppState>) -> &'static str {
    if !state.manager.trigger_sync() {
        debug!("sync already pending, request coalesced");
    }
    "OK"
}

/// Serves `router` on `addr` until `shutdown` resolves.
pub async fn serve(addr: &str, router: Router, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Control surface listening on {}", listener.local_addr()?);
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskStore;
    use crate::testutil::FakeRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn manager() -> Arc<TaskManager> {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        Arc::new(TaskManager::new("agent-1", store, Arc::new(FakeRegistry::default())).unwrap())
    }

    async fn body(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_version() {
        let response = router(manager())
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let info: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["buildTime"].is_string());
        assert!(info["rustVersion"].is_string());
        assert_eq!(info["uptime"], "0s");
    }

    #[tokio::test]
    async fn test_sync_config_coalesces() {
        let manager = manager();
        let app = router(manager.clone());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(Request::post("/api/agent/syncConfig").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body(response).await, b"OK");
        }
        // both requests share the one pending slot
        assert!(!manager.trigger_sync());
    }
}
