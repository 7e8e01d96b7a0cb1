//! HTTP request handlers

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{debug, error};

use crate::app::state::DeployStatus;
use crate::deploy::template::RouteInfo;
use crate::filesys::file::File;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "pfdeploy".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Deployments response
#[derive(Debug, Serialize)]
pub struct DeploymentsResponse {
    pub deployments: Vec<DeployStatus>,
    pub active: usize,
    pub total: usize,
}

/// State table snapshot
pub async fn deployments_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let deployments = state.registry.snapshot();
    let active = deployments.iter().filter(|d| d.active).count();
    let total = deployments.len();

    Json(DeploymentsResponse {
        deployments,
        active,
        total,
    })
}

/// Routes response
#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    pub routes: Vec<RouteEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RouteEntry {
    pub file: String,
    #[serde(flatten)]
    pub route: RouteInfo,
}

/// Routes currently published through the proxy
pub async fn routes_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, StatusCode> {
    if !state.sites_dir.exists().await {
        return Ok(Json(RoutesResponse {
            routes: Vec::new(),
            total: 0,
        }));
    }

    let files = state
        .sites_dir
        .list_files_with_suffix(".conf")
        .await
        .map_err(|e| {
            error!("Cannot list {}: {}", state.sites_dir.path().display(), e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let mut routes = Vec::new();
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !file_name.starts_with("site_") {
            continue;
        }

        let text = match File::new(&path).read_string().await {
            Ok(text) => text,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if let Some(route) = RouteInfo::from_config(&text) {
            routes.push(RouteEntry {
                file: file_name,
                route,
            });
        }
    }

    let total = routes.len();
    Ok(Json(RoutesResponse { routes, total }))
}
