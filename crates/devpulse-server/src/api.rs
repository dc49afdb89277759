//! HTTP API surface of the relay server.
//!
//! All profile content endpoints authenticate with the transport hash carried
//! in the request body; status polling and the public diff read are the only
//! anonymous reads, and neither exposes anything but hashes or deliberately
//! published plaintext.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use devpulse_shared::protocol::{
    ChangePasswordRequest, ChangePasswordResponse, ContentRequest, ContentResponse,
    DeleteProfileRequest, PublicDiffResponse, RegisterProfileRequest, RegisterProfileResponse,
    StatusQuery, StatusResponse, SyncRequest, SyncResponse,
};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/profiles/register", post(register_profile))
        .route("/profiles/:id/status", get(profile_status))
        .route("/profiles/:id/content", post(fetch_content))
        .route("/profiles/:id/sync", post(sync_content))
        .route("/profiles/:id/password", post(change_password))
        .route("/profiles/:id", delete(delete_profile))
        .route("/diffs/:id/public", get(public_diff))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn register_profile(
    State(state): State<AppState>,
    Json(req): Json<RegisterProfileRequest>,
) -> Result<Json<RegisterProfileResponse>, ApiError> {
    if req.id.is_empty() || req.password_hash.is_empty() {
        return Err(ApiError::BadRequest(
            "Profile id and password hash are required".into(),
        ));
    }

    state.storage.register_profile(&req)?;
    Ok(Json(RegisterProfileResponse { id: req.id }))
}

/// Hash-only staleness poll. Anonymous: reveals collection digests, never
/// content.
async fn profile_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    Ok(Json(state.storage.status(&id, &query)?))
}

async fn fetch_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ContentRequest>,
) -> Result<Json<ContentResponse>, ApiError> {
    state.storage.authenticate(&id, &req.password_hash)?;
    Ok(Json(state.storage.fetch_content(&id, &req)?))
}

async fn sync_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    state.storage.authenticate(&id, &req.password_hash)?;
    Ok(Json(state.storage.apply_sync(&id, &req)?))
}

async fn change_password(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<ChangePasswordResponse>, ApiError> {
    state.storage.authenticate(&id, &req.old_password_hash)?;
    state.storage.replace_all_content(&id, &req)?;
    Ok(Json(ChangePasswordResponse { success: true }))
}

async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DeleteProfileRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.storage.authenticate(&id, &req.password_hash)?;
    state.storage.delete_profile(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn public_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PublicDiffResponse>, ApiError> {
    Ok(Json(state.storage.public_diff(&id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpulse_shared::types::ProfileMetadata;

    fn test_state() -> AppState {
        AppState {
            storage: Arc::new(Storage::in_memory().unwrap()),
            rate_limiter: RateLimiter::new(1000.0, 1000.0),
            config: Arc::new(ServerConfig::default()),
        }
    }

    #[tokio::test]
    async fn register_rejects_empty_id() {
        let state = test_state();
        let result = register_profile(
            State(state),
            Json(RegisterProfileRequest {
                id: String::new(),
                name: "dev".into(),
                password_hash: "hash".into(),
                encrypted_api_key: "a2V5".into(),
                salt: "c2FsdA==".into(),
                metadata: ProfileMetadata::default(),
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn register_then_status() {
        let state = test_state();
        register_profile(
            State(state.clone()),
            Json(RegisterProfileRequest {
                id: "p1".into(),
                name: "dev".into(),
                password_hash: "hash".into(),
                encrypted_api_key: "a2V5".into(),
                salt: "c2FsdA==".into(),
                metadata: ProfileMetadata::default(),
            }),
        )
        .await
        .unwrap();

        let Json(status) = profile_status(
            State(state),
            Path("p1".into()),
            Query(StatusQuery::default()),
        )
        .await
        .unwrap();

        // Fresh profile with no content: both hashes empty, nothing to sync.
        assert!(!status.needs_sync);
        assert!(status.server_diffs_hash.is_none());
    }

    #[tokio::test]
    async fn content_requires_valid_password() {
        let state = test_state();
        register_profile(
            State(state.clone()),
            Json(RegisterProfileRequest {
                id: "p1".into(),
                name: "dev".into(),
                password_hash: "hash".into(),
                encrypted_api_key: "a2V5".into(),
                salt: "c2FsdA==".into(),
                metadata: ProfileMetadata::default(),
            }),
        )
        .await
        .unwrap();

        let result = fetch_content(
            State(state),
            Path("p1".into()),
            Json(ContentRequest {
                password_hash: "wrong".into(),
                diffs_hash: None,
                stars_hash: None,
                keys_hash: None,
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::AuthInvalid { .. })));
    }
}
