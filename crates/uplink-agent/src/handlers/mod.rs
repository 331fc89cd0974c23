//! HTTP control surface

pub mod folders;
pub mod health;
pub mod objects;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uplink_core::{AgentSettings, CredentialBroker, RemoteStore, Supervisor};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<dyn RemoteStore>,
    pub broker: Arc<CredentialBroker>,
    pub settings: Arc<AgentSettings>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/list_directories", get(folders::list_directories))
        .route("/update_folders", post(folders::update_folders))
        .route("/get_folders", get(folders::get_folders))
        .route("/list_objects", get(objects::list_objects))
        .route("/list_s3_objects", get(objects::list_objects))
        .route("/download", get(objects::download))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
