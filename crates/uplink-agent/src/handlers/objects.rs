//! Remote object handlers

use super::AppState;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use uplink_core::credentials::CredentialSnapshot;
use uplink_core::store::StoreError;
use uplink_core::CredentialBroker;

#[derive(Debug, Serialize)]
pub struct ObjectEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: String,
}

/// Run `op` with the current credentials, rotating them once if the store
/// rejects them
async fn with_rotation<T, F, Fut>(broker: &CredentialBroker, op: F) -> Result<T, StoreError>
where
    F: Fn(CredentialSnapshot) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let snapshot = broker.get();
    let observed = snapshot.version;

    match op(snapshot).await {
        Err(e) if e.is_auth() => {
            tracing::warn!(version = observed, "Credentials rejected: {}. Refreshing", e);
            match broker.refresh(observed).await {
                Ok(fresh) => op(fresh).await,
                Err(refresh_err) => {
                    tracing::error!("Credential refresh failed: {}", refresh_err);
                    Err(e)
                }
            }
        }
        other => other,
    }
}

/// Objects in the configured default bucket
pub async fn list_objects(
    State(state): State<AppState>,
) -> Result<Json<Vec<ObjectEntry>>, (StatusCode, Json<serde_json::Value>)> {
    let store = &state.store;
    let bucket = state.settings.bucket.as_str();
    let listed = with_rotation(&state.broker, |snapshot| async move {
        store.list(&snapshot, bucket).await
    })
    .await;

    match listed {
        Ok(objects) => {
            tracing::info!("Found {} objects in {}", objects.len(), state.settings.bucket);
            Ok(Json(
                objects
                    .into_iter()
                    .map(|o| ObjectEntry {
                        key: o.key,
                        last_modified: o.last_modified.to_rfc3339(),
                    })
                    .collect(),
            ))
        }
        Err(e) => {
            tracing::error!("Error listing objects: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    filename: Option<String>,
}

/// Fetch an object, keep a copy under the download directory and return it
/// as an attachment
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, (StatusCode, String)> {
    let key = match query.filename.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => {
            tracing::error!("Filename not provided");
            return Err((StatusCode::BAD_REQUEST, "Filename not provided".to_string()));
        }
    };
    let local_name = Path::new(key)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or((StatusCode::BAD_REQUEST, "Invalid filename".to_string()))?
        .to_string();

    let store = &state.store;
    let bucket = state.settings.bucket.as_str();
    let data = with_rotation(&state.broker, |snapshot| async move {
        store.get(&snapshot, bucket, key).await
    })
    .await
    .map_err(|e| match e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, format!("Object not found: {}", key)),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error downloading file: {}", other),
        ),
    })?;
    tracing::info!("Downloaded {} from {}", key, state.settings.bucket);

    let download_dir = &state.settings.download_dir;
    let saved = async {
        tokio::fs::create_dir_all(download_dir).await?;
        tokio::fs::write(download_dir.join(&local_name), &data).await
    }
    .await;
    if let Err(e) = saved {
        tracing::warn!("Failed to keep a copy of {}: {}", key, e);
    }

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", local_name),
            ),
        ],
        data,
    )
        .into_response())
}
