//! Folder configuration handlers

use super::{api_error, ApiError, AppState};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::PathBuf;
use uplink_core::{FolderSet, UplinkError};

const DEFAULT_LIST_ROOT: &str = "/data";

#[derive(Debug, Deserialize)]
pub struct ListDirectoriesQuery {
    path: Option<String>,
}

/// Names of the subdirectories of `path`
pub async fn list_directories(
    Query(query): Query<ListDirectoriesQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let path = PathBuf::from(query.path.as_deref().unwrap_or(DEFAULT_LIST_ROOT));
    tracing::info!("Listing directories in {}", path.display());

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(api_error(StatusCode::NOT_FOUND, "Path does not exist"));
    }

    let mut entries = tokio::fs::read_dir(&path).await.map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => {
            tracing::error!("Permission error: {}", e);
            api_error(StatusCode::FORBIDDEN, format!("Permission error: {}", e))
        }
        ErrorKind::NotFound => api_error(StatusCode::NOT_FOUND, "Path does not exist"),
        _ => {
            tracing::error!("Error listing directories: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    })?;

    let mut directories = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                // follows symlinks
                let is_dir = tokio::fs::metadata(entry.path())
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    directories.push(entry.file_name().to_string_lossy().to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Error listing directories: {}", e);
                return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
            }
        }
    }
    directories.sort();

    tracing::debug!("Found directories: {:?}", directories);
    Ok(Json(directories))
}

#[derive(Debug, Deserialize)]
pub struct UpdateFoldersRequest {
    #[serde(default)]
    upload_folders: Vec<PathBuf>,
    #[serde(default)]
    purge_folders: Vec<PathBuf>,
}

pub async fn update_folders(
    State(state): State<AppState>,
    Json(request): Json<UpdateFoldersRequest>,
) -> Result<Json<Value>, ApiError> {
    let folders = FolderSet::new(request.upload_folders, request.purge_folders);

    match state.supervisor.update_folders(folders).await {
        Ok(applied) => {
            tracing::info!(
                "Updated folders: upload={:?}, purge={:?}",
                applied.upload_folders,
                applied.purge_folders
            );
            Ok(Json(json!({ "message": "Folders updated successfully" })))
        }
        Err(UplinkError::InvalidConfig(msg)) => Err(api_error(StatusCode::BAD_REQUEST, msg)),
        Err(e) => {
            tracing::error!("Failed to update folders: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn get_folders(State(state): State<AppState>) -> Json<FolderSet> {
    Json(state.supervisor.get_folders().await)
}
