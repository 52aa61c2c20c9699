//! HTTP handlers for folder operations. Each maps onto one `JarStore` call.

use crate::{errors::AppError, models::folder::Folder, state::AppState};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Body for `POST /folders`. A missing or empty name gets the default.
#[derive(Debug, Default, Deserialize)]
pub struct CreateFolderReq {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameFolderReq {
    pub name: String,
}

/// `GET /folders`: every folder, by name.
pub async fn list_folders(State(state): State<AppState>) -> Result<Json<Vec<Folder>>, AppError> {
    Ok(Json(state.store.list_folders().await?))
}

/// `POST /folders`
pub async fn create_folder(
    State(state): State<AppState>,
    payload: Option<Json<CreateFolderReq>>,
) -> Result<impl IntoResponse, AppError> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let folder = state.store.create_folder(&req.name).await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// `PATCH /folders/{id}`
pub async fn rename_folder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameFolderReq>,
) -> Result<Json<Folder>, AppError> {
    Ok(Json(state.store.rename_folder(id, &req.name).await?))
}

/// `DELETE /folders/{id}`: removes the folder and all of its items.
pub async fn delete_folder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.store.delete_folder(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
