//! HTTP handlers for jar items.
//! File bytes travel base64-encoded in JSON bodies or as multipart uploads;
//! raw content is served from `/items/{id}/content`, streamed from disk for
//! out-of-line payloads.

use crate::{
    errors::AppError,
    models::item::{Item, ItemKind, ItemPayload, ItemUpdate, KindInfo, NewItem},
    services::query::filter_items,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListItemsQuery {
    pub q: Option<String>,
}

/// Body for `POST /folders/{id}/items`.
#[derive(Debug, Deserialize)]
pub struct CreateItemReq {
    pub key: String,
    pub kind: ItemKind,
    pub text_value: Option<String>,
    pub file_name: Option<String>,
    /// File bytes, standard base64.
    pub file_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteItemsReq {
    pub ids: Vec<Uuid>,
}

/// `GET /kinds`: kinds creatable on this device.
pub async fn list_kinds(State(state): State<AppState>) -> Json<Vec<KindInfo>> {
    Json(
        ItemKind::available(&state.capabilities)
            .into_iter()
            .map(KindInfo::from)
            .collect(),
    )
}

/// `GET /folders/{id}/items?q=`: newest first, filtered when `q` is given.
pub async fn list_items(
    State(state): State<AppState>,
    Path(folder_id): Path<Uuid>,
    Query(query): Query<ListItemsQuery>,
) -> Result<Json<Vec<Item>>, AppError> {
    let items = state.store.list_items(folder_id).await?;
    let items = match query.q.as_deref() {
        Some(q) => filter_items(items, q),
        None => items,
    };
    Ok(Json(items))
}

/// `POST /folders/{id}/items`
pub async fn create_item(
    State(state): State<AppState>,
    Path(folder_id): Path<Uuid>,
    Json(req): Json<CreateItemReq>,
) -> Result<impl IntoResponse, AppError> {
    let file_bytes = req
        .file_base64
        .as_deref()
        .map(|encoded| {
            general_purpose::STANDARD
                .decode(encoded)
                .map(Bytes::from)
                .map_err(|e| AppError::bad_request(format!("file_base64 is not valid base64: {}", e)))
        })
        .transpose()?;

    let new = NewItem {
        key: req.key,
        kind: req.kind,
        text_value: req.text_value,
        file_name: req.file_name,
        file_bytes,
    };
    let item = insert(&state, folder_id, new).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// `POST /folders/{id}/items/upload`: multipart form with `key`, `kind`
/// and either `text` or a `file` part.
pub async fn upload_item(
    State(state): State<AppState>,
    Path(folder_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut key = None;
    let mut kind = None;
    let mut text_value = None;
    let mut file_name = None;
    let mut file_bytes = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "key" => key = Some(field_text(field).await?),
            "kind" => {
                let raw = field_text(field).await?;
                kind = Some(parse_kind(&raw)?);
            }
            "text" => text_value = Some(field_text(field).await?),
            "file" => {
                file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                file_bytes = Some(bytes);
            }
            other => tracing::debug!("ignoring multipart field `{}`", other),
        }
    }

    let kind = kind.ok_or_else(|| AppError::bad_request("missing `kind` field"))?;
    let new = NewItem {
        key: key.unwrap_or_default(),
        kind,
        text_value,
        file_name,
        file_bytes,
    };
    let item = insert(&state, folder_id, new).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// `GET /items/{id}`
pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Item>, AppError> {
    Ok(Json(state.store.get_item(id).await?))
}

/// `PATCH /items/{id}`: only the fields present are changed.
pub async fn update_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<ItemUpdate>,
) -> Result<Json<Item>, AppError> {
    Ok(Json(state.store.update_item(id, update).await?))
}

/// `DELETE /items/{id}`
pub async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.store.delete_item(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /items/delete`: remove several items at once, all or nothing.
pub async fn delete_items(
    State(state): State<AppState>,
    Json(req): Json<DeleteItemsReq>,
) -> Result<StatusCode, AppError> {
    state.store.delete_items(&req.ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /items/{id}/content`: the raw payload. Text is served as UTF-8,
/// files as an attachment.
pub async fn get_item_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let item = state.store.get_item(id).await?;

    let body = match item.blob_path.as_deref() {
        Some(path) => {
            let file = state
                .store
                .blobs()
                .open(path)
                .await
                .map_err(|e| AppError::internal(format!("could not open payload: {}", e)))?;
            Body::from_stream(ReaderStream::new(file))
        }
        None => match state.store.read_payload(id).await? {
            ItemPayload::Text(text) => Body::from(text),
            ItemPayload::File { bytes, .. } => Body::from(bytes),
        },
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_content_headers(response.headers_mut(), &item);
    Ok(response)
}

async fn insert(state: &AppState, folder_id: Uuid, new: NewItem) -> Result<Item, AppError> {
    if !ItemKind::available(&state.capabilities).contains(&new.kind) {
        return Err(AppError::bad_request(format!(
            "{} items cannot be created on this device",
            new.kind
        )));
    }
    Ok(state.store.create_item(folder_id, new).await?)
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))
}

fn parse_kind(raw: &str) -> Result<ItemKind, AppError> {
    ItemKind::ALL
        .into_iter()
        .find(|kind| kind.label().eq_ignore_ascii_case(raw.trim()))
        .ok_or_else(|| AppError::bad_request(format!("unknown item kind `{}`", raw)))
}

fn set_content_headers(headers: &mut HeaderMap, item: &Item) {
    let content_type = if item.kind.is_text() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    };
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));

    if !item.kind.is_text() {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&item.size_bytes.max(0).to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }

    if let Some(checksum) = item.checksum.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", checksum)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(name) = item.file_name.as_deref() {
        let safe: String = name
            .chars()
            .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
            .collect();
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
}
