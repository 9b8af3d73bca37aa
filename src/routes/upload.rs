use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use tracing::info;

use crate::middleware::Owner;
use crate::models::{AppState, DatasetDetail};
use crate::types::{AppError, AppResult};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const MAX_NAME_CHARS: usize = 255;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/upload/", post(upload_dataset))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// Multipart form: `name` (dataset name) and `file` (the CSV).
async fn upload_dataset(
    State(state): State<AppState>,
    Owner(owner): Owner,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DatasetDetail>)> {
    let mut name: Option<String> = None;
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => {
                name = Some(field.text().await.map_err(|e| AppError::InvalidRequest(e.to_string()))?);
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(|e| AppError::InvalidRequest(e.to_string()))?;
                file = Some((filename, data));
            }
            _ => {}
        }
    }

    let name = check_name(name)?;
    let (filename, data) = file.ok_or_else(|| AppError::InvalidRequest("file: No file was submitted.".into()))?;
    if !filename.to_ascii_lowercase().ends_with(".csv") {
        return Err(AppError::InvalidRequest("file: Only CSV files are allowed.".into()));
    }

    info!(name = %name, owner = %owner, filename = %filename, bytes = data.len(), "Upload received");
    let detail = state.service.ingest_csv(&name, &owner, &filename, data).await?;

    Ok((StatusCode::CREATED, Json(detail)))
}

fn check_name(name: Option<String>) -> AppResult<String> {
    let name = name.map(|n| n.trim().to_string()).unwrap_or_default();
    if name.is_empty() {
        return Err(AppError::InvalidRequest("name: This field is required.".into()));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(AppError::InvalidRequest(format!(
            "name: Ensure this field has no more than {MAX_NAME_CHARS} characters."
        )));
    }
    Ok(name)
}
