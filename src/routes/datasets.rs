use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::info;

use crate::middleware::Owner;
use crate::models::{AnalyticsSnapshot, AppState, DatasetDetail, DatasetId, DatasetSummary, EquipmentRecord};
use crate::report::{render_pdf, ReportData};
use crate::types::{AppError, AppResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/datasets/", get(list_datasets))
        .route("/api/datasets/{id}/", get(get_dataset).delete(delete_dataset))
        .route("/api/datasets/{id}/analytics/", get(get_analytics))
        .route("/api/datasets/{id}/equipment/", get(get_equipment))
        .route("/api/datasets/{id}/report/", get(get_report))
        .route("/api/datasets/{id}/download-report/", get(download_report))
        .route("/api/datasets/{id}/file/", get(download_raw_file))
}

async fn list_datasets(
    State(state): State<AppState>,
    _owner: Owner,
) -> AppResult<Json<Vec<DatasetSummary>>> {
    let datasets = state.service.list().await?;
    Ok(Json(datasets.into_iter().map(DatasetSummary::from).collect()))
}

async fn get_dataset(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<i64>,
) -> AppResult<Json<DatasetDetail>> {
    Ok(Json(state.service.detail(DatasetId(id)).await?))
}

async fn delete_dataset(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    state.service.delete(DatasetId(id)).await?;
    info!(dataset_id = id, owner = %owner, "Dataset removed via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_analytics(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<i64>,
) -> AppResult<Json<AnalyticsSnapshot>> {
    Ok(Json(state.service.analytics(DatasetId(id)).await?))
}

async fn get_equipment(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<EquipmentRecord>>> {
    Ok(Json(state.service.equipment(DatasetId(id)).await?))
}

async fn get_report(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<i64>,
) -> AppResult<Json<ReportData>> {
    Ok(Json(state.service.report(DatasetId(id)).await?))
}

async fn download_report(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let report = state.service.report(DatasetId(id)).await?;
    let pdf = render_pdf(&report, chrono::Utc::now())
        .map_err(|e| AppError::Internal(format!("Error generating report: {e}")))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", report.filename()),
            ),
        ],
        pdf,
    ))
}

async fn download_raw_file(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let (dataset, data) = state.service.raw_file(DatasetId(id)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"dataset_{}.csv\"", dataset.id),
            ),
        ],
        data,
    ))
}
