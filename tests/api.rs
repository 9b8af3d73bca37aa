use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use tower::ServiceExt;

use equipment_analytics::config::{AuthMode, Config};
use equipment_analytics::pipeline::IngestService;
use equipment_analytics::storage::MemoryBlobStore;
use equipment_analytics::store::{MemoryStore, RetentionPolicy};
use equipment_analytics::{create_router, AppState};

const BOUNDARY: &str = "----equipment-analytics-test";
const SCENARIO_CSV: &str = "Equipment Name,Type,Flowrate,Pressure,Temperature\n\
    Pump-1,Pump,120,5.2,110\n\
    Compressor-1,Compressor,95,8.4,95\n\
    Valve-1,Valve,60,4.1,105\n";

fn app_with(config: Config) -> Router {
    let store = MemoryStore::new(Arc::new(MemoryBlobStore::new()), config.retention.policy());
    let service = IngestService::new(Arc::new(store), config.report.preview_limit);
    create_router(AppState { service, config })
}

fn app() -> Router {
    app_with(Config::default())
}

fn upload_request(name: &str, filename: &str, csv: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"name\"\r\n\r\n\
         {name}\r\n\
         --{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/csv\r\n\r\n\
         {csv}\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri("/api/upload/")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .header("x-user", "alice")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).header("x-user", "alice").body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    let json = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, json)
}

#[tokio::test]
async fn test_upload_returns_created_dataset_with_analytics() {
    let app = app();
    let (status, body) = send_json(&app, upload_request("Plant A", "plant.csv", SCENARIO_CSV)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "Plant A");
    assert_eq!(body["uploaded_by"], "alice");
    assert_eq!(body["total_equipment"], 3);
    assert!((body["avg_pressure"].as_f64().unwrap() - 5.9).abs() < 1e-9);
    assert!((body["avg_flowrate"].as_f64().unwrap() - 91.666_666_666_666_67).abs() < 1e-9);
    assert_eq!(body["equipment_types"]["Valve"], 1);
    assert_eq!(body["equipment_records"].as_array().unwrap().len(), 3);
    assert_eq!(body["equipment_records"][0]["equipment_name"], "Compressor-1");

    let id = body["id"].as_i64().unwrap();
    let (status, analytics) = send_json(&app, get(&format!("/api/datasets/{id}/analytics/"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(analytics["total_equipment"], 3);
    assert_eq!(analytics["min_flowrate"], 60.0);
    assert_eq!(analytics["max_temperature"], 110.0);
}

#[tokio::test]
async fn test_missing_column_is_bad_request() {
    let app = app();
    let csv = "Equipment Name,Type,Flowrate,Temperature\nPump-1,Pump,120,110\n";
    let (status, body) = send_json(&app, upload_request("bad", "bad.csv", csv)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required columns: Pressure");

    let (_, list) = send_json(&app, get("/api/datasets/")).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_non_csv_upload_rejected() {
    let app = app();
    let (status, body) = send_json(&app, upload_request("x", "plant.xlsx", SCENARIO_CSV)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Only CSV files"));
}

#[tokio::test]
async fn test_sixth_upload_evicts_first() {
    let app = app();
    let mut ids = Vec::new();
    for i in 0..6 {
        let (status, body) =
            send_json(&app, upload_request(&format!("ds-{i}"), "plant.csv", SCENARIO_CSV)).await;
        assert_eq!(status, StatusCode::CREATED);
        ids.push(body["id"].as_i64().unwrap());
    }

    let (_, list) = send_json(&app, get("/api/datasets/")).await;
    let listed: Vec<i64> = list.as_array().unwrap().iter().map(|d| d["id"].as_i64().unwrap()).collect();
    let expected: Vec<i64> = ids[1..].iter().rev().copied().collect();
    assert_eq!(listed, expected);

    let (status, body) = send_json(&app, get(&format!("/api/datasets/{}/", ids[0]))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_uploads_always_answer_created() {
    let mut config = Config::default();
    config.retention.max_datasets = 1;
    let app = app_with(config);

    let mut handles = Vec::new();
    for i in 0..200 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            send_json(&app, upload_request(&format!("ds-{i}"), "plant.csv", SCENARIO_CSV)).await
        }));
    }
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::CREATED, "upload answered {body}");
        assert_eq!(body["total_equipment"], 3);
        assert_eq!(body["equipment_records"].as_array().unwrap().len(), 3);
        assert_eq!(body["equipment_records"][0]["equipment_name"], "Compressor-1");
    }

    let (_, list) = send_json(&app, get("/api/datasets/")).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_then_not_found() {
    let app = app();
    let (_, body) = send_json(&app, upload_request("Plant A", "plant.csv", SCENARIO_CSV)).await;
    let id = body["id"].as_i64().unwrap();

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/datasets/{id}/"))
            .header("x-user", "alice")
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_report_and_downloads() {
    let app = app();
    let (_, body) = send_json(&app, upload_request("Plant A", "plant.csv", SCENARIO_CSV)).await;
    let id = body["id"].as_i64().unwrap();

    let (status, report) = send_json(&app, get(&format!("/api/datasets/{id}/report/"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["total_records"], 3);
    assert_eq!(report["truncated"], false);
    assert_eq!(report["records"][2]["equipment_name"], "Valve-1");

    let response = app.clone().oneshot(get(&format!("/api/datasets/{id}/download-report/"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"report_Plant_A.pdf\""
    );
    let pdf = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(pdf.starts_with(b"%PDF"));

    let (status, raw) = send(&app, get(&format!("/api/datasets/{id}/file/"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(raw, SCENARIO_CSV.as_bytes());
}

#[tokio::test]
async fn test_basic_auth_required() {
    let mut config = Config::default();
    config.auth.mode = AuthMode::Basic;
    config.auth.users = HashMap::from([("alice".to_string(), "s3cret".to_string())]);
    let app = app_with(config);

    let (status, _) = send(&app, get("/api/datasets/")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/datasets/")
        .header(header::AUTHORIZATION, format!("Basic {}", BASE64.encode("alice:s3cret")))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_reports_backend() {
    let (status, body) = send_json(&app(), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");
    assert_eq!(body["retention_limit"], 5);
}
