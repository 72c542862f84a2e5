use std::collections::BTreeMap;

use aqicast::api::{AppState, router};
use aqicast::config::AppConfig;
use aqicast::model::{Estimator, ModelAdapter, ModelArtifact};
use aqicast::projector::{BALANCED_FEATURES, ModelFamily};
use aqicast::registry::ModelRegistry;
use aqicast::series::ObservationStore;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::{Value, json};
use tower::ServiceExt;

const CSV: &str = "\
State Name,county Name,State Code,County Code,Date,AQI,Category,Defining Parameter
Texas,Dallas,48,113,2024-03-01,40,Good,Ozone
Texas,Dallas,48,113,2024-03-02,42,Good,Ozone
Texas,Dallas,48,113,2024-03-03,45,Good,Ozone
Texas,Dallas,48,113,2024-03-04,50,Good,PM2.5
Texas,Dallas,48,113,2024-03-05,48,Good,Ozone
Texas,Dallas,48,113,2024-03-06,55,Moderate,Ozone
Texas,Dallas,48,113,2024-03-07,60,Moderate,Ozone
Texas,Dallas,48,113,2024-03-08,58,Moderate,Ozone
Texas,Dallas,48,113,2024-03-09,62,Moderate,Ozone
Texas,Dallas,48,113,2024-03-10,65,Moderate,Ozone
California,Kern,6,29,2024-03-08,90,Moderate,PM2.5
California,Kern,6,29,2024-03-09,95,Moderate,PM2.5
California,Kern,6,29,2024-03-10,101,Unhealthy for Sensitive Groups,PM2.5
";

fn app() -> Router {
    let store = ObservationStore::from_reader(CSV.as_bytes()).unwrap();
    let artifact = ModelArtifact {
        version: "20240311_000000".into(),
        family: ModelFamily::Balanced,
        feature_names: BALANCED_FEATURES
            .iter()
            .map(|key| key.name().to_string())
            .collect(),
        scaler: None,
        estimator: Estimator::Linear {
            intercept: 70.0,
            coefficients: vec![0.0; BALANCED_FEATURES.len()],
        },
        metrics: BTreeMap::from([("rmse".to_string(), 12.5), ("r2".to_string(), 0.61)]),
    };
    let mut registry = ModelRegistry::new();
    registry.insert(
        ModelAdapter::new("balanced", ModelFamily::Balanced.projector(), artifact).unwrap(),
    );
    router(AppState::new(AppConfig::default(), store, registry).unwrap())
}

async fn send(request: Request<Body>) -> (StatusCode, Value) {
    let response = app().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get(uri: &str) -> (StatusCode, Value) {
    send(Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post(uri: &str, body: Value) -> (StatusCode, Value) {
    send(
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn health_reports_loaded_model() {
    let (status, body) = get("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_loaded"], true);
    assert_eq!(body["database_connected"], false);
}

#[tokio::test]
async fn counties_are_sorted_by_state() {
    let (status, body) = get("/api/counties").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["counties"][0]["display_name"], "Kern, California");
    assert_eq!(body["counties"][1]["county"], "Dallas");
}

#[tokio::test]
async fn historical_returns_recent_rows() {
    let (status, body) = get("/api/aqi/historical?county=Dallas&state=Texas&days=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    assert_eq!(body["data"][2]["date"], "2024-03-10");
    assert_eq!(body["data"][2]["aqi"], 65);

    let (status, _) = get("/api/aqi/historical?county=Dallas").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn single_day_prediction_is_unwrapped() {
    let (status, body) = post(
        "/api/aqi/predict",
        json!({"county": "Dallas", "state": "Texas", "days": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["prediction"]["predicted_aqi"], 70.0);
    assert_eq!(body["prediction"]["predicted_category"], "Moderate");
    assert_eq!(body["prediction"]["county_name"], "Dallas");
    assert_eq!(body["forecast_date"], body["prediction"]["forecast_date"]);
    assert!(body.get("predictions").is_none());
}

#[tokio::test]
async fn multi_day_prediction_is_a_list() {
    let (status, body) = post(
        "/api/aqi/predict",
        json!({"county": "Dallas", "state": "Texas", "days": "7"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["forecast_days"], 7);
    assert_eq!(body["predictions"].as_array().unwrap().len(), 7);
}

#[rstest]
#[case(json!({"county": "Dallas", "state": "Texas", "days": 5}), StatusCode::BAD_REQUEST)]
#[case(json!({"county": "Dallas", "state": "Texas", "days": "week"}), StatusCode::BAD_REQUEST)]
#[case(json!({"state": "Texas"}), StatusCode::BAD_REQUEST)]
#[case(json!({"county": "Kern", "state": "California"}), StatusCode::BAD_REQUEST)]
#[case(json!({"county": "Harris", "state": "Texas"}), StatusCode::NOT_FOUND)]
#[case(json!({"county": "Dallas", "state": "Texas", "model": "prototype"}), StatusCode::SERVICE_UNAVAILABLE)]
#[tokio::test]
async fn prediction_failures_map_to_statuses(#[case] request: Value, #[case] expected: StatusCode) {
    let (status, body) = post("/api/aqi/predict", request).await;
    assert_eq!(status, expected);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some_and(|msg| !msg.is_empty()));
}

#[tokio::test]
async fn refresh_bundles_history_and_prediction() {
    let (status, body) = post(
        "/api/aqi/refresh",
        json!({"county": "Dallas", "state": "Texas", "days": 3, "history_days": 5}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["historical"]["count"], 5);
    assert_eq!(body["prediction"]["forecast_days"], 3);
}

#[tokio::test]
async fn metrics_and_categories() {
    let (status, body) = get("/api/model/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_type"], "balanced");
    assert_eq!(body["version"], "20240311_000000");
    assert_eq!(body["metrics"]["rmse"], 12.5);

    let (status, _) = get("/api/model/metrics?model=prototype").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = get("/api/categories").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["categories"]["Good"]["range"], json!([0, 50]));
    assert_eq!(body["categories"]["Hazardous"]["color"], "#7E0023");
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let (status, body) = get("/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"success": false, "error": "Endpoint not found"}));
}
