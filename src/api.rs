//! HTTP surface: JSON routes over the observation store, registry and forecaster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::handler::HandlerWithoutStateExt;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::category::{AqiCategory, CategoryMapper};
use crate::config::AppConfig;
use crate::error::{ForecastError, Result};
use crate::forecast::{ForecastOutcome, ForecastStep, IterativeForecaster, validate_horizon};
use crate::registry::ModelRegistry;
use crate::series::{EntityId, ObservationSource, ObservationStore};

const DATA_SOURCE: &str = "csv";
const DEFAULT_DAYS: i64 = 1;
const DEFAULT_HISTORY_DAYS: usize = 30;

/// Shared, read-only services behind every handler.
pub struct Services {
    pub config: AppConfig,
    pub store: ObservationStore,
    pub registry: ModelRegistry,
    pub mapper: CategoryMapper,
}

#[derive(Clone)]
pub struct AppState(Arc<Services>);

impl AppState {
    pub fn new(config: AppConfig, store: ObservationStore, registry: ModelRegistry) -> Result<Self> {
        let mapper = CategoryMapper::new(config.forecast.uncertainty_sigma)?;
        Ok(Self(Arc::new(Services {
            config,
            store,
            registry,
            mapper,
        })))
    }

    /// Loads the observation CSV and every configured model.
    pub fn bootstrap(config: AppConfig) -> Result<Self> {
        let store = ObservationStore::load_csv(&config.data.path)?;
        let registry = ModelRegistry::from_entries(&config.models)?;
        Self::new(config, store, registry)
    }

    pub fn services(&self) -> &Services {
        &self.0
    }

    fn forecaster(&self) -> IterativeForecaster<'_> {
        IterativeForecaster::new(&self.0.registry, self.0.mapper.clone())
    }
}

/// JSON error body `{success: false, error}` with an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        let status = match &err {
            ForecastError::InvalidHorizon { .. } | ForecastError::InsufficientHistory { .. } => {
                StatusCode::BAD_REQUEST
            }
            ForecastError::UnknownEntity(_) => StatusCode::NOT_FOUND,
            ForecastError::ModelNotLoaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"success": false, "error": self.message})),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct PredictRequest {
    county: Option<String>,
    state: Option<String>,
    model: Option<String>,
    days: Option<Value>,
    history_days: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    county: Option<String>,
    state: Option<String>,
    days: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    model: Option<String>,
}

/// Integer-like values only: `3`, `3.0`, `"3"`. Anything else is rejected.
fn parse_integer(value: Option<&Value>, default: i64) -> Option<i64> {
    match value {
        None | Some(Value::Null) => Some(default),
        Some(Value::Number(number)) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|v| v.is_finite() && v.fract() == 0.0)
                .map(|v| v as i64)
        }),
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        Some(_) => None,
    }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_days(value: Option<&Value>) -> std::result::Result<i64, ApiError> {
    let days = parse_integer(value, DEFAULT_DAYS).ok_or_else(|| {
        ApiError::bad_request(format!(
            "Invalid 'days' parameter: '{}'. Must be an integer.",
            display_value(value)
        ))
    })?;
    validate_horizon(days)?;
    Ok(days)
}

fn parse_request(body: &Bytes) -> std::result::Result<PredictRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(PredictRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("Invalid JSON body: {err}")))
}

fn require_entity(
    county: Option<&str>,
    state: Option<&str>,
    message: &str,
) -> std::result::Result<EntityId, ApiError> {
    match (
        county.map(str::trim).filter(|v| !v.is_empty()),
        state.map(str::trim).filter(|v| !v.is_empty()),
    ) {
        (Some(county), Some(state)) => Ok(EntityId::new(county, state)),
        _ => Err(ApiError::bad_request(message)),
    }
}

fn prediction_item(step: &ForecastStep, entity: &EntityId) -> Value {
    let mut item = serde_json::to_value(step).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut item {
        map.insert("county_name".into(), json!(entity.county));
        map.insert("state_name".into(), json!(entity.state));
    }
    item
}

fn prediction_body(entity: &EntityId, outcome: &ForecastOutcome) -> Value {
    match outcome {
        ForecastOutcome::Single(step) => json!({
            "success": true,
            "county": entity.county,
            "state": entity.state,
            "forecast_date": step.forecast_date(),
            "prediction": prediction_item(step, entity),
        }),
        ForecastOutcome::Multi(steps) => json!({
            "success": true,
            "county": entity.county,
            "state": entity.state,
            "forecast_days": steps.len(),
            "predictions": steps
                .iter()
                .map(|step| prediction_item(step, entity))
                .collect::<Vec<_>>(),
        }),
    }
}

/// Shared by predict and refresh: resolve the model, then forecast from the recent window.
fn run_forecast(
    state: &AppState,
    entity: &EntityId,
    model_key: &str,
    days: i64,
) -> std::result::Result<ForecastOutcome, ApiError> {
    let services = state.services();
    if services.registry.get_model(model_key).is_none() {
        return Err(ForecastError::ModelNotLoaded {
            model_key: model_key.to_string(),
        }
        .into());
    }
    let outcome = state.forecaster().forecast_entity(
        &services.store,
        entity,
        services.config.data.window_days,
        days,
        model_key,
        Utc::now().date_naive(),
    )?;
    Ok(outcome)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let services = state.services();
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "model_loaded": services.registry.is_loaded(&services.config.forecast.default_model),
        "database_connected": false,
    }))
}

async fn counties(State(state): State<AppState>) -> Json<Value> {
    info!(operation = "ingestion", "Fetching counties");
    let counties: Vec<Value> = state
        .services()
        .store
        .entities()
        .into_iter()
        .map(|entity| {
            json!({
                "county": entity.county,
                "state": entity.state,
                "display_name": entity.display_name(),
            })
        })
        .collect();
    info!(operation = "ingestion", count = counties.len(), "Counties retrieved");
    Json(json!({
        "success": true,
        "count": counties.len(),
        "counties": counties,
        "source": DATA_SOURCE,
    }))
}

async fn historical(State(state): State<AppState>, Query(query): Query<HistoricalQuery>) -> ApiResult {
    let days = match query.days.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_HISTORY_DAYS,
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request(format!("Invalid 'days' parameter: '{raw}'. Must be an integer."))
        })?,
    };
    info!(
        operation = "validation",
        county = query.county.as_deref().unwrap_or_default(),
        state = query.state.as_deref().unwrap_or_default(),
        days,
        "Historical request"
    );
    let entity = require_entity(
        query.county.as_deref(),
        query.state.as_deref(),
        "County and state parameters are required",
    )?;

    let data = state.services().store.history(&entity, days)?;
    info!(operation = "ingestion", rows = data.len(), "Historical rows returned");
    Ok(Json(json!({
        "success": true,
        "county": entity.county,
        "state": entity.state,
        "days": days,
        "count": data.len(),
        "data": data,
        "source": DATA_SOURCE,
    })))
}

async fn predict(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let started = Instant::now();
    let request = parse_request(&body)?;
    let days = parse_days(request.days.as_ref())?;
    let model_key = request
        .model
        .clone()
        .unwrap_or_else(|| state.services().config.forecast.default_model.clone());
    info!(
        operation = "validation",
        county = request.county.as_deref().unwrap_or_default(),
        state = request.state.as_deref().unwrap_or_default(),
        model = %model_key,
        days,
        "Prediction request"
    );
    let entity = require_entity(
        request.county.as_deref(),
        request.state.as_deref(),
        "County and state are required",
    )?;

    let outcome = run_forecast(&state, &entity, &model_key, days)?;
    info!(
        operation = "prediction",
        elapsed_ms = started.elapsed().as_millis() as u64,
        days,
        "Prediction completed"
    );
    Ok(Json(prediction_body(&entity, &outcome)))
}

async fn refresh(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request = parse_request(&body)?;
    let days = parse_days(request.days.as_ref())?;
    let history_days = parse_integer(request.history_days.as_ref(), DEFAULT_HISTORY_DAYS as i64)
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "Invalid 'history_days' parameter: '{}'. Must be a non-negative integer.",
                display_value(request.history_days.as_ref())
            ))
        })?;
    let model_key = request
        .model
        .clone()
        .unwrap_or_else(|| state.services().config.forecast.default_model.clone());
    info!(
        operation = "validation",
        county = request.county.as_deref().unwrap_or_default(),
        state = request.state.as_deref().unwrap_or_default(),
        model = %model_key,
        days,
        "Refresh request"
    );
    let entity = require_entity(
        request.county.as_deref(),
        request.state.as_deref(),
        "County and state are required",
    )?;

    info!(operation = "ingestion", "Refreshing historical data");
    let historical = state.services().store.history(&entity, history_days)?;
    info!(operation = "prediction", "Refreshing prediction");
    let outcome = run_forecast(&state, &entity, &model_key, days)?;

    Ok(Json(json!({
        "success": true,
        "county": entity.county,
        "state": entity.state,
        "timestamp": Utc::now().to_rfc3339(),
        "historical": {
            "success": true,
            "county": entity.county,
            "state": entity.state,
            "count": historical.len(),
            "data": historical,
            "source": DATA_SOURCE,
        },
        "prediction": prediction_body(&entity, &outcome),
    })))
}

async fn model_metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> ApiResult {
    let services = state.services();
    let model_key = query
        .model
        .unwrap_or_else(|| services.config.forecast.default_model.clone());
    info!(operation = "validation", model = %model_key, "Metrics request");
    let artifact = services
        .registry
        .get_model(&model_key)
        .and_then(|model| model.artifact())
        .filter(|artifact| !artifact.metrics.is_empty())
        .ok_or_else(|| ApiError::not_found(format!("No metrics available for {model_key} model")))?;
    Ok(Json(json!({
        "success": true,
        "model_type": model_key,
        "metrics": artifact.metrics,
        "version": artifact.version,
    })))
}

async fn categories() -> Json<Value> {
    let categories: Map<String, Value> = AqiCategory::ALL
        .iter()
        .map(|category| {
            let (lower, upper) = category.bounds();
            (
                category.label().to_string(),
                json!({"range": [lower as i64, upper as i64], "color": category.color()}),
            )
        })
        .collect();
    Json(json!({"success": true, "categories": categories}))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Endpoint not found")
}

pub fn router(state: AppState) -> Router {
    let server = &state.services().config.server;
    let timeout = Duration::from_secs(server.request_timeout_secs);
    let static_dir = server.static_dir.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/counties", get(counties))
        .route("/api/aqi/historical", get(historical))
        .route("/api/aqi/predict", post(predict))
        .route("/api/aqi/refresh", post(refresh))
        .route("/api/model/metrics", get(model_metrics))
        .route("/api/categories", get(categories));

    let app = match static_dir {
        Some(dir) => {
            api.fallback_service(ServeDir::new(dir).not_found_service(not_found.into_service()))
        }
        None => api.fallback(not_found),
    };

    app.layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, Some(1))]
    #[case(Some(json!(7)), Some(7))]
    #[case(Some(json!(3.0)), Some(3))]
    #[case(Some(json!("14")), Some(14))]
    #[case(Some(json!(2.5)), None)]
    #[case(Some(json!("abc")), None)]
    #[case(Some(json!([1])), None)]
    fn integer_parsing(#[case] value: Option<Value>, #[case] expected: Option<i64>) {
        assert_eq!(parse_integer(value.as_ref(), 1), expected);
    }

    #[test]
    fn days_outside_horizons_are_bad_requests() {
        let err = parse_days(Some(&json!(5))).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("Must be one of: 1, 3, 7, 14"));

        let err = parse_days(Some(&json!("soon"))).unwrap_err();
        assert!(err.message.starts_with("Invalid 'days' parameter: 'soon'"));
    }

    #[test]
    fn error_statuses() {
        let cases = [
            (
                ForecastError::ModelNotLoaded {
                    model_key: "balanced".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ForecastError::UnknownEntity(EntityId::new("Nowhere", "Texas")),
                StatusCode::NOT_FOUND,
            ),
            (
                ForecastError::InsufficientHistory {
                    entity: "Dallas, Texas".into(),
                    required: 7,
                    available: 3,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ForecastError::Artifact("broken".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn blank_body_uses_defaults() {
        let request = parse_request(&Bytes::from_static(b"  ")).unwrap();
        assert!(request.county.is_none());
        assert!(parse_request(&Bytes::from_static(b"{oops")).is_err());
    }
}
