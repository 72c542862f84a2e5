//! Typed failures of the forecasting core and the data layer.

use thiserror::Error;

use crate::series::EntityId;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error(
        "Insufficient historical data for {entity}: need at least {required} days, got {available}"
    )]
    InsufficientHistory {
        entity: String,
        required: usize,
        available: usize,
    },

    #[error("Invalid 'days' value: {requested}. Must be one of: 1, 3, 7, 14")]
    InvalidHorizon { requested: i64 },

    #[error("{model_key} model not loaded. Please train model first.")]
    ModelNotLoaded { model_key: String },

    #[error("Scaler expects {expected} features but the feature array has {actual}")]
    ScalerMismatch { expected: usize, actual: usize },

    #[error("Estimator expects {expected} features but the feature array has {actual}")]
    FeatureWidthMismatch { expected: usize, actual: usize },

    /// Raw Gaussian mass over all bands is zero; callers fall back to a one-hot distribution.
    #[error("Category distribution for AQI {aqi} has zero total mass")]
    DegenerateDistribution { aqi: f64 },

    #[error("No observations for {0}")]
    UnknownEntity(EntityId),

    #[error("Unknown feature name '{0}'")]
    UnknownFeature(String),

    #[error("Feature '{0}' is missing from the feature vector")]
    MissingFeature(String),

    #[error("Feature '{0}' is not finite")]
    NonFiniteFeature(String),

    #[error("Model returned a non-finite prediction at step {step}")]
    NonFinitePrediction { step: usize },

    #[error("Model artifact error: {0}")]
    Artifact(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;

impl From<csv::Error> for ForecastError {
    fn from(err: csv::Error) -> Self {
        Self::Data(err.to_string())
    }
}

impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        Self::Artifact(err.to_string())
    }
}
