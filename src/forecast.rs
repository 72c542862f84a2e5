//! Iterative multi-day forecasting: each day's prediction is folded back into the feature
//! vector that drives the next day.

use std::fs;
use std::path::Path;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, trace};

use crate::category::{AqiCategory, CategoryDistribution, CategoryMapper};
use crate::constants::{DATE_FORMAT, SUPPORTED_HORIZONS};
use crate::error::{ForecastError, Result};
use crate::features::{FeatureBuilder, FeatureVector};
use crate::registry::ModelRegistry;
use crate::series::{EntityId, Observation, ObservationSource};

/// One forecast day. Built by the forecaster and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastStep {
    #[serde(rename = "step")]
    step_index: usize,
    forecast_date: NaiveDate,
    #[serde(skip)]
    input_vector: FeatureVector,
    #[serde(rename = "predicted_aqi")]
    predicted_value: f64,
    predicted_category: AqiCategory,
    probabilities: CategoryDistribution,
}

impl ForecastStep {
    /// 1-based position in the horizon.
    pub const fn step_index(&self) -> usize {
        self.step_index
    }

    pub const fn forecast_date(&self) -> NaiveDate {
        self.forecast_date
    }

    /// Snapshot of the vector the model saw for this step.
    pub const fn input_vector(&self) -> &FeatureVector {
        &self.input_vector
    }

    pub const fn predicted_value(&self) -> f64 {
        self.predicted_value
    }

    pub const fn predicted_category(&self) -> AqiCategory {
        self.predicted_category
    }

    pub const fn probabilities(&self) -> &CategoryDistribution {
        &self.probabilities
    }
}

/// Return shape at the boundary: a one-day horizon is a single result, longer horizons a list.
#[derive(Clone, Debug, PartialEq)]
pub enum ForecastOutcome {
    Single(ForecastStep),
    Multi(Vec<ForecastStep>),
}

impl ForecastOutcome {
    pub fn from_steps(mut steps: Vec<ForecastStep>) -> Self {
        if steps.len() == 1 {
            Self::Single(steps.remove(0))
        } else {
            Self::Multi(steps)
        }
    }

    pub fn steps(&self) -> &[ForecastStep] {
        match self {
            Self::Single(step) => std::slice::from_ref(step),
            Self::Multi(steps) => steps,
        }
    }

    pub fn into_steps(self) -> Vec<ForecastStep> {
        match self {
            Self::Single(step) => vec![step],
            Self::Multi(steps) => steps,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForecastState {
    /// Vector initialised from real history.
    Ready,
    /// One prediction in progress.
    Stepping,
    /// Vector updated with the synthetic value.
    Advanced,
    Done,
}

/// Checks `days` against the supported horizons.
pub fn validate_horizon(days: i64) -> Result<usize> {
    SUPPORTED_HORIZONS
        .iter()
        .find(|horizon| i64::from(**horizon) == days)
        .map(|horizon| *horizon as usize)
        .ok_or(ForecastError::InvalidHorizon { requested: days })
}

pub struct IterativeForecaster<'a> {
    registry: &'a ModelRegistry,
    mapper: CategoryMapper,
    builder: FeatureBuilder,
}

impl<'a> IterativeForecaster<'a> {
    pub fn new(registry: &'a ModelRegistry, mapper: CategoryMapper) -> Self {
        Self {
            registry,
            mapper,
            builder: FeatureBuilder::default(),
        }
    }

    #[must_use]
    pub const fn with_builder(mut self, builder: FeatureBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Forecasts `days` days after `anchor_date` from `observations` (oldest first).
    ///
    /// Any failure aborts the whole forecast; partial results are never returned.
    pub fn forecast(
        &self,
        observations: &[Observation],
        days: i64,
        model_key: &str,
        anchor_date: NaiveDate,
    ) -> Result<Vec<ForecastStep>> {
        let horizon = validate_horizon(days)?;
        let mut vector = self.builder.build(observations)?;
        let model = self
            .registry
            .get_model(model_key)
            .ok_or_else(|| ForecastError::ModelNotLoaded {
                model_key: model_key.to_string(),
            })?;
        let feature_order = model.feature_order()?;

        let mut steps: Vec<ForecastStep> = Vec::with_capacity(horizon);
        let mut state = ForecastState::Ready;
        while state != ForecastState::Done {
            state = match state {
                ForecastState::Ready | ForecastState::Advanced if steps.len() == horizon => {
                    ForecastState::Done
                }
                ForecastState::Ready | ForecastState::Advanced => ForecastState::Stepping,
                ForecastState::Stepping => {
                    let step_index = steps.len() + 1;
                    let forecast_date = anchor_date
                        .checked_add_days(Days::new(step_index as u64))
                        .ok_or_else(|| {
                            ForecastError::Data(format!(
                                "forecast date overflows after {}",
                                anchor_date.format(DATE_FORMAT)
                            ))
                        })?;
                    vector.set_calendar(forecast_date);

                    let yhat = model.predict(&vector, feature_order)?;
                    if !yhat.is_finite() {
                        return Err(ForecastError::NonFinitePrediction { step: step_index });
                    }
                    let category = self.mapper.categorize_or_fallback(yhat);
                    trace!(
                        operation = "prediction",
                        step = step_index,
                        date = %forecast_date,
                        yhat,
                        category = category.category.label(),
                        "Forecast step"
                    );
                    steps.push(ForecastStep {
                        step_index,
                        forecast_date,
                        input_vector: vector.clone(),
                        predicted_value: yhat,
                        predicted_category: category.category,
                        probabilities: category.distribution,
                    });

                    vector.advance(yhat)?;
                    ForecastState::Advanced
                }
                ForecastState::Done => ForecastState::Done,
            };
        }

        debug!(
            operation = "prediction",
            model = model_key,
            days = horizon,
            anchor = %anchor_date,
            "Forecast completed"
        );
        Ok(steps)
    }

    /// Pulls the recent window for `entity` from `source` and forecasts it.
    pub fn forecast_entity(
        &self,
        source: &dyn ObservationSource,
        entity: &EntityId,
        window_days: usize,
        days: i64,
        model_key: &str,
        anchor_date: NaiveDate,
    ) -> Result<ForecastOutcome> {
        let observations = source.get_recent(entity, window_days)?;
        self.forecast(&observations, days, model_key, anchor_date)
            .map(ForecastOutcome::from_steps)
    }
}

pub fn write_forecast_csv(steps: &[ForecastStep], output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(output_path)?;
    let mut header = vec![
        "date".to_string(),
        "predicted_aqi".to_string(),
        "category".to_string(),
    ];
    header.extend(AqiCategory::ALL.iter().map(|category| {
        format!(
            "p_{}",
            category.label().to_lowercase().replace(' ', "_")
        )
    }));
    writer.write_record(&header)?;

    for step in steps {
        let mut record = vec![
            step.forecast_date.format(DATE_FORMAT).to_string(),
            format!("{:.6}", step.predicted_value),
            step.predicted_category.label().to_string(),
        ];
        record.extend(step.probabilities.iter().map(|(_, p)| format!("{p:.6}")));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
