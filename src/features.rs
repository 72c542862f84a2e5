//! Lag/rolling feature vectors and the builder that derives them from an observation window.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::constants::MIN_HISTORY_DAYS;
use crate::error::{ForecastError, Result};
use crate::series::Observation;

pub(crate) const DEFAULT_LOCATION_CODE: f64 = 1.0;
const UNKNOWN_ENTITY: &str = "unknown entity";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FeatureKey {
    #[serde(rename = "lag_1")]
    Lag1,
    #[serde(rename = "lag_3")]
    Lag3,
    #[serde(rename = "lag_7")]
    Lag7,
    #[serde(rename = "lag_14")]
    Lag14,
    #[serde(rename = "rolling_3")]
    Rolling3,
    #[serde(rename = "rolling_7")]
    Rolling7,
    #[serde(rename = "rolling_14")]
    Rolling14,
    #[serde(rename = "rolling_30")]
    Rolling30,
    #[serde(rename = "rolling_std_7")]
    RollingStd7,
    #[serde(rename = "day_of_week")]
    DayOfWeek,
    #[serde(rename = "month")]
    Month,
    #[serde(rename = "state_code")]
    StateCode,
    #[serde(rename = "county_code")]
    CountyCode,
}

impl FeatureKey {
    pub const ALL: [Self; 13] = [
        Self::Lag1,
        Self::Lag3,
        Self::Lag7,
        Self::Lag14,
        Self::Rolling3,
        Self::Rolling7,
        Self::Rolling14,
        Self::Rolling30,
        Self::RollingStd7,
        Self::DayOfWeek,
        Self::Month,
        Self::StateCode,
        Self::CountyCode,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Lag1 => "lag_1",
            Self::Lag3 => "lag_3",
            Self::Lag7 => "lag_7",
            Self::Lag14 => "lag_14",
            Self::Rolling3 => "rolling_3",
            Self::Rolling7 => "rolling_7",
            Self::Rolling14 => "rolling_14",
            Self::Rolling30 => "rolling_30",
            Self::RollingStd7 => "rolling_std_7",
            Self::DayOfWeek => "day_of_week",
            Self::Month => "month",
            Self::StateCode => "state_code",
            Self::CountyCode => "county_code",
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureKey {
    type Err = ForecastError;

    /// Accepts canonical names and the column names of the EPA training tables.
    fn from_str(raw: &str) -> Result<Self> {
        let key = match raw.trim() {
            "lag_1" | "AQI_lag1" | "aqi_lag_1" => Self::Lag1,
            "lag_3" | "AQI_lag3" | "aqi_lag_3" => Self::Lag3,
            "lag_7" | "AQI_lag7" | "aqi_lag_7" => Self::Lag7,
            "lag_14" | "AQI_lag14" | "aqi_lag_14" => Self::Lag14,
            "rolling_3" | "AQI_rolling_3" | "aqi_rolling_3" => Self::Rolling3,
            "rolling_7" | "AQI_rolling_7" | "aqi_rolling_7" => Self::Rolling7,
            "rolling_14" | "AQI_rolling_14" | "aqi_rolling_14" => Self::Rolling14,
            "rolling_30" | "AQI_rolling_30" | "aqi_rolling_30" => Self::Rolling30,
            "rolling_std_7" | "AQI_std_7" | "aqi_std_7" => Self::RollingStd7,
            "day_of_week" => Self::DayOfWeek,
            "month" => Self::Month,
            "state_code" | "State Code" => Self::StateCode,
            "county_code" | "County Code" => Self::CountyCode,
            other => return Err(ForecastError::UnknownFeature(other.to_string())),
        };
        Ok(key)
    }
}

/// Named feature values for one forecast step.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: BTreeMap<FeatureKey, f64>,
}

impl FeatureVector {
    pub fn get(&self, key: FeatureKey) -> Option<f64> {
        self.values.get(&key).copied()
    }

    pub fn set(&mut self, key: FeatureKey, value: f64) {
        self.values.insert(key, value);
    }

    pub fn require(&self, key: FeatureKey) -> Result<f64> {
        self.get(key)
            .ok_or_else(|| ForecastError::MissingFeature(key.name().to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKey, f64)> + '_ {
        self.values.iter().map(|(key, value)| (*key, *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn ensure_finite(&self) -> Result<()> {
        match self.iter().find(|(_, value)| !value.is_finite()) {
            Some((key, _)) => Err(ForecastError::NonFiniteFeature(key.name().to_string())),
            None => Ok(()),
        }
    }

    /// Sets `day_of_week` (Monday = 0) and `month` from the forecast target date.
    pub fn set_calendar(&mut self, target: NaiveDate) {
        self.set(
            FeatureKey::DayOfWeek,
            f64::from(target.weekday().num_days_from_monday()),
        );
        self.set(FeatureKey::Month, f64::from(target.month()));
    }

    /// Folds a prediction back into the vector: shifts the lag chain and updates the
    /// 7/14/30-day means. `rolling_3`, `rolling_std_7` and location codes stay frozen.
    pub fn advance(&mut self, yhat: f64) -> Result<()> {
        let lag_1 = self.require(FeatureKey::Lag1)?;
        let lag_3 = self.require(FeatureKey::Lag3)?;
        let lag_7 = self.require(FeatureKey::Lag7)?;
        let rolling_7 = self.require(FeatureKey::Rolling7)?;
        let rolling_14 = self.require(FeatureKey::Rolling14)?;
        let rolling_30 = self.require(FeatureKey::Rolling30)?;

        self.set(FeatureKey::Lag14, lag_7);
        self.set(FeatureKey::Lag7, lag_3);
        self.set(FeatureKey::Lag3, lag_1);
        self.set(FeatureKey::Lag1, yhat);

        self.set(FeatureKey::Rolling7, (rolling_7 * 6.0 + yhat) / 7.0);
        self.set(FeatureKey::Rolling14, (rolling_14 * 13.0 + yhat) / 14.0);
        self.set(FeatureKey::Rolling30, (rolling_30 * 29.0 + yhat) / 30.0);
        Ok(())
    }
}

impl FromIterator<(FeatureKey, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (FeatureKey, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Derives the base feature vector "as of" the last observation.
#[derive(Clone, Copy, Debug)]
pub struct FeatureBuilder {
    min_history: usize,
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self {
            min_history: MIN_HISTORY_DAYS,
        }
    }
}

impl FeatureBuilder {
    pub const fn min_history(&self) -> usize {
        self.min_history
    }

    /// `observations` must be time-ordered, oldest first.
    pub fn build(&self, observations: &[Observation]) -> Result<FeatureVector> {
        let entity = observations
            .last()
            .map_or_else(|| UNKNOWN_ENTITY.to_string(), |o| o.entity.to_string());
        if observations.len() < self.min_history {
            return Err(ForecastError::InsufficientHistory {
                entity,
                required: self.min_history,
                available: observations.len(),
            });
        }
        let values = backfill(observations).ok_or(ForecastError::InsufficientHistory {
            entity,
            required: self.min_history,
            available: 0,
        })?;

        let lag = |n: usize| {
            if values.len() >= n {
                values[values.len() - n]
            } else {
                values[values.len() - 1]
            }
        };

        let mut vector: FeatureVector = [
            (FeatureKey::Lag1, lag(1)),
            (FeatureKey::Lag3, lag(3)),
            (FeatureKey::Lag7, lag(7)),
            (FeatureKey::Lag14, lag(14)),
            (FeatureKey::Rolling3, rolling_mean(&values, 3)),
            (FeatureKey::Rolling7, rolling_mean(&values, 7)),
            (FeatureKey::Rolling14, rolling_mean(&values, 14)),
            (FeatureKey::Rolling30, rolling_mean(&values, 30)),
            (FeatureKey::RollingStd7, rolling_std(&values, 7)),
        ]
        .into_iter()
        .collect();

        // Location codes come from the oldest row of the window.
        let first = &observations[0];
        vector.set(
            FeatureKey::StateCode,
            first.state_code.unwrap_or(DEFAULT_LOCATION_CODE),
        );
        vector.set(
            FeatureKey::CountyCode,
            first.county_code.unwrap_or(DEFAULT_LOCATION_CODE),
        );

        let last_date = observations[observations.len() - 1].date;
        vector.set_calendar(last_date + Duration::days(1));

        vector.ensure_finite()?;
        Ok(vector)
    }
}

/// Replaces non-finite values with the previous valid one (or the first valid one for a
/// leading gap). `None` when no value is finite.
fn backfill(observations: &[Observation]) -> Option<Vec<f64>> {
    let first_valid = observations
        .iter()
        .map(|o| o.aqi_value)
        .find(|value| value.is_finite())?;
    let mut last_valid = first_valid;
    Some(
        observations
            .iter()
            .map(|o| {
                if o.aqi_value.is_finite() {
                    last_valid = o.aqi_value;
                }
                last_valid
            })
            .collect(),
    )
}

fn tail(values: &[f64], window: usize) -> &[f64] {
    &values[values.len() - window.min(values.len())..]
}

fn rolling_mean(values: &[f64], window: usize) -> f64 {
    let slice = tail(values, window);
    if slice.is_empty() {
        return 0.0;
    }
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Sample standard deviation (n - 1); zero for fewer than two samples.
fn rolling_std(values: &[f64], window: usize) -> f64 {
    let slice = tail(values, window);
    if slice.len() < 2 {
        return 0.0;
    }
    let mean = slice.iter().sum::<f64>() / slice.len() as f64;
    let var = slice
        .iter()
        .map(|value| {
            let diff = value - mean;
            diff * diff
        })
        .sum::<f64>()
        / (slice.len() - 1) as f64;
    var.sqrt()
}
