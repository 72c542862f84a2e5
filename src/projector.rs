//! Per-family projection of a feature vector onto a model's ordered input array.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::{FeatureKey, FeatureVector};

const POLLUTANT_COLUMN_PREFIXES: [&str; 2] = ["Defining Parameter_", "defining_parameter_"];

/// Pollutants one-hot encoded by the prototype layout.
pub const PROTOTYPE_POLLUTANTS: [&str; 5] = ["CO", "NO2", "Ozone", "PM10", "PM2.5"];

/// Positional lags (in observations) the prototype layout keeps after the pollutant columns.
pub const PROTOTYPE_LAG_DAYS: [usize; 3] = [1, 3, 7];

/// Feature order written by the trainer for the balanced family.
pub const BALANCED_FEATURES: [FeatureKey; 11] = [
    FeatureKey::StateCode,
    FeatureKey::CountyCode,
    FeatureKey::Lag1,
    FeatureKey::Lag3,
    FeatureKey::Lag7,
    FeatureKey::Lag14,
    FeatureKey::Rolling7,
    FeatureKey::DayOfWeek,
    FeatureKey::Month,
    FeatureKey::Rolling3,
    FeatureKey::RollingStd7,
];

/// Column names written by the trainer for the prototype family: location codes, pollutant
/// one-hots, then `AQI_lag1/3/7`.
pub fn prototype_feature_names() -> Vec<String> {
    let mut names = vec!["State Code".to_string(), "County Code".to_string()];
    names.extend(
        PROTOTYPE_POLLUTANTS
            .iter()
            .map(|pollutant| format!("{}{pollutant}", POLLUTANT_COLUMN_PREFIXES[0])),
    );
    names.extend(PROTOTYPE_LAG_DAYS.iter().map(|days| format!("AQI_lag{days}")));
    names
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[default]
    Balanced,
    Prototype,
}

impl ModelFamily {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Prototype => "prototype",
        }
    }

    pub fn projector(self) -> Arc<dyn FeatureProjector> {
        match self {
            Self::Balanced => Arc::new(BalancedProjector),
            Self::Prototype => Arc::new(PrototypeProjector),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait FeatureProjector: Send + Sync + fmt::Debug {
    fn family(&self) -> ModelFamily;

    /// Values of `vector` in `feature_order`. Unknown names and absent keys are errors.
    fn project(&self, vector: &FeatureVector, feature_order: &[String]) -> Result<Vec<f64>>;
}

fn project_named(vector: &FeatureVector, name: &str) -> Result<f64> {
    let key: FeatureKey = name.parse()?;
    vector.require(key)
}

/// Strict by-name projection.
#[derive(Clone, Copy, Debug, Default)]
pub struct BalancedProjector;

impl FeatureProjector for BalancedProjector {
    fn family(&self) -> ModelFamily {
        ModelFamily::Balanced
    }

    fn project(&self, vector: &FeatureVector, feature_order: &[String]) -> Result<Vec<f64>> {
        feature_order
            .iter()
            .map(|name| project_named(vector, name))
            .collect()
    }
}

/// Prototype layout: pollutant one-hot columns are unknown at forecast time and project to zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrototypeProjector;

impl FeatureProjector for PrototypeProjector {
    fn family(&self) -> ModelFamily {
        ModelFamily::Prototype
    }

    fn project(&self, vector: &FeatureVector, feature_order: &[String]) -> Result<Vec<f64>> {
        feature_order
            .iter()
            .map(|name| {
                if POLLUTANT_COLUMN_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
                {
                    Ok(0.0)
                } else {
                    project_named(vector, name)
                }
            })
            .collect()
    }
}
