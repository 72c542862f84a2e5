//! Fits linear models for both families: feature rows are standardised and a ridge
//! regression is solved with L-BFGS.
//!
//! Balanced rows come from the inference-time builder. Prototype rows follow the older
//! layout: location codes, a one-hot of the defining pollutant and positional lags.

use std::collections::BTreeMap;
use std::error::Error;

use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use chrono::{NaiveDate, Utc};
use itertools::Itertools;
use tqdm::pbar;
use tracing::{info, warn};

use crate::features::{DEFAULT_LOCATION_CODE, FeatureBuilder};
use crate::model::{Estimator, ModelArtifact, StandardScaler};
use crate::projector::{
    BALANCED_FEATURES, ModelFamily, PROTOTYPE_LAG_DAYS, PROTOTYPE_POLLUTANTS,
    prototype_feature_names,
};
use crate::series::{Observation, ObservationStore};

const DEFAULT_ALPHA: f64 = 0.1;
const DEFAULT_TRAIN_FRACTION: f64 = 0.8;
const DEFAULT_MAX_ITERS: u64 = 500;
const DEFAULT_HISTORY: usize = 10;
const DEFAULT_TOL_GRAD: f64 = 1e-8;
const DEFAULT_TOL_COST: f64 = 1e-12;
const MIN_PRIOR_OBSERVATIONS: usize = 14;
const FEATURE_WINDOW: usize = 30;
const VERSION_FORMAT: &str = "%Y%m%d_%H%M%S";
const LARGE_COST: f64 = 1e30;

#[derive(Clone, Copy, Debug)]
pub struct TrainConfig {
    pub alpha: f64,
    pub train_fraction: f64,
    pub max_iters: u64,
    pub history: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            train_fraction: DEFAULT_TRAIN_FRACTION,
            max_iters: DEFAULT_MAX_ITERS,
            history: DEFAULT_HISTORY,
        }
    }
}

/// Feature rows in one family's column order with their targets.
#[derive(Clone, Debug, Default)]
pub struct TrainingSet {
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Chronological split: the earliest `fraction` of samples train, the rest test.
    fn split(&self, fraction: f64) -> (Self, Self) {
        let order: Vec<usize> = (0..self.len())
            .sorted_by_key(|idx| self.dates[*idx])
            .collect();
        let cutoff = ((self.len() as f64) * fraction).floor() as usize;
        let pick = |indices: &[usize]| Self {
            dates: indices.iter().map(|idx| self.dates[*idx]).collect(),
            rows: indices.iter().map(|idx| self.rows[*idx].clone()).collect(),
            targets: indices.iter().map(|idx| self.targets[*idx]).collect(),
        };
        (pick(&order[..cutoff]), pick(&order[cutoff..]))
    }
}

/// One sample per observation with at least 14 prior days. Features come only from the
/// prior 30 observations; calendar features come from the target date.
pub fn build_training_set(store: &ObservationStore, builder: &FeatureBuilder) -> TrainingSet {
    let mut set = TrainingSet::default();
    let entities: Vec<_> = store.iter_series().collect();
    let mut pbar = pbar(Some(entities.len()));
    let mut skipped = 0usize;

    for (_, series) in entities {
        for target_idx in MIN_PRIOR_OBSERVATIONS..series.len() {
            let target = series[target_idx];
            if !target.aqi_value.is_finite() {
                continue;
            }
            let start = target_idx.saturating_sub(FEATURE_WINDOW);
            let window: Vec<_> = series[start..target_idx]
                .iter()
                .map(|obs| (*obs).clone())
                .collect();
            let Ok(mut vector) = builder.build(&window) else {
                skipped += 1;
                continue;
            };
            vector.set_calendar(target.date);
            let row: Option<Vec<f64>> = BALANCED_FEATURES
                .iter()
                .map(|key| vector.get(*key))
                .collect();
            match row {
                Some(row) => {
                    set.dates.push(target.date);
                    set.rows.push(row);
                    set.targets.push(target.aqi_value);
                }
                None => skipped += 1,
            }
        }
        if let Err(err) = pbar.update(1) {
            warn!(error = %err, "Failed to update progress bar");
        }
    }

    if skipped > 0 {
        warn!(operation = "training", skipped, "Skipped samples without usable history");
    }
    set
}

fn prototype_row(series: &[&Observation], target_idx: usize) -> Option<Vec<f64>> {
    let target = series[target_idx];
    let mut row = vec![
        target.state_code.unwrap_or(DEFAULT_LOCATION_CODE),
        target.county_code.unwrap_or(DEFAULT_LOCATION_CODE),
    ];
    let parameter = target.defining_parameter.as_deref().unwrap_or_default();
    row.extend(PROTOTYPE_POLLUTANTS.iter().map(|pollutant| {
        if pollutant.eq_ignore_ascii_case(parameter) {
            1.0
        } else {
            0.0
        }
    }));
    for days in PROTOTYPE_LAG_DAYS {
        let value = series[target_idx.checked_sub(days)?].aqi_value;
        if !value.is_finite() {
            return None;
        }
        row.push(value);
    }
    Some(row)
}

/// One sample per observation whose positional lags are all present, in
/// `prototype_feature_names()` order. Rows with a missing lag are dropped.
pub fn build_prototype_training_set(store: &ObservationStore) -> TrainingSet {
    let mut set = TrainingSet::default();
    let entities: Vec<_> = store.iter_series().collect();
    let first_target = PROTOTYPE_LAG_DAYS.iter().copied().max().unwrap_or_default();
    let mut pbar = pbar(Some(entities.len()));
    let mut skipped = 0usize;

    for (_, series) in entities {
        for target_idx in first_target..series.len() {
            let target = series[target_idx];
            if !target.aqi_value.is_finite() {
                continue;
            }
            match prototype_row(&series, target_idx) {
                Some(row) => {
                    set.dates.push(target.date);
                    set.rows.push(row);
                    set.targets.push(target.aqi_value);
                }
                None => skipped += 1,
            }
        }
        if let Err(err) = pbar.update(1) {
            warn!(error = %err, "Failed to update progress bar");
        }
    }

    if skipped > 0 {
        warn!(operation = "training", skipped, "Dropped prototype rows with missing lags");
    }
    set
}

#[derive(Clone)]
struct RidgeProblem {
    rows: Vec<Vec<f64>>,
    targets: Vec<f64>,
    alpha: f64,
}

impl RidgeProblem {
    const fn new(rows: Vec<Vec<f64>>, targets: Vec<f64>, alpha: f64) -> Self {
        Self {
            rows,
            targets,
            alpha,
        }
    }

    fn width(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// `param[0]` is the intercept, the rest are coefficients.
    fn residuals(&self, param: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .zip(&self.targets)
            .map(|(row, target)| {
                let fitted = row
                    .iter()
                    .zip(&param[1..])
                    .fold(param[0], |acc, (x, w)| w.mul_add(*x, acc));
                fitted - target
            })
            .collect()
    }
}

impl CostFunction for RidgeProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, ArgminError> {
        if param.len() != self.width() + 1 || self.targets.is_empty() {
            return Ok(LARGE_COST);
        }
        let n = self.targets.len() as f64;
        let mse = self
            .residuals(param)
            .iter()
            .map(|r| r * r)
            .sum::<f64>()
            / n;
        let penalty: f64 = param[1..].iter().map(|w| w * w).sum();
        Ok(self.alpha.mul_add(penalty, mse))
    }
}

impl Gradient for RidgeProblem {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        if param.len() != self.width() + 1 || self.targets.is_empty() {
            return Ok(vec![0.0; param.len()]);
        }
        let n = self.targets.len() as f64;
        let mut grad = vec![0.0; param.len()];
        for (row, residual) in self.rows.iter().zip(self.residuals(param)) {
            let scaled = 2.0 * residual / n;
            grad[0] += scaled;
            for (g, x) in grad[1..].iter_mut().zip(row) {
                *g += scaled * x;
            }
        }
        for (g, w) in grad[1..].iter_mut().zip(&param[1..]) {
            *g += 2.0 * self.alpha * w;
        }
        Ok(grad)
    }
}

/// Minimises `mean((b + w·x - y)^2) + alpha * |w|^2`. Returns `(intercept, coefficients)`.
pub fn fit_ridge(
    rows: &[Vec<f64>],
    targets: &[f64],
    config: TrainConfig,
) -> Result<(f64, Vec<f64>), Box<dyn Error>> {
    if rows.is_empty() || rows.len() != targets.len() {
        return Err("rows/targets must be non-empty and the same length".into());
    }
    let width = rows[0].len();
    if rows.iter().any(|row| row.len() != width) {
        return Err("all rows must have the same width".into());
    }

    let mean_target = targets.iter().sum::<f64>() / targets.len() as f64;
    let mut init = vec![0.0; width + 1];
    init[0] = mean_target;

    let problem = RidgeProblem::new(rows.to_vec(), targets.to_vec(), config.alpha.max(0.0));
    let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
    let solver = LBFGS::new(linesearch, config.history)
        .with_tolerance_grad(DEFAULT_TOL_GRAD)?
        .with_tolerance_cost(DEFAULT_TOL_COST)?;

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(init).max_iters(config.max_iters))
        .run()?;

    let best = result
        .state
        .get_param()
        .ok_or("no parameters returned from optimizer")?
        .clone();
    Ok((best[0], best[1..].to_vec()))
}

fn regression_metrics(predicted: &[f64], actual: &[f64]) -> BTreeMap<String, f64> {
    let n = actual.len() as f64;
    let mse = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (p - a) * (p - a))
        .sum::<f64>()
        / n;
    let mae = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (p - a).abs())
        .sum::<f64>()
        / n;
    let mean = actual.iter().sum::<f64>() / n;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean) * (a - mean)).sum();
    let r2 = if ss_tot > 0.0 {
        1.0 - mse * n / ss_tot
    } else {
        0.0
    };

    BTreeMap::from([
        ("mse".to_string(), mse),
        ("rmse".to_string(), mse.sqrt()),
        ("mae".to_string(), mae),
        ("r2".to_string(), r2),
        ("samples".to_string(), n),
    ])
}

/// Splits `set` by date, fits scaler and ridge on the earlier part and scores the rest.
fn fit_artifact(
    set: &TrainingSet,
    family: ModelFamily,
    feature_names: Vec<String>,
    config: TrainConfig,
) -> Result<ModelArtifact, Box<dyn Error>> {
    if !(0.0..1.0).contains(&config.train_fraction) || config.train_fraction <= 0.0 {
        return Err("train_fraction must be within (0, 1)".into());
    }
    let (train, test) = set.split(config.train_fraction);
    if train.is_empty() || test.is_empty() {
        return Err(format!(
            "need samples on both sides of the split, got {} train and {} test",
            train.len(),
            test.len()
        )
        .into());
    }
    info!(
        operation = "training",
        %family,
        train = train.len(),
        test = test.len(),
        "Prepared training samples"
    );

    let scaler = StandardScaler::fit(&train.rows);
    let scaled_train = train
        .rows
        .iter()
        .map(|row| scaler.transform(row))
        .collect::<Result<Vec<_>, _>>()?;
    let (intercept, coefficients) = fit_ridge(&scaled_train, &train.targets, config)?;
    let estimator = Estimator::Linear {
        intercept,
        coefficients,
    };

    let predicted = test
        .rows
        .iter()
        .map(|row| estimator.evaluate(&scaler.transform(row)?))
        .collect::<Result<Vec<_>, _>>()?;
    let mut metrics = regression_metrics(&predicted, &test.targets);
    metrics.insert("train_samples".to_string(), train.len() as f64);
    info!(
        operation = "training",
        %family,
        rmse = metrics.get("rmse").copied().unwrap_or(f64::NAN),
        r2 = metrics.get("r2").copied().unwrap_or(f64::NAN),
        "Evaluated model on held-out split"
    );

    let artifact = ModelArtifact {
        version: Utc::now().format(VERSION_FORMAT).to_string(),
        family,
        feature_names,
        scaler: Some(scaler),
        estimator,
        metrics,
    };
    artifact.validate()?;
    Ok(artifact)
}

/// Trains the balanced linear model on every entity in `store`.
pub fn train_balanced_model(
    store: &ObservationStore,
    config: TrainConfig,
) -> Result<ModelArtifact, Box<dyn Error>> {
    let set = build_training_set(store, &FeatureBuilder::default());
    let feature_names = BALANCED_FEATURES
        .iter()
        .map(|key| key.name().to_string())
        .collect();
    fit_artifact(&set, ModelFamily::Balanced, feature_names, config)
}

/// Trains the prototype-layout model on every entity in `store`.
pub fn train_prototype_model(
    store: &ObservationStore,
    config: TrainConfig,
) -> Result<ModelArtifact, Box<dyn Error>> {
    let set = build_prototype_training_set(store);
    fit_artifact(&set, ModelFamily::Prototype, prototype_feature_names(), config)
}

pub fn train_model(
    store: &ObservationStore,
    family: ModelFamily,
    config: TrainConfig,
) -> Result<ModelArtifact, Box<dyn Error>> {
    match family {
        ModelFamily::Balanced => train_balanced_model(store, config),
        ModelFamily::Prototype => train_prototype_model(store, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategoryMapper;
    use crate::forecast::IterativeForecaster;
    use crate::model::ModelAdapter;
    use crate::registry::ModelRegistry;
    use crate::series::EntityId;
    use chrono::Days;

    fn sinusoid_store(days: u64) -> ObservationStore {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let entities = [EntityId::new("Dallas", "Texas"), EntityId::new("Kern", "California")];
        ObservationStore::from_observations(entities.iter().enumerate().flat_map(
            |(offset, entity)| {
                (0..days).map(move |day| {
                    let phase = (day as f64 + offset as f64 * 3.0) * std::f64::consts::TAU / 20.0;
                    Observation::new(
                        entity.clone(),
                        start + Days::new(day),
                        30.0f64.mul_add(phase.sin(), 60.0),
                    )
                })
            },
        ))
    }

    fn with_pollutants(store: &ObservationStore) -> ObservationStore {
        ObservationStore::from_observations(store.iter_series().flat_map(|(_, series)| {
            series
                .into_iter()
                .enumerate()
                .map(|(idx, obs)| Observation {
                    defining_parameter: Some(
                        (if idx % 3 == 0 { "PM2.5" } else { "Ozone" }).to_string(),
                    ),
                    ..obs.clone()
                })
                .collect::<Vec<_>>()
        }))
    }

    #[test]
    fn ridge_without_penalty_recovers_line() {
        let rows: Vec<Vec<f64>> = (0..10).map(|x| vec![f64::from(x)]).collect();
        let targets: Vec<f64> = (0..10).map(|x| 2.0f64.mul_add(f64::from(x), 3.0)).collect();
        let config = TrainConfig {
            alpha: 0.0,
            ..TrainConfig::default()
        };
        let (intercept, coefficients) = fit_ridge(&rows, &targets, config).unwrap();
        assert!((intercept - 3.0).abs() < 1e-3, "intercept={intercept}");
        assert!((coefficients[0] - 2.0).abs() < 1e-3, "slope={coefficients:?}");
    }

    #[test]
    fn penalty_shrinks_coefficients() {
        let rows: Vec<Vec<f64>> = (0..10).map(|x| vec![f64::from(x) - 4.5]).collect();
        let targets: Vec<f64> = rows.iter().map(|row| 2.0 * row[0]).collect();
        let with_alpha = |alpha| TrainConfig {
            alpha,
            ..TrainConfig::default()
        };
        let (_, free) = fit_ridge(&rows, &targets, with_alpha(0.0)).unwrap();
        let (_, shrunk) = fit_ridge(&rows, &targets, with_alpha(1.0)).unwrap();
        assert!(shrunk[0].abs() < free[0].abs());
    }

    #[test]
    fn training_set_skips_short_prefix() {
        let store = sinusoid_store(20);
        let set = build_training_set(&store, &FeatureBuilder::default());
        // 20 days per entity, the first 14 are history only.
        assert_eq!(set.len(), 2 * 6);
        assert!(set.rows.iter().all(|row| row.len() == BALANCED_FEATURES.len()));
    }

    #[test]
    fn trains_balanced_artifact() {
        let store = sinusoid_store(120);
        let artifact = train_balanced_model(&store, TrainConfig::default()).unwrap();
        assert!(artifact.validate().is_ok());
        assert_eq!(artifact.family, ModelFamily::Balanced);
        assert_eq!(artifact.feature_names[0], "state_code");
        assert_eq!(artifact.version.len(), "20240101_000000".len());
        let r2 = artifact.metrics["r2"];
        assert!(r2 > 0.5, "r2={r2}");
        assert!(artifact.metrics["rmse"].is_finite());
    }

    #[test]
    fn too_little_data_is_an_error() {
        let store = sinusoid_store(10);
        assert!(train_balanced_model(&store, TrainConfig::default()).is_err());
    }

    #[test]
    fn prototype_rows_one_hot_the_defining_pollutant() {
        let store = with_pollutants(&sinusoid_store(20));
        let set = build_prototype_training_set(&store);
        // 20 days per entity, the first 7 only feed lags.
        assert_eq!(set.len(), 2 * 13);
        let names = prototype_feature_names();
        let ozone = names.iter().position(|name| name.ends_with("_Ozone")).unwrap();
        let pm25 = names.iter().position(|name| name.ends_with("_PM2.5")).unwrap();
        // Target index 7 is "Ozone", index 9 is "PM2.5".
        assert_eq!(set.rows[0][ozone], 1.0);
        assert_eq!(set.rows[0][pm25], 0.0);
        assert_eq!(set.rows[2][pm25], 1.0);
        assert!(set.rows.iter().all(|row| row.len() == names.len()));
        let (_, kern) = store.iter_series().next().unwrap();
        assert_eq!(set.rows[0][names.len() - 3], kern[6].aqi_value);
        assert_eq!(set.rows[0][names.len() - 1], kern[0].aqi_value);
    }

    #[test]
    fn trained_prototype_forecasts_through_its_projector() {
        let store = with_pollutants(&sinusoid_store(120));
        let artifact = train_model(&store, ModelFamily::Prototype, TrainConfig::default()).unwrap();
        assert_eq!(artifact.family, ModelFamily::Prototype);
        assert_eq!(artifact.feature_names, prototype_feature_names());
        let r2 = artifact.metrics["r2"];
        assert!(r2 > 0.5, "r2={r2}");

        let mut registry = ModelRegistry::new();
        registry.insert(
            ModelAdapter::new("prototype", ModelFamily::Prototype.projector(), artifact).unwrap(),
        );
        let forecaster = IterativeForecaster::new(&registry, CategoryMapper::new(15.0).unwrap());
        let dallas = EntityId::new("Dallas", "Texas");
        let steps = forecaster
            .forecast_entity(
                &store,
                &dallas,
                30,
                3,
                "prototype",
                NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
            )
            .unwrap()
            .into_steps();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|step| step.predicted_value().is_finite()));
    }
}
