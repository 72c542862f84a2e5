//! Shared constants: date formats, horizons and history floors.

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Forecast horizons (in days) accepted by the iterative forecaster.
pub const SUPPORTED_HORIZONS: [u32; 4] = [1, 3, 7, 14];

/// Minimum number of observations required to build a feature vector.
pub const MIN_HISTORY_DAYS: usize = 7;

pub const DEFAULT_WINDOW_DAYS: usize = 30;
pub const DEFAULT_UNCERTAINTY_SIGMA: f64 = 15.0;
pub const DEFAULT_MODEL_KEY: &str = "balanced";
