//! AQI forecasting: lag/rolling feature pipeline, model adapters and an iterative
//! multi-day forecaster, served over HTTP or run from the command line.

pub mod api;
pub mod category;
pub mod config;
pub mod constants;
pub mod error;
pub mod features;
pub mod forecast;
pub mod model;
pub mod projector;
pub mod registry;
pub mod series;
pub mod train;

pub use error::{ForecastError, Result};
