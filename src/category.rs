//! EPA AQI categories and the Gaussian category distribution around a point prediction.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::warn;

use crate::error::{ForecastError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AqiCategory {
    #[serde(rename = "Good")]
    Good,
    #[serde(rename = "Moderate")]
    Moderate,
    #[serde(rename = "Unhealthy for Sensitive Groups")]
    UnhealthyForSensitiveGroups,
    #[serde(rename = "Unhealthy")]
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    #[serde(rename = "Hazardous")]
    Hazardous,
}

impl AqiCategory {
    pub const ALL: [Self; 6] = [
        Self::Good,
        Self::Moderate,
        Self::UnhealthyForSensitiveGroups,
        Self::Unhealthy,
        Self::VeryUnhealthy,
        Self::Hazardous,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Moderate => "Moderate",
            Self::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            Self::Unhealthy => "Unhealthy",
            Self::VeryUnhealthy => "Very Unhealthy",
            Self::Hazardous => "Hazardous",
        }
    }

    /// Inclusive band bounds.
    pub const fn bounds(self) -> (f64, f64) {
        match self {
            Self::Good => (0.0, 50.0),
            Self::Moderate => (51.0, 100.0),
            Self::UnhealthyForSensitiveGroups => (101.0, 150.0),
            Self::Unhealthy => (151.0, 200.0),
            Self::VeryUnhealthy => (201.0, 300.0),
            Self::Hazardous => (301.0, 500.0),
        }
    }

    pub const fn color(self) -> &'static str {
        match self {
            Self::Good => "#00E400",
            Self::Moderate => "#FFFF00",
            Self::UnhealthyForSensitiveGroups => "#FF7E00",
            Self::Unhealthy => "#FF0000",
            Self::VeryUnhealthy => "#8F3F97",
            Self::Hazardous => "#7E0023",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    /// Band containing `aqi`, or the nearest band for values in the gaps between integer bands
    /// and outside `[0, 500]`. Equidistant gap values go to the lower band.
    pub fn from_aqi(aqi: f64) -> Self {
        let mut best = Self::Good;
        let mut best_distance = f64::INFINITY;
        for category in Self::ALL {
            let (lower, upper) = category.bounds();
            let distance = if aqi < lower {
                lower - aqi
            } else if aqi > upper {
                aqi - upper
            } else {
                0.0
            };
            if distance < best_distance {
                best = category;
                best_distance = distance;
            }
        }
        best
    }
}

/// Probability per category, in band order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CategoryDistribution {
    probabilities: [f64; 6],
}

impl CategoryDistribution {
    pub fn one_hot(category: AqiCategory) -> Self {
        let mut probabilities = [0.0; 6];
        probabilities[category.index()] = 1.0;
        Self { probabilities }
    }

    pub const fn get(&self, category: AqiCategory) -> f64 {
        self.probabilities[category.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (AqiCategory, f64)> + '_ {
        AqiCategory::ALL
            .iter()
            .zip(self.probabilities.iter())
            .map(|(category, p)| (*category, *p))
    }

    pub fn sum(&self) -> f64 {
        self.probabilities.iter().sum()
    }

    /// Most likely category; ties resolve to the lower band.
    pub fn argmax(&self) -> AqiCategory {
        let mut best = AqiCategory::Good;
        let mut best_p = f64::NEG_INFINITY;
        for (category, p) in self.iter() {
            if p > best_p {
                best = category;
                best_p = p;
            }
        }
        best
    }
}

impl Serialize for CategoryDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.probabilities.len()))?;
        for (category, p) in self.iter() {
            map.serialize_entry(category.label(), &p)?;
        }
        map.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CategoryForecast {
    pub category: AqiCategory,
    pub distribution: CategoryDistribution,
}

/// Maps point predictions onto categories with a fixed-width Gaussian uncertainty.
#[derive(Clone, Debug)]
pub struct CategoryMapper {
    sigma: f64,
    standard: Normal,
}

impl CategoryMapper {
    pub fn new(sigma: f64) -> Result<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ForecastError::Config(format!(
                "uncertainty sigma must be a finite value > 0, got {sigma}"
            )));
        }
        let standard =
            Normal::new(0.0, 1.0).map_err(|err| ForecastError::Config(err.to_string()))?;
        Ok(Self { sigma, standard })
    }

    pub const fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn categorize(&self, aqi: f64) -> Result<CategoryForecast> {
        let mut probabilities = [0.0; 6];
        for category in AqiCategory::ALL {
            let (lower, upper) = category.bounds();
            let lower_z = (lower - aqi) / self.sigma;
            let upper_z = (upper - aqi) / self.sigma;
            let mass = self.standard.cdf(upper_z) - self.standard.cdf(lower_z);
            probabilities[category.index()] = mass.max(0.0).min(1.0);
        }

        let total: f64 = probabilities.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Err(ForecastError::DegenerateDistribution { aqi });
        }
        for p in &mut probabilities {
            *p /= total;
        }

        let distribution = CategoryDistribution { probabilities };
        Ok(CategoryForecast {
            category: distribution.argmax(),
            distribution,
        })
    }

    /// Like [`Self::categorize`], but a degenerate distribution becomes one-hot on the nearest band.
    pub fn categorize_or_fallback(&self, aqi: f64) -> CategoryForecast {
        match self.categorize(aqi) {
            Ok(forecast) => forecast,
            Err(err) => {
                warn!(operation = "prediction", error = %err, "Falling back to one-hot category");
                let category = AqiCategory::from_aqi(aqi);
                CategoryForecast {
                    category,
                    distribution: CategoryDistribution::one_hot(category),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn mapper() -> CategoryMapper {
        CategoryMapper::new(15.0).unwrap()
    }

    #[rstest]
    #[case(0.0, AqiCategory::Good)]
    #[case(50.0, AqiCategory::Good)]
    #[case(51.0, AqiCategory::Moderate)]
    #[case(100.0, AqiCategory::Moderate)]
    #[case(101.0, AqiCategory::UnhealthyForSensitiveGroups)]
    #[case(151.0, AqiCategory::Unhealthy)]
    #[case(300.0, AqiCategory::VeryUnhealthy)]
    #[case(301.0, AqiCategory::Hazardous)]
    #[case(500.0, AqiCategory::Hazardous)]
    #[case(501.0, AqiCategory::Hazardous)]
    fn band_boundaries(#[case] aqi: f64, #[case] expected: AqiCategory) {
        assert_eq!(mapper().categorize_or_fallback(aqi).category, expected);
        assert_eq!(AqiCategory::from_aqi(aqi), expected);
    }

    #[test]
    fn category_is_argmax_and_normalized() {
        let mapper = mapper();
        let mut aqi = 0.0;
        while aqi <= 500.0 {
            let forecast = mapper.categorize(aqi).unwrap();
            assert_eq!(forecast.category, forecast.distribution.argmax(), "aqi={aqi}");
            assert!((forecast.distribution.sum() - 1.0).abs() < 1e-6, "aqi={aqi}");
            aqi += 0.25;
        }
    }

    #[test]
    fn integer_values_match_band_table() {
        let mapper = mapper();
        for aqi in 0..=500 {
            let value = f64::from(aqi);
            assert_eq!(
                mapper.categorize(value).unwrap().category,
                AqiCategory::from_aqi(value),
                "aqi={aqi}"
            );
        }
    }

    #[test]
    fn far_out_of_range_values_are_degenerate() {
        let mapper = mapper();
        let err = mapper.categorize(5000.0).unwrap_err();
        assert!(matches!(err, ForecastError::DegenerateDistribution { .. }));

        let fallback = mapper.categorize_or_fallback(5000.0);
        assert_eq!(fallback.category, AqiCategory::Hazardous);
        assert_eq!(fallback.distribution.get(AqiCategory::Hazardous), 1.0);
        assert_eq!(fallback.distribution.sum(), 1.0);

        let below = mapper.categorize_or_fallback(-5000.0);
        assert_eq!(below.category, AqiCategory::Good);
    }

    #[test]
    fn gap_values_go_to_nearest_band() {
        assert_eq!(AqiCategory::from_aqi(50.4), AqiCategory::Good);
        assert_eq!(AqiCategory::from_aqi(50.6), AqiCategory::Moderate);
        assert_eq!(AqiCategory::from_aqi(-3.0), AqiCategory::Good);
    }

    #[test]
    fn rejects_invalid_sigma() {
        assert!(CategoryMapper::new(0.0).is_err());
        assert!(CategoryMapper::new(f64::NAN).is_err());
    }

    #[test]
    fn serializes_labels() {
        let json = serde_json::to_value(CategoryDistribution::one_hot(AqiCategory::Moderate))
            .unwrap();
        assert_eq!(json["Moderate"], 1.0);
        assert_eq!(json["Unhealthy for Sensitive Groups"], 0.0);
        assert_eq!(
            serde_json::to_value(AqiCategory::VeryUnhealthy).unwrap(),
            "Very Unhealthy"
        );
    }
}
