//! Daily AQI observations: CSV loading, per-entity storage and the read contract used by the
//! forecaster.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::category::AqiCategory;
use crate::constants::DATE_FORMAT;
use crate::error::{ForecastError, Result};

const DATE_FORMAT_US: &str = "%m/%d/%Y";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const GZIP_EXTENSION: &str = "gz";
const UNKNOWN_LABEL: &str = "Unknown";

/// County + state pair identifying one observed series.
///
/// Field order matters: entities sort by state first, then county.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityId {
    pub state: String,
    pub county: String,
}

impl EntityId {
    pub fn new(county: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            county: county.into(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}, {}", self.county, self.state)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.county, self.state)
    }
}

/// One daily AQI reading. `aqi_value` is NaN when the source row had no value.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub entity: EntityId,
    pub date: NaiveDate,
    pub aqi_value: f64,
    pub state_code: Option<f64>,
    pub county_code: Option<f64>,
    pub category: Option<String>,
    pub defining_parameter: Option<String>,
}

impl Observation {
    pub const fn new(entity: EntityId, date: NaiveDate, aqi_value: f64) -> Self {
        Self {
            entity,
            date,
            aqi_value,
            state_code: None,
            county_code: None,
            category: None,
            defining_parameter: None,
        }
    }
}

/// Row of the EPA "daily AQI by county" export (snake_case headers are accepted too).
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "State Name", alias = "state_name", alias = "state")]
    state: String,
    #[serde(rename = "county Name", alias = "County Name", alias = "county_name", alias = "county")]
    county: String,
    #[serde(rename = "State Code", alias = "state_code", default)]
    state_code: Option<String>,
    #[serde(rename = "County Code", alias = "county_code", default)]
    county_code: Option<String>,
    #[serde(rename = "Date", alias = "date")]
    date: String,
    #[serde(rename = "AQI", alias = "aqi", alias = "aqi_value", default)]
    aqi: Option<f64>,
    #[serde(rename = "Category", alias = "category", default)]
    category: Option<String>,
    #[serde(rename = "Defining Parameter", alias = "defining_parameter", default)]
    defining_parameter: Option<String>,
}

#[derive(Clone, Copy, Debug)]
enum DateFormatHint {
    Iso,
    UsSlash,
    IsoDateTime,
}

impl DateFormatHint {
    fn parse(self, raw: &str) -> Option<NaiveDate> {
        match self {
            Self::Iso => NaiveDate::parse_from_str(raw, DATE_FORMAT).ok(),
            Self::UsSlash => NaiveDate::parse_from_str(raw, DATE_FORMAT_US).ok(),
            Self::IsoDateTime => NaiveDateTime::parse_from_str(raw, DATE_TIME_FORMAT)
                .ok()
                .map(|dt| dt.date()),
        }
    }
}

/// Parses the date formats seen in AQI exports, remembering the last one that matched.
fn parse_date_with_hint(raw: &str, hint: &mut Option<DateFormatHint>) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(parsed) = hint.and_then(|h| h.parse(trimmed)) {
        return Some(parsed);
    }
    for candidate in [
        DateFormatHint::Iso,
        DateFormatHint::UsSlash,
        DateFormatHint::IsoDateTime,
    ] {
        if let Some(parsed) = candidate.parse(trimmed) {
            *hint = Some(candidate);
            return Some(parsed);
        }
    }
    None
}

fn parse_code(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Read contract the forecaster depends on.
pub trait ObservationSource: Send + Sync {
    /// Up to `window_days` most recent observations, oldest first.
    fn get_recent(&self, entity: &EntityId, window_days: usize) -> Result<Vec<Observation>>;

    /// All known entities, sorted by state then county.
    fn entities(&self) -> Vec<EntityId>;
}

/// Row returned by the historical endpoint.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HistoricalRecord {
    pub date: String,
    pub aqi: Option<i64>,
    pub category: String,
    pub defining_parameter: String,
}

/// In-memory observation table keyed by entity and date.
#[derive(Debug, Default)]
pub struct ObservationStore {
    series: BTreeMap<EntityId, BTreeMap<NaiveDate, Observation>>,
}

impl ObservationStore {
    /// Inserts an observation, replacing any earlier one for the same entity and date.
    pub fn upsert(&mut self, observation: Observation) {
        self.series
            .entry(observation.entity.clone())
            .or_default()
            .insert(observation.date, observation);
    }

    pub fn from_observations(observations: impl IntoIterator<Item = Observation>) -> Self {
        observations
            .into_iter()
            .fold(Self::default(), |mut store, observation| {
                store.upsert(observation);
                store
            })
    }

    /// Loads a CSV export; files ending in `.gz` are decompressed on the fly.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            ForecastError::Data(format!("Failed to open CSV {}: {err}", path.display()))
        })?;
        let is_gzip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(GZIP_EXTENSION));
        let input: Box<dyn Read> = if is_gzip {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let store = Self::from_reader(input)?;
        info!(
            operation = "ingestion",
            path = %path.display(),
            entities = store.series.len(),
            records = store.len(),
            "Loaded observations from CSV"
        );
        Ok(store)
    }

    pub fn from_reader<R: Read>(input: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(input);
        let mut hint = None;
        let mut skipped = 0usize;
        let mut store = Self::default();
        for row in reader.deserialize::<CsvRow>() {
            let row = row?;
            let Some(date) = parse_date_with_hint(&row.date, &mut hint) else {
                skipped += 1;
                continue;
            };
            let entity = EntityId::new(row.county.trim(), row.state.trim());
            store.upsert(Observation {
                entity,
                date,
                aqi_value: row.aqi.unwrap_or(f64::NAN),
                state_code: parse_code(row.state_code.as_deref()),
                county_code: parse_code(row.county_code.as_deref()),
                category: non_empty(row.category),
                defining_parameter: non_empty(row.defining_parameter),
            });
        }
        if skipped > 0 {
            warn!(
                operation = "ingestion",
                skipped, "Skipped rows with unparseable dates"
            );
        }
        Ok(store)
    }

    /// Total number of stored observations.
    pub fn len(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Full series for one entity, oldest first.
    pub fn series(&self, entity: &EntityId) -> Result<Vec<Observation>> {
        self.series
            .get(entity)
            .map(|days| days.values().cloned().collect())
            .ok_or_else(|| ForecastError::UnknownEntity(entity.clone()))
    }

    pub fn iter_series(&self) -> impl Iterator<Item = (&EntityId, Vec<&Observation>)> {
        self.series
            .iter()
            .map(|(entity, days)| (entity, days.values().collect()))
    }

    /// Most recent `days` records formatted for display.
    pub fn history(&self, entity: &EntityId, days: usize) -> Result<Vec<HistoricalRecord>> {
        let recent = self.get_recent(entity, days)?;
        Ok(recent
            .into_iter()
            .map(|observation| {
                let aqi = observation
                    .aqi_value
                    .is_finite()
                    .then(|| observation.aqi_value.round() as i64);
                let category = observation.category.unwrap_or_else(|| {
                    aqi.map_or_else(
                        || UNKNOWN_LABEL.to_string(),
                        |value| AqiCategory::from_aqi(value as f64).label().to_string(),
                    )
                });
                HistoricalRecord {
                    date: observation.date.format(DATE_FORMAT).to_string(),
                    aqi,
                    category,
                    defining_parameter: observation
                        .defining_parameter
                        .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
                }
            })
            .collect())
    }
}

impl ObservationSource for ObservationStore {
    fn get_recent(&self, entity: &EntityId, window_days: usize) -> Result<Vec<Observation>> {
        let days = self
            .series
            .get(entity)
            .ok_or_else(|| ForecastError::UnknownEntity(entity.clone()))?;
        let mut recent: Vec<Observation> =
            days.values().rev().take(window_days).cloned().collect();
        recent.reverse();
        Ok(recent)
    }

    fn entities(&self) -> Vec<EntityId> {
        self.series.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
State Name,county Name,State Code,County Code,Date,AQI,Category,Defining Parameter
Alabama,Baldwin,01,003,2024-01-01,40,Good,PM2.5
Alabama,Baldwin,01,003,2024-01-03,55,Moderate,Ozone
Alabama,Baldwin,01,003,2024-01-02,,,
Alabama,Baldwin,01,003,2024-01-03,60,Moderate,Ozone
Canada,Yukon,CC,001,01/05/2024,12,Good,PM2.5
Alabama,Baldwin,01,003,not-a-date,50,Good,PM2.5
";

    fn store() -> ObservationStore {
        ObservationStore::from_reader(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn upserts_by_entity_and_date() {
        let store = store();
        let baldwin = EntityId::new("Baldwin", "Alabama");
        let series = store.series(&baldwin).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[2].aqi_value, 60.0);
        assert!(series[1].aqi_value.is_nan());
        assert_eq!(series[0].state_code, Some(1.0));
        assert_eq!(series[0].county_code, Some(3.0));
    }

    #[test]
    fn parses_us_dates_and_ignores_non_numeric_codes() {
        let store = store();
        let yukon = store.series(&EntityId::new("Yukon", "Canada")).unwrap();
        assert_eq!(yukon[0].date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(yukon[0].state_code, None);
    }

    #[test]
    fn get_recent_returns_tail_oldest_first() {
        let store = store();
        let recent = store
            .get_recent(&EntityId::new("Baldwin", "Alabama"), 2)
            .unwrap();
        let dates: Vec<_> = recent.iter().map(|o| o.date.day0()).collect();
        assert_eq!(dates, vec![1, 2]);
    }

    #[test]
    fn unknown_entity_is_typed() {
        let err = store()
            .get_recent(&EntityId::new("Nowhere", "Alabama"), 30)
            .unwrap_err();
        assert!(matches!(err, ForecastError::UnknownEntity(_)));
    }

    #[test]
    fn history_fills_missing_labels() {
        let history = store()
            .history(&EntityId::new("Baldwin", "Alabama"), 30)
            .unwrap();
        assert_eq!(history[1].aqi, None);
        assert_eq!(history[1].category, "Unknown");
        assert_eq!(history[1].defining_parameter, "Unknown");
        assert_eq!(history[2].date, "2024-01-03");
    }

    #[test]
    fn entities_sorted_by_state() {
        let entities = store().entities();
        assert_eq!(
            entities,
            vec![
                EntityId::new("Baldwin", "Alabama"),
                EntityId::new("Yukon", "Canada")
            ]
        );
    }
}
