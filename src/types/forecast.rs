//! Forecast data as produced by the parser and stored in the cache: aligned per-timestamp
//! series for each location, plus the product metadata DWD publishes alongside them.

use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::{
    Column, DataFrame, DatetimeChunked, IntoLazy, IntoSeries, LazyFrame, NamedFrom, PolarsResult,
    Series, TimeUnit,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Name of the timestamp column in [`ForecastSeries::to_dataframe`].
pub const TIME_COLUMN: &str = "time";

#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("Timestamp at index {index} ({timestamp}) is not after its predecessor")]
    NotIncreasing {
        index: usize,
        timestamp: NaiveDateTime,
    },

    #[error("Variable '{variable}' has {found} values but there are {expected} timestamps")]
    LengthMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },
}

/// A time-indexed table of named numeric series.
///
/// Timestamps are UTC with the offset dropped and strictly increasing; every variable holds
/// exactly one value per timestamp, `None` marking a missing reading. The invariant is enforced
/// on construction and when deserialising, so a cached series can never be misaligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSeries")]
pub struct ForecastSeries {
    timestamps: Vec<NaiveDateTime>,
    variables: BTreeMap<String, Vec<Option<f64>>>,
}

#[derive(Deserialize)]
struct RawSeries {
    timestamps: Vec<NaiveDateTime>,
    #[serde(default)]
    variables: BTreeMap<String, Vec<Option<f64>>>,
}

impl TryFrom<RawSeries> for ForecastSeries {
    type Error = SeriesError;

    fn try_from(raw: RawSeries) -> Result<Self, Self::Error> {
        let mut series = ForecastSeries::new(raw.timestamps)?;
        for (name, values) in raw.variables {
            series.insert(name, values)?;
        }
        Ok(series)
    }
}

impl ForecastSeries {
    /// Creates a series without variables over the given timestamps.
    pub fn new(timestamps: Vec<NaiveDateTime>) -> Result<Self, SeriesError> {
        if let Some(index) = timestamps.windows(2).position(|w| w[1] <= w[0]) {
            return Err(SeriesError::NotIncreasing {
                index: index + 1,
                timestamp: timestamps[index + 1],
            });
        }
        Ok(Self {
            timestamps,
            variables: BTreeMap::new(),
        })
    }

    /// Adds or replaces a variable. Returns the previous values if the name was already present.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        values: Vec<Option<f64>>,
    ) -> Result<Option<Vec<Option<f64>>>, SeriesError> {
        let name = name.into();
        if values.len() != self.timestamps.len() {
            return Err(SeriesError::LengthMismatch {
                variable: name,
                expected: self.timestamps.len(),
                found: values.len(),
            });
        }
        Ok(self.variables.insert(name, values))
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    /// Number of timestamps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn variable(&self, name: &str) -> Option<&[Option<f64>]> {
        self.variables.get(name).map(Vec::as_slice)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &[Option<f64>])> {
        self.variables
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// The value of `name` at `timestamp`; `None` if either is unknown or the reading is missing.
    pub fn value_at(&self, name: &str, timestamp: NaiveDateTime) -> Option<f64> {
        let index = self.timestamps.binary_search(&timestamp).ok()?;
        self.variables.get(name)?[index]
    }

    /// All variables at one timestamp index.
    pub fn row(&self, index: usize) -> Option<(NaiveDateTime, BTreeMap<&str, Option<f64>>)> {
        let timestamp = *self.timestamps.get(index)?;
        let values = self
            .variables
            .iter()
            .map(|(name, values)| (name.as_str(), values[index]))
            .collect();
        Some((timestamp, values))
    }

    /// Iterates the table row by row in timestamp order.
    pub fn rows(&self) -> impl Iterator<Item = (NaiveDateTime, BTreeMap<&str, Option<f64>>)> + '_ {
        (0..self.timestamps.len()).filter_map(move |i| self.row(i))
    }

    /// Converts the series into a Polars `DataFrame` with a millisecond `time` column followed
    /// by one nullable `f64` column per variable.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.variables.len() + 1);
        let time = DatetimeChunked::from_naive_datetime(
            TIME_COLUMN.into(),
            self.timestamps.iter().copied(),
            TimeUnit::Milliseconds,
        );
        columns.push(time.into_series().into());
        for (name, values) in &self.variables {
            columns.push(Series::new(name.as_str().into(), values.as_slice()).into());
        }
        DataFrame::new(columns)
    }

    pub fn lazy(&self) -> PolarsResult<LazyFrame> {
        self.to_dataframe().map(IntoLazy::lazy)
    }
}

/// Longitude, latitude and elevation as given in the placemark's `Point`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: Option<f64>,
}

/// The forecast for one location (KML placemark).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationForecast {
    /// Station code, matching [`crate::Station::id`].
    pub id: String,
    pub description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub series: ForecastSeries,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedModel {
    pub name: String,
    pub reference_time: Option<NaiveDateTime>,
}

/// Metadata from the document's product definition. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductDefinition {
    pub issuer: Option<String>,
    pub product_id: Option<String>,
    pub generating_process: Option<String>,
    pub issue_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub referenced_models: Vec<ReferencedModel>,
}

/// Either the single station that was requested, or every station in the all-stations package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "locations", rename_all = "snake_case")]
pub enum ForecastSet {
    Station(LocationForecast),
    AllStations(Vec<LocationForecast>),
}

impl ForecastSet {
    pub fn locations(&self) -> &[LocationForecast] {
        match self {
            ForecastSet::Station(location) => std::slice::from_ref(location),
            ForecastSet::AllStations(locations) => locations,
        }
    }
}

/// Parsed content of one forecast package; this is what gets cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDocument {
    pub product: ProductDefinition,
    pub forecasts: ForecastSet,
}

/// How a snapshot was obtained on this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// Downloaded and parsed during this call.
    Downloaded,
    /// Read from a cache entry that is within its maximum age.
    Cache,
    /// A refresh failed and an expired cache entry was served instead.
    StaleCache,
}

/// The result of one fetch+parse cycle, or its cached copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSnapshot {
    /// When the underlying package was downloaded.
    pub fetched_at: DateTime<Utc>,
    pub origin: SnapshotOrigin,
    pub product: ProductDefinition,
    pub forecasts: ForecastSet,
}

impl ForecastSnapshot {
    pub(crate) fn from_document(
        document: ForecastDocument,
        fetched_at: DateTime<Utc>,
        origin: SnapshotOrigin,
    ) -> Self {
        Self {
            fetched_at,
            origin,
            product: document.product,
            forecasts: document.forecasts,
        }
    }

    pub fn locations(&self) -> &[LocationForecast] {
        self.forecasts.locations()
    }

    pub fn location(&self, id: &str) -> Option<&LocationForecast> {
        self.locations().iter().find(|l| l.id == id)
    }
}
