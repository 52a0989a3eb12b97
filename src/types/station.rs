//! Defines the data structures representing DWD weather stations as listed in the
//! station directory: identifiers, location and the period the station reports data for.

use chrono::{DateTime, NaiveDate, Utc};
use haversine::{distance, Location as HaversineLocation, Units};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::forecast::SnapshotOrigin;

/// Represents a single DWD station from the station directory.
///
/// The `id` is the station code used by the MOSMIX forecast feed (e.g. `"10865"` for
/// München-Stadt or `"P0489"` for a non-WMO site). It is unique within a
/// [`DirectorySnapshot`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Station {
    /// The station code used in forecast URLs (`Stations-kennung`).
    pub id: String,
    /// The display name (`Stationsname`), e.g. `"München-Stadt"`.
    pub name: String,
    /// Geographical location details (latitude, longitude, elevation).
    pub location: Location,
    /// The period the directory reports the station as active.
    pub coverage: DateRange,
    /// Numeric river basin code (`Flussgebiet`), if listed.
    pub river_basin: Option<i64>,
    /// DWD's numeric climate station id (`Stations_ID`), if listed.
    pub national_id: Option<u32>,
    /// Station kind (`Kennung`), e.g. `"SY"` for synoptic stations.
    pub kind: Option<String>,
    /// Federal state (`Bundesland`), if listed.
    pub state: Option<String>,
}

/// Represents the geographical location of a weather station.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Location {
    /// Latitude in decimal degrees (positive for North, negative for South).
    pub latitude: f64,
    /// Longitude in decimal degrees (positive for East, negative for West).
    pub longitude: f64,
    /// Elevation above sea level in metres.
    pub elevation: i32,
}

/// Represents a date range with optional start and end dates.
///
/// Dates the directory lists in an unparseable form are kept as `None` rather than
/// rejecting the station.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct DateRange {
    /// The first date the station reported data, if known.
    pub start: Option<NaiveDate>,
    /// The last date the station reported data, if known.
    pub end: Option<NaiveDate>,
}

impl Station {
    /// Great-circle distance in kilometres from this station to the given point.
    pub fn distance_km(&self, latitude: f64, longitude: f64) -> f64 {
        distance(
            HaversineLocation {
                latitude,
                longitude,
            },
            HaversineLocation {
                latitude: self.location.latitude,
                longitude: self.location.longitude,
            },
            Units::Kilometers,
        )
    }

    /// Whether the coverage end lies no more than `max_lag_days` before `today`.
    ///
    /// Stations without a coverage end are treated as decommissioned.
    pub fn is_current(&self, today: NaiveDate, max_lag_days: i64) -> bool {
        match self.coverage.end {
            Some(end) => (today - end).num_days() < max_lag_days,
            None => false,
        }
    }
}

/// The full result of one directory download, or its cached copy.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorySnapshot {
    /// When the directory was downloaded.
    pub fetched_at: DateTime<Utc>,
    /// Where this snapshot came from on this call.
    pub origin: SnapshotOrigin,
    /// Stations in directory order.
    pub stations: Arc<Vec<Station>>,
}
