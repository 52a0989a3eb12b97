//! Parses the DWD station lexicon (`statlex_html`) into [`Station`]s.
//!
//! The page is one large table preceded by caption rows. The header row is located by its
//! column names rather than by position, and every following row with enough cells is a
//! candidate station. Rows that cannot be turned into a valid station are dropped with a
//! logged reason.

use crate::stations::error::StationError;
use crate::types::station::{DateRange, Location, Station};
use crate::utils::is_valid_station_id;
use chrono::NaiveDate;
use log::{debug, warn};
use scraper::{Html, Selector};
use std::collections::HashMap;

const DATE_FORMAT: &str = "%d.%m.%Y";

const COL_ID: &str = "Stations-kennung";
const COL_NAME: &str = "Stationsname";
const COL_LATITUDE: &str = "Breite";
const COL_LONGITUDE: &str = "Länge";
const COL_ELEVATION: &str = "Stations-höhe";
const COL_START: &str = "Beginn";
const COL_END: &str = "Ende";
const COL_RIVER_BASIN: &str = "Flussgebiet";
const COL_NATIONAL_ID: &str = "Stations_ID";
const COL_KIND: &str = "Kennung";
const COL_STATE: &str = "Bundesland";

struct Columns {
    id: usize,
    name: usize,
    latitude: usize,
    longitude: usize,
    elevation: usize,
    start: usize,
    end: usize,
    river_basin: Option<usize>,
    national_id: Option<usize>,
    kind: Option<usize>,
    state: Option<usize>,
}

impl Columns {
    fn locate(header: &[String]) -> Result<Self, StationError> {
        let position = |name: &str| header.iter().position(|cell| cell == name);
        let required = |name: &str| {
            position(name)
                .ok_or_else(|| StationError::Html(format!("missing column '{name}'")))
        };
        Ok(Self {
            id: required(COL_ID)?,
            name: required(COL_NAME)?,
            latitude: required(COL_LATITUDE)?,
            longitude: required(COL_LONGITUDE)?,
            elevation: required(COL_ELEVATION)?,
            start: required(COL_START)?,
            end: required(COL_END)?,
            river_basin: position(COL_RIVER_BASIN),
            national_id: position(COL_NATIONAL_ID),
            kind: position(COL_KIND),
            state: position(COL_STATE),
        })
    }

    fn width(&self) -> usize {
        [
            self.id,
            self.name,
            self.latitude,
            self.longitude,
            self.elevation,
            self.start,
            self.end,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }

    fn station(&self, cells: &[String]) -> Result<Station, String> {
        let id = cells[self.id].as_str();
        if !is_valid_station_id(id) {
            return Err(format!("invalid station id '{id}'"));
        }
        let name = cells[self.name].as_str();
        if name.is_empty() {
            return Err(format!("station '{id}' has no name"));
        }
        let latitude = parse_decimal(&cells[self.latitude])
            .filter(|v| (-90.0..=90.0).contains(v))
            .ok_or_else(|| format!("station '{id}' has invalid latitude '{}'", cells[self.latitude]))?;
        let longitude = parse_decimal(&cells[self.longitude])
            .filter(|v| (-180.0..=180.0).contains(v))
            .ok_or_else(|| {
                format!("station '{id}' has invalid longitude '{}'", cells[self.longitude])
            })?;
        let elevation = parse_decimal(&cells[self.elevation])
            .map(|v| v.round() as i32)
            .ok_or_else(|| {
                format!("station '{id}' has invalid elevation '{}'", cells[self.elevation])
            })?;

        let optional = |index: Option<usize>| {
            index
                .and_then(|i| cells.get(i))
                .map(|s| s.as_str())
                .filter(|s| !s.is_empty())
        };

        Ok(Station {
            id: id.to_string(),
            name: name.to_string(),
            location: Location {
                latitude,
                longitude,
                elevation,
            },
            coverage: DateRange {
                start: parse_date(&cells[self.start]),
                end: parse_date(&cells[self.end]),
            },
            river_basin: optional(self.river_basin)
                .and_then(|s| parse_decimal(s))
                .map(|v| v as i64),
            national_id: optional(self.national_id).and_then(|s| s.parse().ok()),
            kind: optional(self.kind).map(str::to_string),
            state: optional(self.state).map(str::to_string),
        })
    }
}

/// Extracts the stations from a directory page, in table order, one per identifier.
pub fn parse_directory(html: &str) -> Result<Vec<Station>, StationError> {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse("tr").map_err(|e| StationError::Html(e.to_string()))?;
    let cell_selector =
        Selector::parse("th, td").map_err(|e| StationError::Html(e.to_string()))?;

    let rows: Vec<Vec<String>> = document
        .select(&row_selector)
        .map(|row| {
            row.select(&cell_selector)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect()
        })
        .collect();

    let header_index = rows
        .iter()
        .position(|cells| cells.iter().any(|c| normalize_header(c) == COL_ID))
        .ok_or_else(|| StationError::Html(format!("no header row with '{COL_ID}'")))?;
    let header: Vec<String> = rows[header_index]
        .iter()
        .map(|c| normalize_header(c))
        .collect();
    let columns = Columns::locate(&header)?;
    let width = columns.width();

    let mut stations: Vec<Station> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (row_number, cells) in rows.iter().enumerate().skip(header_index + 1) {
        if cells.len() < width {
            debug!("Skipping directory row {}: only {} cells", row_number, cells.len());
            continue;
        }
        let station = match columns.station(cells) {
            Ok(station) => station,
            Err(reason) => {
                warn!("Skipping directory row {}: {}", row_number, reason);
                continue;
            }
        };
        match positions.get(&station.id) {
            Some(&existing) => {
                if station.coverage.end > stations[existing].coverage.end {
                    debug!("Station '{}' listed again with a later end date", station.id);
                    stations[existing] = station;
                }
            }
            None => {
                positions.insert(station.id.clone(), stations.len());
                stations.push(station);
            }
        }
    }

    if stations.is_empty() {
        return Err(StationError::EmptyDirectory);
    }
    debug!("Parsed {} stations from directory page", stations.len());
    Ok(stations)
}

/// Header cells sometimes carry line breaks inside the words ("Stations-<br>kennung").
fn normalize_header(cell: &str) -> String {
    cell.split_whitespace().collect()
}

fn parse_decimal(text: &str) -> Option<f64> {
    text.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok()
}
