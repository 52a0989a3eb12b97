//! Decodes MOSMIX KML documents into aligned per-location series.
//!
//! Parsing is done in two passes. The first walks the XML events once and collects the product
//! definition, the shared list of time steps and the raw per-placemark values. The second aligns
//! every placemark against the time steps. Tags and attributes are matched on their local name,
//! so namespace prefixes (`kml:`, `dwd:`) do not matter.

use crate::forecast::error::{ForecastError, ParseError};
use crate::types::forecast::{
    Coordinates, ForecastDocument, ForecastSeries, ForecastSet, LocationForecast,
    ProductDefinition, ReferencedModel,
};
use chrono::{DateTime, NaiveDateTime};
use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;

/// Everything recovered from one document, including the placemarks that had to be dropped.
#[derive(Debug)]
pub struct ParsedDocument {
    pub product: ProductDefinition,
    pub locations: Vec<LocationForecast>,
    pub rejected: Vec<ParseError>,
}

/// Parses a document that must describe exactly one station.
///
/// Any placemark-level problem fails the whole document here.
pub fn parse_station_forecast(bytes: &[u8]) -> Result<ForecastDocument, ForecastError> {
    let mut parsed = parse_document(bytes)?;
    if !parsed.rejected.is_empty() {
        return Err(parsed.rejected.remove(0).into());
    }
    if parsed.locations.len() != 1 {
        return Err(ForecastError::UnexpectedLocationCount {
            found: parsed.locations.len(),
        });
    }
    let location = parsed.locations.remove(0);
    Ok(ForecastDocument {
        product: parsed.product,
        forecasts: ForecastSet::Station(location),
    })
}

/// Parses the all-stations document, skipping placemarks that cannot be aligned.
pub fn parse_all_forecasts(bytes: &[u8]) -> Result<ForecastDocument, ForecastError> {
    let parsed = parse_document(bytes)?;
    for rejected in &parsed.rejected {
        warn!("Skipping location: {}", error_chain(rejected));
    }
    if parsed.locations.is_empty() {
        return Err(ForecastError::NoLocations);
    }
    debug!(
        "Parsed {} locations ({} skipped)",
        parsed.locations.len(),
        parsed.rejected.len()
    );
    Ok(ForecastDocument {
        product: parsed.product,
        forecasts: ForecastSet::AllStations(parsed.locations),
    })
}

/// Parses a document into locations, keeping placemark-level failures separate.
pub fn parse_document(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
    let raw = scan(bytes)?;

    let timestamps = raw
        .timesteps
        .iter()
        .map(|step| parse_timestamp(step))
        .collect::<Result<Vec<_>, _>>()?;
    let template = ForecastSeries::new(timestamps).map_err(ParseError::NonIncreasingTimestamps)?;

    let mut locations = Vec::with_capacity(raw.placemarks.len());
    let mut rejected = Vec::new();
    for (index, placemark) in raw.placemarks.into_iter().enumerate() {
        match align(index, placemark, &template) {
            Ok(location) => locations.push(location),
            Err(e) => rejected.push(e),
        }
    }
    Ok(ParsedDocument {
        product: raw.product,
        locations,
        rejected,
    })
}

#[derive(Debug, Default)]
struct RawPlacemark {
    id: Option<String>,
    description: Option<String>,
    coordinates: Option<Coordinates>,
    forecasts: Vec<(String, Vec<Option<f64>>)>,
}

#[derive(Debug, Default)]
struct RawDocument {
    product: ProductDefinition,
    timesteps: Vec<String>,
    placemarks: Vec<RawPlacemark>,
}

/// Elements whose text content is collected.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    TimeStep,
    Issuer,
    ProductId,
    GeneratingProcess,
    IssueTime,
    Name,
    Description,
    Coordinates,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TextEncoding {
    Utf8,
    Latin1,
}

impl TextEncoding {
    fn decode<'a>(self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes),
            TextEncoding::Latin1 => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

fn scan(bytes: &[u8]) -> Result<RawDocument, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut doc = RawDocument::default();
    let mut encoding = TextEncoding::Utf8;
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut placemark: Option<RawPlacemark> = None;
    let mut element: Option<String> = None;
    let mut capture: Option<Capture> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|source| ParseError::Xml {
                position: reader.error_position() as u64,
                source,
            })?;
        let xml_err = |source: quick_xml::Error| ParseError::Xml {
            position: reader.buffer_position() as u64,
            source,
        };
        match event {
            Event::Decl(decl) => {
                if let Some(Ok(declared)) = decl.encoding() {
                    if is_latin1(&declared) {
                        encoding = TextEncoding::Latin1;
                    }
                }
            }
            Event::Start(start) => {
                let local = start.local_name().as_ref().to_vec();
                let parent = stack.last().map(Vec::as_slice);
                match local.as_slice() {
                    b"Placemark" => placemark = Some(RawPlacemark::default()),
                    b"Forecast" if placemark.is_some() => {
                        element = attribute(&start, b"elementName", encoding).map_err(xml_err)?;
                    }
                    b"value" if element.is_some() => capture = Some(Capture::Value),
                    b"name" if parent == Some(b"Placemark".as_slice()) => {
                        capture = Some(Capture::Name)
                    }
                    b"description" if parent == Some(b"Placemark".as_slice()) => {
                        capture = Some(Capture::Description)
                    }
                    b"coordinates" if placemark.is_some() => capture = Some(Capture::Coordinates),
                    b"TimeStep" if placemark.is_none() => capture = Some(Capture::TimeStep),
                    b"Issuer" if placemark.is_none() => capture = Some(Capture::Issuer),
                    b"ProductID" if placemark.is_none() => capture = Some(Capture::ProductId),
                    b"GeneratingProcess" if placemark.is_none() => {
                        capture = Some(Capture::GeneratingProcess)
                    }
                    b"IssueTime" if placemark.is_none() => capture = Some(Capture::IssueTime),
                    b"Model" => {
                        if let Some(model) = referenced_model(&start, encoding).map_err(xml_err)? {
                            doc.product.referenced_models.push(model);
                        }
                    }
                    _ => {}
                }
                if capture.is_some() {
                    text.clear();
                }
                stack.push(local);
            }
            Event::Empty(start) => {
                if start.local_name().as_ref() == b"Model" {
                    if let Some(model) = referenced_model(&start, encoding).map_err(xml_err)? {
                        doc.product.referenced_models.push(model);
                    }
                }
            }
            Event::Text(t) if capture.is_some() => {
                let decoded = encoding.decode(&t);
                let unescaped = quick_xml::escape::unescape(&decoded)
                    .map_err(|e| xml_err(quick_xml::Error::from(e)))?;
                text.push_str(&unescaped);
            }
            Event::CData(c) if capture.is_some() => text.push_str(&encoding.decode(&c)),
            Event::End(end) => {
                let local = end.local_name();
                if let Some(kind) = capture.take() {
                    store_capture(kind, &text, &mut doc, &mut placemark, element.as_deref());
                }
                match local.as_ref() {
                    b"Forecast" => element = None,
                    b"Placemark" => {
                        if let Some(finished) = placemark.take() {
                            doc.placemarks.push(finished);
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(doc)
}

fn store_capture(
    kind: Capture,
    text: &str,
    doc: &mut RawDocument,
    placemark: &mut Option<RawPlacemark>,
    element: Option<&str>,
) {
    let text = text.trim();
    let owned = || Some(text.to_string());
    match kind {
        Capture::TimeStep => doc.timesteps.push(text.to_string()),
        Capture::Issuer => doc.product.issuer = owned(),
        Capture::ProductId => doc.product.product_id = owned(),
        Capture::GeneratingProcess => doc.product.generating_process = owned(),
        Capture::IssueTime => match parse_timestamp(text) {
            Ok(t) => doc.product.issue_time = Some(t),
            Err(e) => debug!("Ignoring unparseable issue time: {}", e),
        },
        Capture::Name | Capture::Description | Capture::Coordinates | Capture::Value => {
            let Some(placemark) = placemark.as_mut() else {
                return;
            };
            match kind {
                Capture::Name => placemark.id = owned(),
                Capture::Description => placemark.description = owned(),
                Capture::Coordinates => placemark.coordinates = parse_coordinates(text),
                _ => {
                    if let Some(element) = element {
                        placemark
                            .forecasts
                            .push((element.to_string(), parse_values(text)));
                    }
                }
            }
        }
    }
}

fn align(
    index: usize,
    placemark: RawPlacemark,
    template: &ForecastSeries,
) -> Result<LocationForecast, ParseError> {
    let id = match placemark.id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(ParseError::MissingIdentifier { index }),
    };
    let mut series = template.clone();
    for (name, values) in placemark.forecasts {
        let replaced = series
            .insert(name.as_str(), values)
            .map_err(|source| ParseError::Misaligned {
                location: id.clone(),
                source,
            })?;
        if replaced.is_some() {
            warn!("Location '{}' lists '{}' more than once; keeping the last", id, name);
        }
    }
    Ok(LocationForecast {
        id,
        description: placemark.description,
        coordinates: placemark.coordinates,
        series,
    })
}

/// Splits a value blob on whitespace. Tokens that are not finite numbers (DWD writes `-`) are
/// missing.
pub(crate) fn parse_values(text: &str) -> Vec<Option<f64>> {
    text.split_whitespace()
        .map(|token| token.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect()
}

/// Parses an RFC 3339 time step and normalises it to naive UTC. Time steps without an offset
/// are taken to be UTC already.
pub(crate) fn parse_timestamp(text: &str) -> Result<NaiveDateTime, ParseError> {
    let text = text.trim();
    match DateTime::parse_from_rfc3339(text) {
        Ok(dt) => Ok(dt.naive_utc()),
        Err(e) => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|_| ParseError::Timestamp(text.to_string(), e)),
    }
}

fn parse_coordinates(text: &str) -> Option<Coordinates> {
    let mut parts = text.split(',').map(|p| p.trim().parse::<f64>());
    let (Some(Ok(longitude)), Some(Ok(latitude))) = (parts.next(), parts.next()) else {
        debug!("Ignoring unparseable coordinates '{}'", text);
        return None;
    };
    let elevation = parts.next().and_then(Result::ok);
    Some(Coordinates {
        longitude,
        latitude,
        elevation,
    })
}

fn attribute(
    start: &BytesStart<'_>,
    name: &[u8],
    encoding: TextEncoding,
) -> Result<Option<String>, quick_xml::Error> {
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == name {
            let decoded = encoding.decode(&attr.value);
            let value = quick_xml::escape::unescape(&decoded).map_err(quick_xml::Error::from)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn referenced_model(
    start: &BytesStart<'_>,
    encoding: TextEncoding,
) -> Result<Option<ReferencedModel>, quick_xml::Error> {
    let Some(name) = attribute(start, b"name", encoding)? else {
        return Ok(None);
    };
    let reference_time = attribute(start, b"referenceTime", encoding)?
        .and_then(|t| parse_timestamp(&t).ok());
    Ok(Some(ReferencedModel {
        name,
        reference_time,
    }))
}

fn is_latin1(label: &[u8]) -> bool {
    let label = String::from_utf8_lossy(label).to_ascii_lowercase();
    matches!(label.as_str(), "iso-8859-1" | "latin1" | "latin-1" | "iso8859-1")
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
