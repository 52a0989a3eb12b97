use crate::download::Downloader;
use crate::forecast::error::ForecastError;
use crate::utils::is_valid_station_id;
use async_trait::async_trait;
use log::debug;
use std::io::{Cursor, Read};
use tokio::task;

/// Placeholder replaced by the station identifier in the single-station URL template.
pub const STATION_PLACEHOLDER: &str = "{station}";

/// Which forecast package to work with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForecastTarget {
    AllStations,
    Station(String),
}

impl ForecastTarget {
    pub fn cache_key(&self) -> String {
        match self {
            ForecastTarget::AllStations => "station-forecast-all".to_string(),
            ForecastTarget::Station(id) => format!("station-forecast-{id}"),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ForecastError> {
        match self {
            ForecastTarget::Station(id) if !is_valid_station_id(id) => {
                Err(ForecastError::InvalidStationId(id.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Anything that can deliver the unpacked KML document for a target.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self, target: &ForecastTarget) -> Result<Vec<u8>, ForecastError>;
}

/// Downloads MOSMIX KMZ packages over HTTP and unpacks them.
#[derive(Debug, Clone)]
pub struct ForecastFetcher {
    downloader: Downloader,
    all_stations_url: String,
    station_url_template: String,
}

impl ForecastFetcher {
    pub fn new(
        downloader: Downloader,
        all_stations_url: impl Into<String>,
        station_url_template: impl Into<String>,
    ) -> Self {
        Self {
            downloader,
            all_stations_url: all_stations_url.into(),
            station_url_template: station_url_template.into(),
        }
    }

    pub fn station_url(&self, station: &str) -> String {
        self.station_url_template
            .replace(STATION_PLACEHOLDER, station)
    }

    pub async fn fetch_all(&self) -> Result<Vec<u8>, ForecastError> {
        self.fetch_package(self.all_stations_url.clone()).await
    }

    pub async fn fetch_station(&self, station: &str) -> Result<Vec<u8>, ForecastError> {
        if !is_valid_station_id(station) {
            return Err(ForecastError::InvalidStationId(station.to_string()));
        }
        self.fetch_package(self.station_url(station)).await
    }

    async fn fetch_package(&self, url: String) -> Result<Vec<u8>, ForecastError> {
        let archive = self.downloader.get(&url).await?;
        let limit = self.downloader.max_bytes();
        let document =
            task::spawn_blocking(move || unpack_first_entry(&url, archive, limit)).await??;
        Ok(document)
    }
}

#[async_trait]
impl ForecastSource for ForecastFetcher {
    async fn fetch(&self, target: &ForecastTarget) -> Result<Vec<u8>, ForecastError> {
        match target {
            ForecastTarget::AllStations => self.fetch_all().await,
            ForecastTarget::Station(id) => self.fetch_station(id).await,
        }
    }
}

/// KMZ packages hold a single KML file; its bytes are returned as-is. The unpacked document is
/// held to the same size limit as the download.
fn unpack_first_entry(url: &str, archive: Vec<u8>, limit: u64) -> Result<Vec<u8>, ForecastError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).map_err(|source| {
        ForecastError::Archive {
            url: url.to_string(),
            source,
        }
    })?;
    if zip.is_empty() {
        return Err(ForecastError::EmptyArchive(url.to_string()));
    }
    let entry = zip.by_index(0).map_err(|source| ForecastError::Archive {
        url: url.to_string(),
        source,
    })?;
    debug!("Unpacking '{}' ({} bytes) from {}", entry.name(), entry.size(), url);
    let too_large = || ForecastError::ArchiveTooLarge {
        url: url.to_string(),
        limit,
    };
    // Declared sizes are not trusted; the read is bounded as well.
    if entry.size() > limit {
        return Err(too_large());
    }
    let mut document = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry
        .take(limit + 1)
        .read_to_end(&mut document)
        .map_err(|e| ForecastError::ArchiveRead(url.to_string(), e))?;
    if document.len() as u64 > limit {
        return Err(too_large());
    }
    Ok(document)
}
