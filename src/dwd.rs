//! The main entry point: a client that serves DWD MOSMIX forecasts and station lookups from a
//! local cache, refreshing from the DWD open data server when needed.

use crate::cache::store::CacheStore;
use crate::config::DwdConfig;
use crate::download::Downloader;
use crate::error::DwdError;
use crate::forecast::fetcher::{ForecastFetcher, ForecastTarget};
use crate::forecast::provider::ForecastProvider;
use crate::stations::directory::{StationDirectory, DEFAULT_MAX_CANDIDATES, DIRECTORY_CACHE_KEY};
use crate::stations::probe::HttpProbe;
use crate::stations::source::HttpDirectorySource;
use crate::types::forecast::ForecastSnapshot;
use crate::types::station::{DirectorySnapshot, Station};
use crate::utils::{ensure_cache_dir_exists, get_cache_dir};
use bon::bon;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Represents a geographical coordinate using latitude and longitude.
///
/// Latitude is the first element (index 0), and longitude is the second (index 1).
///
/// ```
/// use dwd_forecast::LatLon;
///
/// let munich = LatLon(48.137, 11.575);
/// assert_eq!(munich.0, 48.137); // Latitude
/// assert_eq!(munich.1, 11.575); // Longitude
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon(pub f64, pub f64);

/// Client for DWD MOSMIX point forecasts and the DWD station directory.
///
/// # Examples
///
/// ```no_run
/// # use dwd_forecast::{Dwd, DwdError};
/// # #[tokio::main]
/// # async fn main() -> Result<(), DwdError> {
/// let dwd = Dwd::new().await?;
/// let station = dwd.search_by_name("München").await?;
/// let forecast = dwd.get_forecast(Some(&station.id), false).await?;
/// println!("{:?}", forecast.locations()[0].series.to_dataframe());
/// # Ok(())
/// # }
/// ```
pub struct Dwd {
    config: DwdConfig,
    cache_dir: PathBuf,
    store: Arc<CacheStore>,
    forecasts: ForecastProvider,
    directory: StationDirectory,
}

#[bon]
impl Dwd {
    /// Creates a client with default settings, caching in the user cache directory
    /// (e.g. `~/.cache/dwd_forecast_cache` on Linux).
    ///
    /// # Errors
    ///
    /// Returns [`DwdError::CacheDirResolution`] if the default cache directory cannot be found,
    /// or [`DwdError::CacheDirCreation`] if it cannot be created.
    pub async fn new() -> Result<Self, DwdError> {
        Self::with_config(DwdConfig::default()).await
    }

    /// Creates a client with default settings that caches in `cache_folder`.
    ///
    /// The directory is created if it doesn't exist.
    pub async fn with_cache_folder(cache_folder: PathBuf) -> Result<Self, DwdError> {
        Self::with_config(DwdConfig::builder().cache_dir(cache_folder).build()).await
    }

    /// Creates a client from an explicit [`DwdConfig`].
    pub async fn with_config(config: DwdConfig) -> Result<Self, DwdError> {
        let cache_dir = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => get_cache_dir().map_err(DwdError::CacheDirResolution)?,
        };
        ensure_cache_dir_exists(&cache_dir)
            .await
            .map_err(|e| DwdError::CacheDirCreation(cache_dir.clone(), e))?;

        let downloader = Downloader::new(config.request_timeout, config.max_download_bytes)
            .map_err(DwdError::HttpClient)?;
        let store = Arc::new(CacheStore::new(&cache_dir));

        let fetcher = ForecastFetcher::new(
            downloader.clone(),
            config.all_stations_url.clone(),
            config.station_url_template.clone(),
        );
        let forecasts = ForecastProvider::new(
            Arc::new(fetcher),
            store.clone(),
            config.forecast_max_age,
            config.refresh_policy,
        );

        let probe_downloader = Downloader::new(config.probe_timeout, config.max_download_bytes)
            .map_err(DwdError::HttpClient)?;
        let probe = HttpProbe::new(probe_downloader, config.station_url_template.clone());
        let directory = StationDirectory::new(
            Arc::new(HttpDirectorySource::new(
                downloader,
                config.directory_url.clone(),
            )),
            Arc::new(probe),
            store.clone(),
            config.directory_max_age,
        );

        debug!("DWD client caching in {}", cache_dir.display());
        Ok(Self {
            config,
            cache_dir,
            store,
            forecasts,
            directory,
        })
    }

    pub fn config(&self) -> &DwdConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the forecast for one station, or for all stations when `station` is `None`.
    ///
    /// A cached forecast younger than the configured maximum age is returned without touching
    /// the network unless `force_refresh` is set. If downloading fails and an older forecast is
    /// cached, that one is returned with [`crate::SnapshotOrigin::StaleCache`].
    ///
    /// # Errors
    ///
    /// [`DwdError::Forecast`] when the station id is invalid, or when no forecast could be
    /// downloaded and none is cached.
    pub async fn get_forecast(
        &self,
        station: Option<&str>,
        force_refresh: bool,
    ) -> Result<ForecastSnapshot, DwdError> {
        let target = match station {
            Some(id) => ForecastTarget::Station(id.to_string()),
            None => ForecastTarget::AllStations,
        };
        Ok(self.forecasts.get_forecast(&target, force_refresh).await?)
    }

    /// Builder form of [`Dwd::get_forecast`].
    ///
    /// * `.station(impl Into<String>)`: Optional. Omit for the all-stations package.
    /// * `.force_refresh(bool)`: Optional. Defaults to `false`.
    ///
    /// ```no_run
    /// # use dwd_forecast::{Dwd, DwdError};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), DwdError> {
    /// let dwd = Dwd::new().await?;
    /// let forecast = dwd.forecast().station("10865").call().await?;
    /// let all = dwd.forecast().force_refresh(true).call().await?;
    /// # Ok(())
    /// # }
    /// ```
    #[builder]
    pub async fn forecast(
        &self,
        #[builder(into)] station: Option<String>,
        #[builder(default)] force_refresh: bool,
    ) -> Result<ForecastSnapshot, DwdError> {
        self.get_forecast(station.as_deref(), force_refresh).await
    }

    /// Returns the station directory, downloading it when the cached copy is older than the
    /// configured maximum age or when `force` is set.
    pub async fn refresh_directory(&self, force: bool) -> Result<Arc<DirectorySnapshot>, DwdError> {
        Ok(self.directory.refresh(force).await?)
    }

    /// Finds the station whose name contains `text` (case-sensitive). When several match, the
    /// one with the most recent coverage end wins.
    pub async fn search_by_name(&self, text: &str) -> Result<Station, DwdError> {
        Ok(self.directory.search_by_name(text).await?)
    }

    /// Stations still reporting data, sorted by distance in kilometres from `location`.
    pub async fn stations_by_distance(
        &self,
        location: LatLon,
    ) -> Result<Vec<(Station, f64)>, DwdError> {
        Ok(self
            .directory
            .stations_by_distance(location.0, location.1)
            .await?)
    }

    /// Finds the closest station that is still reporting, together with its distance in km.
    ///
    /// This method uses a builder pattern.
    ///
    /// # Arguments
    ///
    /// * `.location(LatLon)`: **Required.** The point to search from.
    /// * `.max_candidates(usize)`: Optional. How many of the closest stations to probe. Defaults to `100`.
    /// * `.reachability_probe(bool)`: Optional. Whether to skip stations whose forecast package
    ///   does not exist. Defaults to [`DwdConfig::reachability_probe`].
    ///
    /// # Errors
    ///
    /// [`DwdError::Station`] for invalid coordinates, when no station qualifies, or when the
    /// directory cannot be loaded at all.
    ///
    /// ```no_run
    /// # use dwd_forecast::{Dwd, DwdError, LatLon};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), DwdError> {
    /// let dwd = Dwd::new().await?;
    /// let (station, km) = dwd
    ///     .nearest()
    ///     .location(LatLon(48.137, 11.575))
    ///     .max_candidates(10)
    ///     .call()
    ///     .await?;
    /// println!("{} is {:.1} km away", station.name, km);
    /// # Ok(())
    /// # }
    /// ```
    #[builder]
    pub async fn nearest(
        &self,
        location: LatLon,
        max_candidates: Option<usize>,
        reachability_probe: Option<bool>,
    ) -> Result<(Station, f64), DwdError> {
        let max_candidates = max_candidates.unwrap_or(DEFAULT_MAX_CANDIDATES);
        let reachability_probe = reachability_probe.unwrap_or(self.config.reachability_probe);
        Ok(self
            .directory
            .nearest(location.0, location.1, max_candidates, reachability_probe)
            .await?)
    }

    /// Deletes every cached forecast and the cached directory. Returns how many files were
    /// removed.
    pub async fn clear_cache(&self) -> Result<usize, DwdError> {
        let mut removed = 0;
        for key in self.cached_keys().await? {
            if self.store.remove(&key).await? {
                removed += 1;
            }
        }
        self.directory.forget();
        info!("Removed {} cache files from {}", removed, self.cache_dir.display());
        Ok(removed)
    }

    async fn cached_keys(&self) -> Result<Vec<String>, DwdError> {
        let read_error = |e| DwdError::CacheDirRead(self.cache_dir.clone(), e);
        let mut entries = tokio::fs::read_dir(&self.cache_dir).await.map_err(read_error)?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if key == DIRECTORY_CACHE_KEY || key.starts_with("station-forecast-") {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}
