//! Settings for [`crate::Dwd`]. Every field has a default matching the public DWD endpoints.

use crate::cache::keyed_locks::RefreshPolicy;
use bon::Builder;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DIRECTORY_URL: &str = "https://www.dwd.de/DE/leistungen/klimadatendeutschland/statliste/statlex_html.html?view=nasPublication&nn=16102";
pub const DEFAULT_ALL_STATIONS_URL: &str =
    "https://opendata.dwd.de/weather/local_forecasts/mos/MOSMIX_L/all_stations/kml/MOSMIX_L_LATEST.kmz";
pub const DEFAULT_STATION_URL_TEMPLATE: &str = "https://opendata.dwd.de/weather/local_forecasts/mos/MOSMIX_L/single_stations/{station}/kml/MOSMIX_L_LATEST_{station}.kmz";

pub const DEFAULT_FORECAST_MAX_AGE: Duration = Duration::from_secs(3600);
pub const DEFAULT_DIRECTORY_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// Configuration for a [`crate::Dwd`] client.
///
/// ```
/// use dwd_forecast::{DwdConfig, RefreshPolicy};
/// use std::time::Duration;
///
/// let config = DwdConfig::builder()
///     .cache_dir("/tmp/dwd".into())
///     .forecast_max_age(Duration::from_secs(600))
///     .refresh_policy(RefreshPolicy::ServeStale)
///     .build();
/// assert_eq!(config.forecast_max_age, Duration::from_secs(600));
/// assert!(config.reachability_probe);
/// ```
#[derive(Debug, Clone, Builder)]
pub struct DwdConfig {
    /// Where cache files live. Defaults to a `dwd_forecast_cache` folder in the user cache dir.
    pub cache_dir: Option<PathBuf>,

    /// Station lexicon page (HTML).
    #[builder(into, default = DEFAULT_DIRECTORY_URL.to_string())]
    pub directory_url: String,

    /// KMZ package with the forecasts of all stations.
    #[builder(into, default = DEFAULT_ALL_STATIONS_URL.to_string())]
    pub all_stations_url: String,

    /// KMZ package of one station; `{station}` is replaced by the station id.
    #[builder(into, default = DEFAULT_STATION_URL_TEMPLATE.to_string())]
    pub station_url_template: String,

    #[builder(default = DEFAULT_FORECAST_MAX_AGE)]
    pub forecast_max_age: Duration,

    #[builder(default = DEFAULT_DIRECTORY_MAX_AGE)]
    pub directory_max_age: Duration,

    /// Total time allowed for one download.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,

    /// Total time allowed for one reachability check.
    #[builder(default = DEFAULT_PROBE_TIMEOUT)]
    pub probe_timeout: Duration,

    /// Responses larger than this are rejected.
    #[builder(default = DEFAULT_MAX_DOWNLOAD_BYTES)]
    pub max_download_bytes: u64,

    #[builder(default)]
    pub refresh_policy: RefreshPolicy,

    /// Whether `nearest` checks that a station's forecast package exists.
    #[builder(default = true)]
    pub reachability_probe: bool,
}

impl Default for DwdConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
