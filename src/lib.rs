mod cache;
mod config;
mod download;
mod dwd;
mod error;
mod forecast;
mod stations;
mod types;
mod utils;

#[cfg(test)]
mod test_support;

pub use config::*;
pub use dwd::*;
pub use error::DwdError;

pub use cache::error::CacheError;
pub use cache::keyed_locks::{KeyedLocks, RefreshPolicy};
pub use cache::store::{is_stale, is_stale_at, CacheEntry, CacheStore};

pub use download::{DownloadError, Downloader};

pub use forecast::error::{ForecastError, ParseError};
pub use forecast::fetcher::{ForecastFetcher, ForecastSource, ForecastTarget};
pub use forecast::parser::{
    parse_all_forecasts, parse_document, parse_station_forecast, ParsedDocument,
};
pub use forecast::provider::ForecastProvider;

pub use stations::directory::{
    StationDirectory, DEFAULT_MAX_CANDIDATES, DIRECTORY_CACHE_KEY, FAILED_REFRESH_BACKOFF,
};
pub use stations::error::StationError;
pub use stations::html::parse_directory;
pub use stations::probe::{HttpProbe, NoProbe, ReachabilityProbe};
pub use stations::source::{DirectorySource, HttpDirectorySource};

pub use types::forecast::*;
pub use types::station::*;
