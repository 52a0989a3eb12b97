use crate::cache::error::CacheError;
use crate::download::DownloadError;
use crate::forecast::error::ForecastError;
use crate::stations::error::StationError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DwdError {
    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error(transparent)]
    Station(#[from] StationError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to build data frame")]
    Frame(#[from] polars::prelude::PolarsError),

    #[error("Failed to build HTTP client")]
    HttpClient(#[source] DownloadError),

    #[error("Failed to create cache directory '{0}'")]
    CacheDirCreation(PathBuf, #[source] std::io::Error),

    #[error("Failed to list cache directory '{0}'")]
    CacheDirRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to determine cache directory")]
    CacheDirResolution(#[source] std::io::Error),
}
