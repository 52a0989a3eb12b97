use crate::download::DownloadError;
use crate::types::forecast::SeriesError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed forecast document at byte {position}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("Invalid forecast time step '{0}'")]
    Timestamp(String, #[source] chrono::ParseError),

    #[error("Forecast time steps are not strictly increasing")]
    NonIncreasingTimestamps(#[source] SeriesError),

    #[error("Placemark {index} has no station identifier")]
    MissingIdentifier { index: usize },

    #[error("Forecast for location '{location}' does not line up with the time steps")]
    Misaligned {
        location: String,
        #[source]
        source: SeriesError,
    },
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("Invalid station identifier '{0}'")]
    InvalidStationId(String),

    #[error(transparent)]
    Network(#[from] DownloadError),

    #[error("Forecast package from {url} is not a valid archive")]
    Archive {
        url: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Forecast package from {0} contains no files")]
    EmptyArchive(String),

    #[error("Failed to unpack forecast package from {0}")]
    ArchiveRead(String, #[source] std::io::Error),

    #[error("Forecast package from {url} unpacks to more than {limit} bytes")]
    ArchiveTooLarge { url: String, limit: u64 },

    #[error("Failed to parse forecast document")]
    Parse(#[from] ParseError),

    #[error("Internal: expected exactly one location in station forecast, found {found}")]
    UnexpectedLocationCount { found: usize },

    #[error("Forecast document contains no usable locations")]
    NoLocations,

    /// Returned to callers that waited on a refresh of the same key which then failed.
    #[error("Refresh of forecast '{key}' failed: {reason}")]
    RefreshFailed { key: String, reason: String },

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}
