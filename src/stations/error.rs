use crate::download::DownloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StationError {
    #[error(transparent)]
    Network(#[from] DownloadError),

    #[error("Station directory page could not be parsed: {0}")]
    Html(String),

    #[error("Station directory page contains no usable stations")]
    EmptyDirectory,

    /// Returned to callers that waited on a directory refresh which then failed.
    #[error("Refresh of the station directory failed: {0}")]
    RefreshFailed(String),

    #[error("No station matches '{0}'")]
    NotFound(String),

    #[error("None of the {checked} closest stations has a reachable forecast")]
    NoReachableStation { checked: usize },

    #[error("Invalid coordinates: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    // Covers errors joining tokio blocking tasks
    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}
