//! Checks whether a station actually publishes forecasts.
//!
//! The directory and the forecast feed are maintained independently, so a station listed as
//! active may still have no forecast package.

use crate::download::Downloader;
use crate::forecast::fetcher::STATION_PLACEHOLDER;
use crate::types::station::Station;
use async_trait::async_trait;
use log::debug;

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, station: &Station) -> bool;
}

/// Sends a `HEAD` request to the station's forecast package URL.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    downloader: Downloader,
    url_template: String,
}

impl HttpProbe {
    /// `url_template` contains `{station}` where the station id goes.
    pub fn new(downloader: Downloader, url_template: impl Into<String>) -> Self {
        Self {
            downloader,
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self, station: &Station) -> bool {
        let url = self.url_template.replace(STATION_PLACEHOLDER, &station.id);
        match self.downloader.head(&url).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Station {} fails: {}", station.id, e);
                false
            }
        }
    }
}

/// Treats every station as reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

#[async_trait]
impl ReachabilityProbe for NoProbe {
    async fn is_reachable(&self, _station: &Station) -> bool {
        true
    }
}
