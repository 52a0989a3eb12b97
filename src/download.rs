//! Thin HTTP layer shared by the directory and forecast sources.
//!
//! Every request goes through a [`reqwest::Client`] built with a total timeout, and response
//! bodies are streamed into memory with an upper bound so a misbehaving server cannot exhaust it.

use futures_util::TryStreamExt;
use log::{debug, warn};
use reqwest::Client;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to build HTTP client")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Network request failed for {0}")]
    NetworkRequest(String, #[source] reqwest::Error),

    #[error("HTTP request failed for {url} with status {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to read response body from {0}")]
    BodyRead(String, #[source] io::Error),

    #[error("Response from {url} exceeds the download limit of {limit} bytes")]
    TooLarge { url: String, limit: u64 },
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    max_bytes: u64,
}

impl Downloader {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self { client, max_bytes })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Downloads `url` completely, failing on transport errors, non-success statuses and bodies
    /// larger than the configured limit.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        debug!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::NetworkRequest(url.to_string(), e))?;
        let response = check_status(url, response)?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(DownloadError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(stream).take(self.max_bytes + 1);
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|e| DownloadError::BodyRead(url.to_string(), e))?;
        if body.len() as u64 > self.max_bytes {
            return Err(DownloadError::TooLarge {
                url: url.to_string(),
                limit: self.max_bytes,
            });
        }
        debug!("Downloaded {} bytes from {}", body.len(), url);
        Ok(body)
    }

    /// Lightweight existence check: a `HEAD` request that succeeds only on a 2xx status.
    pub async fn head(&self, url: &str) -> Result<(), DownloadError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DownloadError::NetworkRequest(url.to_string(), e))?;
        check_status(url, response).map(|_| ())
    }
}

fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, DownloadError> {
    match response.error_for_status() {
        Ok(resp) => Ok(resp),
        Err(e) => {
            warn!("HTTP error for {}: {:?}", url, e);
            Err(if let Some(status) = e.status() {
                DownloadError::HttpStatus {
                    url: url.to_string(),
                    status,
                    source: e,
                }
            } else {
                DownloadError::NetworkRequest(url.to_string(), e)
            })
        }
    }
}
