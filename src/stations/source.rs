use crate::download::Downloader;
use crate::stations::error::StationError;
use async_trait::async_trait;

/// Delivers the raw station directory page.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn fetch_directory(&self) -> Result<String, StationError>;
}

/// Fetches the station lexicon page from the DWD website.
#[derive(Debug, Clone)]
pub struct HttpDirectorySource {
    downloader: Downloader,
    url: String,
}

impl HttpDirectorySource {
    pub fn new(downloader: Downloader, url: impl Into<String>) -> Self {
        Self {
            downloader,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DirectorySource for HttpDirectorySource {
    async fn fetch_directory(&self) -> Result<String, StationError> {
        let body = self.downloader.get(&self.url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadError;
    use crate::test_support::{serve, Reply};
    use std::time::Duration;

    fn source(url: String) -> HttpDirectorySource {
        HttpDirectorySource::new(Downloader::new(Duration::from_secs(5), 1 << 20).unwrap(), url)
    }

    #[tokio::test]
    async fn returns_page_text() {
        let server = serve(vec![Reply::ok("<table>Länge</table>")]).await;
        let page = source(server.url("/statlex")).fetch_directory().await.unwrap();
        assert_eq!(page, "<table>Länge</table>");
    }

    #[tokio::test]
    async fn server_error_is_network_error() {
        let server = serve(vec![Reply::status(503)]).await;
        let err = source(server.url("/statlex"))
            .fetch_directory()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StationError::Network(DownloadError::HttpStatus { .. })
        ));
    }
}
