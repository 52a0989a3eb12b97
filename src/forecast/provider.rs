//! Cache-first access to forecasts: fresh entries are served from disk, refreshes for one key are
//! coalesced, and a failed refresh degrades to the last entry that was written.

use crate::cache::keyed_locks::{KeyedLocks, RefreshPolicy};
use crate::cache::store::{CacheEntry, CacheStore};
use crate::forecast::error::ForecastError;
use crate::forecast::fetcher::{ForecastSource, ForecastTarget};
use crate::forecast::parser::{parse_all_forecasts, parse_station_forecast};
use crate::types::forecast::{ForecastDocument, ForecastSnapshot, SnapshotOrigin};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task;

/// Outcome of the last failed refresh of a key, kept until a refresh of that key succeeds.
#[derive(Debug, Clone)]
struct FailedRefresh {
    at: DateTime<Utc>,
    reason: String,
}

pub struct ForecastProvider {
    source: Arc<dyn ForecastSource>,
    store: Arc<CacheStore>,
    refresh_locks: KeyedLocks,
    failures: Mutex<HashMap<String, FailedRefresh>>,
    max_age: Duration,
    policy: RefreshPolicy,
}

impl ForecastProvider {
    pub fn new(
        source: Arc<dyn ForecastSource>,
        store: Arc<CacheStore>,
        max_age: Duration,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            source,
            store,
            refresh_locks: KeyedLocks::new(),
            failures: Mutex::new(HashMap::new()),
            max_age,
            policy,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Returns the forecast for `target`, downloading it only when the cache cannot answer.
    pub async fn get_forecast(
        &self,
        target: &ForecastTarget,
        force_refresh: bool,
    ) -> Result<ForecastSnapshot, ForecastError> {
        target.validate()?;
        let key = target.cache_key();
        let requested_at = Utc::now();

        if !force_refresh {
            if let Some(entry) = self.load(&key).await {
                if !entry.is_stale(self.max_age) {
                    return Ok(snapshot(entry, SnapshotOrigin::Cache));
                }
                debug!("Cached forecast '{}' from {} is stale", key, entry.written_at);
            }
        }

        let _guard = match self.policy {
            RefreshPolicy::WaitForRefresh => self.refresh_locks.lock(&key).await,
            RefreshPolicy::ServeStale => match self.refresh_locks.try_lock(&key) {
                Some(guard) => guard,
                None => {
                    if let Some(entry) = self.load(&key).await {
                        debug!("Refresh of '{}' in flight, serving existing entry", key);
                        let origin = if entry.is_stale(self.max_age) {
                            SnapshotOrigin::StaleCache
                        } else {
                            SnapshotOrigin::Cache
                        };
                        return Ok(snapshot(entry, origin));
                    }
                    self.refresh_locks.lock(&key).await
                }
            },
        };

        // Whoever held the lock before us may already have refreshed this key.
        let cached = self.load(&key).await;
        if let Some(entry) = cached.as_ref() {
            let refreshed_meanwhile = entry.written_at >= requested_at;
            if refreshed_meanwhile || (!force_refresh && !entry.is_stale(self.max_age)) {
                debug!("Forecast '{}' was refreshed by a concurrent caller", key);
                return Ok(snapshot(entry.clone(), SnapshotOrigin::Cache));
            }
        }

        // A refresh that failed after this request began is our outcome too.
        if let Some(failure) = self.failed_since(&key, requested_at) {
            debug!("Concurrent refresh of '{}' failed, not retrying", key);
            return match cached {
                Some(entry) => Ok(snapshot(entry, SnapshotOrigin::StaleCache)),
                None => Err(ForecastError::RefreshFailed {
                    key,
                    reason: failure.reason,
                }),
            };
        }

        match self.refresh(target, &key).await {
            Ok(fresh) => {
                self.failures_mut().remove(&key);
                Ok(fresh)
            }
            Err(e) => {
                self.failures_mut().insert(
                    key.clone(),
                    FailedRefresh {
                        at: Utc::now(),
                        reason: e.to_string(),
                    },
                );
                match cached {
                    Some(entry) => {
                        warn!(
                            "Refreshing forecast '{}' failed, serving cache from {}: {}",
                            key, entry.written_at, e
                        );
                        Ok(snapshot(entry, SnapshotOrigin::StaleCache))
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn failed_since(&self, key: &str, since: DateTime<Utc>) -> Option<FailedRefresh> {
        self.failures_mut()
            .get(key)
            .filter(|failure| failure.at >= since)
            .cloned()
    }

    fn failures_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, FailedRefresh>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh(
        &self,
        target: &ForecastTarget,
        key: &str,
    ) -> Result<ForecastSnapshot, ForecastError> {
        info!("Downloading forecast '{}'", key);
        let bytes = self.source.fetch(target).await?;
        let single_station = matches!(target, ForecastTarget::Station(_));
        let document = task::spawn_blocking(move || {
            if single_station {
                parse_station_forecast(&bytes)
            } else {
                parse_all_forecasts(&bytes)
            }
        })
        .await??;

        let fetched_at = Utc::now();
        if let Err(e) = self.store.save(key, &document, fetched_at).await {
            warn!("Failed to cache forecast '{}': {}", key, e);
        }
        Ok(ForecastSnapshot::from_document(
            document,
            fetched_at,
            SnapshotOrigin::Downloaded,
        ))
    }

    async fn load(&self, key: &str) -> Option<CacheEntry<ForecastDocument>> {
        self.store.load::<ForecastDocument>(key).await
    }
}

fn snapshot(entry: CacheEntry<ForecastDocument>, origin: SnapshotOrigin) -> ForecastSnapshot {
    ForecastSnapshot::from_document(entry.payload, entry.written_at, origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadError;
    use crate::test_support::{kml_document, single_station_kml};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts fetches and answers with a fixed document, or fails when there is none.
    struct FakeSource {
        calls: AtomicUsize,
        delay: Duration,
        document: Mutex<Option<Vec<u8>>>,
    }

    impl FakeSource {
        fn new(document: Option<String>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                document: Mutex::new(document.map(String::into_bytes)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set(&self, document: Option<String>) {
            *self.document.lock().unwrap() = document.map(String::into_bytes);
        }
    }

    #[async_trait]
    impl ForecastSource for FakeSource {
        async fn fetch(&self, _target: &ForecastTarget) -> Result<Vec<u8>, ForecastError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let document = self.document.lock().unwrap().clone();
            document.ok_or_else(|| {
                ForecastError::Network(DownloadError::BodyRead(
                    "fake://forecast".into(),
                    std::io::Error::other("offline"),
                ))
            })
        }
    }

    fn station() -> ForecastTarget {
        ForecastTarget::Station("10865".into())
    }

    fn provider(
        source: Arc<FakeSource>,
        dir: &std::path::Path,
        policy: RefreshPolicy,
    ) -> ForecastProvider {
        ForecastProvider::new(
            source,
            Arc::new(CacheStore::new(dir)),
            Duration::from_secs(3600),
            policy,
        )
    }

    async fn seed_stale(dir: &std::path::Path, target: &ForecastTarget, kml: &str) {
        let document = parse_station_forecast(kml.as_bytes()).unwrap();
        let written_at = Utc::now() - chrono::Duration::hours(2);
        CacheStore::new(dir)
            .save(&target.cache_key(), &document, written_at)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn downloads_once_then_serves_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(Some(single_station_kml("10865")), Duration::ZERO);
        let p = provider(source.clone(), dir.path(), RefreshPolicy::default());

        let first = p.get_forecast(&station(), false).await.unwrap();
        assert_eq!(first.origin, SnapshotOrigin::Downloaded);
        assert_eq!(first.locations()[0].id, "10865");
        assert!(dir.path().join("station-forecast-10865.json").exists());

        let second = p.get_forecast(&station(), false).await.unwrap();
        assert_eq!(second.origin, SnapshotOrigin::Cache);
        assert_eq!(second.forecasts, first.forecasts);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(Some(single_station_kml("10865")), Duration::ZERO);
        let p = provider(source.clone(), dir.path(), RefreshPolicy::default());
        p.get_forecast(&station(), false).await.unwrap();
        let forced = p.get_forecast(&station(), true).await.unwrap();
        assert_eq!(forced.origin, SnapshotOrigin::Downloaded);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_cold_requests_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(
            Some(single_station_kml("10865")),
            Duration::from_millis(100),
        );
        let p = Arc::new(provider(source.clone(), dir.path(), RefreshPolicy::WaitForRefresh));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.get_forecast(&station(), false).await })
            })
            .collect();
        let mut downloaded = 0;
        for t in tasks {
            let snapshot = t.await.unwrap().unwrap();
            assert_eq!(snapshot.locations()[0].id, "10865");
            if snapshot.origin == SnapshotOrigin::Downloaded {
                downloaded += 1;
            }
        }
        assert_eq!(source.calls(), 1);
        assert_eq!(downloaded, 1);
    }

    #[tokio::test]
    async fn forced_waiters_reuse_concurrent_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(
            Some(single_station_kml("10865")),
            Duration::from_millis(100),
        );
        let p = Arc::new(provider(source.clone(), dir.path(), RefreshPolicy::WaitForRefresh));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.get_forecast(&station(), true).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        seed_stale(dir.path(), &station(), &single_station_kml("10865")).await;
        let source = FakeSource::new(None, Duration::ZERO);
        let p = provider(source.clone(), dir.path(), RefreshPolicy::default());

        let snapshot = p.get_forecast(&station(), false).await.unwrap();
        assert_eq!(snapshot.origin, SnapshotOrigin::StaleCache);
        assert_eq!(
            snapshot.locations()[0].series.variable("TTT").unwrap()[0],
            Some(273.45)
        );
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_without_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(FakeSource::new(None, Duration::ZERO), dir.path(), RefreshPolicy::default());
        let err = p.get_forecast(&station(), false).await.unwrap_err();
        assert!(matches!(err, ForecastError::Network(_)));
    }

    #[tokio::test]
    async fn empty_all_stations_document_keeps_previous_cache() {
        let dir = tempfile::tempdir().unwrap();
        let all = ForecastTarget::AllStations;
        seed_stale(dir.path(), &all, &single_station_kml("10865")).await;
        let before = std::fs::read(dir.path().join("station-forecast-all.json")).unwrap();

        let empty = kml_document(&["2024-01-15T04:00:00Z"], &[]);
        let source = FakeSource::new(Some(empty), Duration::ZERO);
        let p = provider(source, dir.path(), RefreshPolicy::default());
        let snapshot = p.get_forecast(&all, false).await.unwrap();

        assert_eq!(snapshot.origin, SnapshotOrigin::StaleCache);
        assert_eq!(
            std::fs::read(dir.path().join("station-forecast-all.json")).unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn waiters_share_a_failed_cold_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(None, Duration::from_millis(200));
        let p = Arc::new(provider(source.clone(), dir.path(), RefreshPolicy::WaitForRefresh));

        let started = std::time::Instant::now();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.get_forecast(&station(), false).await })
            })
            .collect();
        let mut shared = 0;
        for t in tasks {
            match t.await.unwrap().unwrap_err() {
                ForecastError::Network(_) => {}
                ForecastError::RefreshFailed { key, reason } => {
                    assert_eq!(key, "station-forecast-10865");
                    assert!(!reason.is_empty());
                    shared += 1;
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(source.calls(), 1);
        assert_eq!(shared, 7);
        assert!(started.elapsed() < Duration::from_millis(1000));

        // A request made after the failure tries again.
        p.get_forecast(&station(), false).await.unwrap_err();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn waiters_share_a_failed_stale_refresh() {
        let dir = tempfile::tempdir().unwrap();
        seed_stale(dir.path(), &station(), &single_station_kml("10865")).await;
        let source = FakeSource::new(None, Duration::from_millis(200));
        let p = Arc::new(provider(source.clone(), dir.path(), RefreshPolicy::WaitForRefresh));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.get_forecast(&station(), false).await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap().origin, SnapshotOrigin::StaleCache);
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn corrupt_cache_triggers_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("station-forecast-10865.json"), b"{not json").unwrap();
        let source = FakeSource::new(Some(single_station_kml("10865")), Duration::ZERO);
        let p = provider(source.clone(), dir.path(), RefreshPolicy::default());
        let snapshot = p.get_forecast(&station(), false).await.unwrap();
        assert_eq!(snapshot.origin, SnapshotOrigin::Downloaded);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn serve_stale_returns_immediately_during_refresh() {
        let dir = tempfile::tempdir().unwrap();
        seed_stale(dir.path(), &station(), &single_station_kml("10865")).await;
        let source = FakeSource::new(
            Some(single_station_kml("10865")),
            Duration::from_millis(500),
        );
        let p = Arc::new(provider(source.clone(), dir.path(), RefreshPolicy::ServeStale));

        let refresher = {
            let p = p.clone();
            tokio::spawn(async move { p.get_forecast(&station(), false).await })
        };
        while source.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let quick = tokio::time::timeout(
            Duration::from_millis(200),
            p.get_forecast(&station(), false),
        )
        .await
        .expect("served without waiting")
        .unwrap();
        assert_eq!(quick.origin, SnapshotOrigin::StaleCache);

        let refreshed = refresher.await.unwrap().unwrap();
        assert_eq!(refreshed.origin, SnapshotOrigin::Downloaded);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn recovered_source_replaces_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        seed_stale(dir.path(), &station(), &single_station_kml("10865")).await;
        let source = FakeSource::new(None, Duration::ZERO);
        let p = provider(source.clone(), dir.path(), RefreshPolicy::default());
        assert_eq!(
            p.get_forecast(&station(), false).await.unwrap().origin,
            SnapshotOrigin::StaleCache
        );
        source.set(Some(single_station_kml("10865")));
        assert_eq!(
            p.get_forecast(&station(), false).await.unwrap().origin,
            SnapshotOrigin::Downloaded
        );
        assert_eq!(
            p.get_forecast(&station(), false).await.unwrap().origin,
            SnapshotOrigin::Cache
        );
    }

    #[tokio::test]
    async fn invalid_station_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(None, Duration::ZERO);
        let p = provider(source.clone(), dir.path(), RefreshPolicy::default());
        let err = p
            .get_forecast(&ForecastTarget::Station("../etc".into()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidStationId(_)));
        assert_eq!(source.calls(), 0);
    }
}
