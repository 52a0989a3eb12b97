use crate::cache::store::{is_stale, CacheEntry, CacheStore};
use crate::stations::error::StationError;
use crate::stations::html::parse_directory;
use crate::stations::probe::ReachabilityProbe;
use crate::stations::source::DirectorySource;
use crate::types::forecast::SnapshotOrigin;
use crate::types::station::{DirectorySnapshot, Station};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task;

/// Cache key of the persisted directory.
pub const DIRECTORY_CACHE_KEY: &str = "station-list";

/// Default number of nearest stations probed before giving up.
pub const DEFAULT_MAX_CANDIDATES: usize = 100;

/// Stations whose coverage ended this many days ago or earlier are considered decommissioned.
const CURRENT_WINDOW_DAYS: i64 = 7;

/// How long unforced lookups keep using a stale snapshot after a failed download.
pub const FAILED_REFRESH_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct FailedRefresh {
    at: DateTime<Utc>,
    reason: String,
}

/// The master list of stations, cached in memory and on disk.
pub struct StationDirectory {
    source: Arc<dyn DirectorySource>,
    probe: Arc<dyn ReachabilityProbe>,
    store: Arc<CacheStore>,
    max_age: Duration,
    current: RwLock<Option<Arc<DirectorySnapshot>>>,
    refresh_gate: Mutex<()>,
    last_failure: SyncMutex<Option<FailedRefresh>>,
}

impl StationDirectory {
    pub fn new(
        source: Arc<dyn DirectorySource>,
        probe: Arc<dyn ReachabilityProbe>,
        store: Arc<CacheStore>,
        max_age: Duration,
    ) -> Self {
        Self {
            source,
            probe,
            store,
            max_age,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            last_failure: SyncMutex::new(None),
        }
    }

    /// Returns the current snapshot, downloading a new directory if needed.
    ///
    /// Without `force`, a snapshot younger than the maximum age (in memory or on disk) is
    /// returned as-is. When downloading or parsing fails, the newest known snapshot is served
    /// with [`SnapshotOrigin::StaleCache`]; only when there is none does the error surface.
    /// After a failure, unforced calls keep using that snapshot for [`FAILED_REFRESH_BACKOFF`]
    /// before the network is tried again.
    pub async fn refresh(&self, force: bool) -> Result<Arc<DirectorySnapshot>, StationError> {
        let requested_at = Utc::now();
        if !force {
            if let Some(snapshot) = self.current() {
                if self.is_fresh(snapshot.fetched_at) {
                    return Ok(snapshot);
                }
                if self.backing_off() {
                    debug!(
                        "Station directory refresh failed recently, using copy from {}",
                        snapshot.fetched_at
                    );
                    return Ok(snapshot);
                }
            }
        }

        let _gate = self.refresh_gate.lock().await;

        let satisfies = |fetched_at: DateTime<Utc>| {
            fetched_at >= requested_at || (!force && self.is_fresh(fetched_at))
        };
        if let Some(snapshot) = self.current().filter(|s| satisfies(s.fetched_at)) {
            return Ok(snapshot);
        }
        let cached: Option<CacheEntry<Vec<Station>>> = self.store.load(DIRECTORY_CACHE_KEY).await;
        if let Some(entry) = cached.as_ref().filter(|e| satisfies(e.written_at)) {
            return Ok(self.install(
                entry.payload.clone(),
                entry.written_at,
                SnapshotOrigin::Cache,
            ));
        }

        // Whoever held the gate before us already failed to download; share that outcome.
        if let Some(failure) = self.failed_since(requested_at) {
            return match self.fallback(cached) {
                Some(snapshot) => Ok(snapshot),
                None => Err(StationError::RefreshFailed(failure.reason)),
            };
        }

        match self.download().await {
            Ok(stations) => {
                self.set_failure(None);
                let fetched_at = Utc::now();
                if let Err(e) = self.store.save(DIRECTORY_CACHE_KEY, &stations, fetched_at).await {
                    warn!("Failed to cache station directory: {}", e);
                }
                info!("Loaded {} stations from the DWD directory", stations.len());
                Ok(self.install(stations, fetched_at, SnapshotOrigin::Downloaded))
            }
            Err(e) => {
                self.set_failure(Some(FailedRefresh {
                    at: Utc::now(),
                    reason: e.to_string(),
                }));
                match self.fallback(cached) {
                    Some(snapshot) => {
                        warn!(
                            "Refreshing station directory failed, using copy from {}: {}",
                            snapshot.fetched_at, e
                        );
                        Ok(snapshot)
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// The station whose name contains `text` (case-sensitive) and whose coverage ends last.
    /// Ties go to the station listed first.
    pub async fn search_by_name(&self, text: &str) -> Result<Station, StationError> {
        let snapshot = self.refresh(false).await?;
        let mut best: Option<&Station> = None;
        for station in snapshot.stations.iter().filter(|s| s.name.contains(text)) {
            if best.map_or(true, |b| station.coverage.end > b.coverage.end) {
                best = Some(station);
            }
        }
        best.cloned()
            .ok_or_else(|| StationError::NotFound(text.to_string()))
    }

    /// Stations still reporting data, ordered by distance (km) from the given point. Stations at
    /// equal distance keep directory order.
    pub async fn stations_by_distance(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<(Station, f64)>, StationError> {
        validate_coordinates(latitude, longitude)?;
        let snapshot = self.refresh(false).await?;
        Ok(rank_by_distance(
            &snapshot.stations,
            latitude,
            longitude,
            Utc::now().date_naive(),
        ))
    }

    /// The closest current station, optionally the closest one whose forecast can be fetched.
    pub async fn nearest(
        &self,
        latitude: f64,
        longitude: f64,
        max_candidates: usize,
        reachability_probe: bool,
    ) -> Result<(Station, f64), StationError> {
        let candidates = self.stations_by_distance(latitude, longitude).await?;
        if candidates.is_empty() {
            return Err(StationError::NotFound(format!("{latitude}, {longitude}")));
        }
        if !reachability_probe {
            return candidates
                .into_iter()
                .next()
                .ok_or_else(|| StationError::NotFound(format!("{latitude}, {longitude}")));
        }

        let checked = candidates.len().min(max_candidates);
        for (station, distance) in candidates.into_iter().take(max_candidates) {
            if self.probe.is_reachable(&station).await {
                debug!("Nearest reachable station is {} ({:.1} km)", station.id, distance);
                return Ok((station, distance));
            }
            debug!("Station {} ({:.1} km) has no forecast, trying next", station.id, distance);
        }
        Err(StationError::NoReachableStation { checked })
    }

    /// The snapshot held in memory, if any.
    pub fn current(&self) -> Option<Arc<DirectorySnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drops the in-memory snapshot so the next call goes back to disk or network.
    pub fn forget(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The newer of the in-memory snapshot and the disk entry, installed as stale.
    fn fallback(
        &self,
        cached: Option<CacheEntry<Vec<Station>>>,
    ) -> Option<Arc<DirectorySnapshot>> {
        let current = self.current();
        let (stations, fetched_at) = match (current, cached) {
            (Some(current), Some(entry)) if entry.written_at > current.fetched_at => {
                (Arc::new(entry.payload), entry.written_at)
            }
            (Some(current), _) => (current.stations.clone(), current.fetched_at),
            (None, Some(entry)) => (Arc::new(entry.payload), entry.written_at),
            (None, None) => return None,
        };
        let snapshot = Arc::new(DirectorySnapshot {
            fetched_at,
            origin: SnapshotOrigin::StaleCache,
            stations,
        });
        self.set_current(snapshot.clone());
        Some(snapshot)
    }

    fn backing_off(&self) -> bool {
        self.last_failure()
            .is_some_and(|failure| !is_stale(failure.at, FAILED_REFRESH_BACKOFF))
    }

    fn failed_since(&self, since: DateTime<Utc>) -> Option<FailedRefresh> {
        self.last_failure().filter(|failure| failure.at >= since)
    }

    fn last_failure(&self) -> Option<FailedRefresh> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_failure(&self, failure: Option<FailedRefresh>) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        !is_stale(fetched_at, self.max_age)
    }

    fn install(
        &self,
        stations: Vec<Station>,
        fetched_at: DateTime<Utc>,
        origin: SnapshotOrigin,
    ) -> Arc<DirectorySnapshot> {
        let snapshot = Arc::new(DirectorySnapshot {
            fetched_at,
            origin,
            stations: Arc::new(stations),
        });
        self.set_current(snapshot.clone());
        snapshot
    }

    fn set_current(&self, snapshot: Arc<DirectorySnapshot>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    async fn download(&self) -> Result<Vec<Station>, StationError> {
        let page = self.source.fetch_directory().await?;
        let stations = task::spawn_blocking(move || parse_directory(&page)).await??;
        Ok(stations)
    }
}

fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), StationError> {
    if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
        Ok(())
    } else {
        Err(StationError::InvalidCoordinates {
            latitude,
            longitude,
        })
    }
}

fn rank_by_distance(
    stations: &[Station],
    latitude: f64,
    longitude: f64,
    today: NaiveDate,
) -> Vec<(Station, f64)> {
    let mut ranked: Vec<(Station, f64)> = stations
        .iter()
        .filter(|s| s.is_current(today, CURRENT_WINDOW_DAYS))
        .map(|s| (s.clone(), s.distance_km(latitude, longitude)))
        .collect();
    // Stable sort keeps directory order for equal distances.
    ranked.sort_by_key(|(_, distance)| OrderedFloat(*distance));
    ranked
}
