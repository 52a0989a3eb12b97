//! Timestamped JSON persistence shared by the station directory and forecast caches.
//!
//! Each key maps to `<dir>/<key>.json` holding `{"timestamp": <seconds since epoch>, "data": ...}`.
//! Writes go to a temporary file in the same directory which is then renamed over the target, so
//! readers see either the old or the new file, never a partial one.

use crate::cache::error::CacheError;
use crate::cache::keyed_locks::KeyedLocks;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::task;

const CACHE_FILE_EXTENSION: &str = "json";

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    timestamp: f64,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    timestamp: f64,
    data: T,
}

/// A decoded cache file together with the time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub written_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn is_stale(&self, max_age: Duration) -> bool {
        is_stale(self.written_at, max_age)
    }
}

/// Whether an entry written at `written_at` has outlived `max_age` as of now.
pub fn is_stale(written_at: DateTime<Utc>, max_age: Duration) -> bool {
    is_stale_at(written_at, max_age, Utc::now())
}

/// Pure form of [`is_stale`]: stale iff `now - written_at > max_age`.
///
/// Entries written "in the future" (clock adjustments) count as fresh.
pub fn is_stale_at(written_at: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) => now.signed_duration_since(written_at) > max_age,
        Err(_) => false,
    }
}

#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    write_locks: KeyedLocks,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: KeyedLocks::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the file backing `key`. Keys are limited to `[A-Za-z0-9_.-]` and may not
    /// start with a dot, so they always name a file directly inside the cache directory.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.{CACHE_FILE_EXTENSION}")))
    }

    /// Reads the entry for `key`.
    ///
    /// Missing files yield `None`. Unreadable or undecodable files also yield `None` after a
    /// warning; the caller is expected to refresh and overwrite them.
    pub async fn load<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let read_path = path.clone();
        match task::spawn_blocking(move || read_entry::<T>(&read_path)).await {
            Ok(Ok(Some(entry))) => {
                debug!("Cache hit for '{}' written at {}", key, entry.written_at);
                Some(entry)
            }
            Ok(Ok(None)) => {
                debug!("Cache miss for '{}' ({} does not exist)", key, path.display());
                None
            }
            Ok(Err(e)) => {
                warn!("Ignoring corrupt cache entry '{}': {}", key, e);
                None
            }
            Err(e) => {
                warn!("Reading cache entry '{}' did not complete: {}", key, e);
                None
            }
        }
    }

    /// Atomically replaces the entry for `key`. Concurrent saves to one key are serialised.
    pub async fn save<T>(
        &self,
        key: &str,
        payload: &T,
        written_at: DateTime<Utc>,
    ) -> Result<(), CacheError>
    where
        T: Serialize,
    {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec(&EnvelopeRef {
            timestamp: to_epoch_seconds(written_at),
            data: payload,
        })
        .map_err(|e| CacheError::Encode(key.to_string(), e))?;

        let _guard = self.write_locks.lock(key).await;
        let dir = self.dir.clone();
        let len = bytes.len();
        task::spawn_blocking(move || write_atomically(&dir, &path, &bytes)).await??;
        debug!("Wrote cache entry '{}' ({} bytes)", key, len);
        Ok(())
    }

    /// Deletes the entry for `key`. Returns whether a file was removed.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        let _guard = self.write_locks.lock(key).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Delete(path, e)),
        }
    }
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> Result<Option<CacheEntry<T>>, CacheError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::Read(path.to_path_buf(), e)),
    };
    let envelope: Envelope<T> = serde_json::from_slice(&bytes)
        .map_err(|e| CacheError::Decode(path.to_path_buf(), e))?;
    let written_at = from_epoch_seconds(envelope.timestamp)
        .ok_or_else(|| CacheError::InvalidTimestamp(path.to_path_buf(), envelope.timestamp))?;
    Ok(Some(CacheEntry {
        payload: envelope.data,
        written_at,
    }))
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    std::fs::create_dir_all(dir).map_err(|e| CacheError::CacheDirCreation(dir.to_path_buf(), e))?;
    let mut file =
        NamedTempFile::new_in(dir).map_err(|e| CacheError::Write(path.to_path_buf(), e))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| CacheError::Write(path.to_path_buf(), e))?;
    file.persist(path)
        .map_err(|e| CacheError::Persist(path.to_path_buf(), e))?;
    Ok(())
}

fn to_epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}
