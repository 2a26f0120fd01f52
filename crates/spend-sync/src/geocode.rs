//! Supplier geocoding: a `Geocoder` backend, a persistent cache that also
//! remembers misses, and a service that serializes lookups under a rate limit.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use spend_core::Coordinates;
use spend_storage::{url_with_params, FetchError, HttpFetcher, RequestPacer};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const NOMINATIM_SEARCH: &str = "https://nominatim.openstreetmap.org/search";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid geocoder response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("geocoder returned a non-numeric coordinate: {0}")]
    Coordinate(String),
    #[error("geocode cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the query resolved to nothing.
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// OpenStreetMap Nominatim search (`format=json&limit=1`).
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
    run_id: Uuid,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<HttpFetcher>, run_id: Uuid) -> Self {
        Self {
            http,
            base_url: NOMINATIM_SEARCH.to_string(),
            run_id,
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = url_with_params(
            &self.base_url,
            &[
                ("q", query.to_string()),
                ("format", "json".to_string()),
                ("limit", "1".to_string()),
            ],
        )?;
        let response = self.http.fetch_bytes(self.run_id, "nominatim", &url).await?;
        let places: Vec<NominatimPlace> = serde_json::from_slice(&response.body)?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat = place
            .lat
            .parse()
            .map_err(|_| GeocodeError::Coordinate(place.lat.clone()))?;
        let lon = place
            .lon
            .parse()
            .map_err(|_| GeocodeError::Coordinate(place.lon.clone()))?;
        Ok(Some(Coordinates { lat, lon }))
    }
}

pub type CacheEntries = HashMap<String, Option<Coordinates>>;

/// Where the geocode cache lives between runs.
#[async_trait]
pub trait CachePersistence: Send + Sync {
    async fn load(&self) -> Result<CacheEntries, GeocodeError>;
    async fn save(&self, entries: &CacheEntries) -> Result<(), GeocodeError>;
}

/// In-process only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

#[async_trait]
impl CachePersistence for NoPersistence {
    async fn load(&self) -> Result<CacheEntries, GeocodeError> {
        Ok(CacheEntries::new())
    }

    async fn save(&self, _entries: &CacheEntries) -> Result<(), GeocodeError> {
        Ok(())
    }
}

/// A JSON object mapping supplier key to coordinates or `null` for a miss.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> GeocodeError {
        GeocodeError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CachePersistence for JsonFilePersistence {
    async fn load(&self) -> Result<CacheEntries, GeocodeError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CacheEntries::new()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    async fn save(&self, entries: &CacheEntries) -> Result<(), GeocodeError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(entries)?)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

/// Cache key for a supplier: trimmed, lowercased, single-spaced.
pub fn cache_key(supplier: &str) -> String {
    supplier
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct GeocodeCache {
    entries: CacheEntries,
    /// Keys whose lookup errored or timed out. Kept for this process only,
    /// so the next run tries them again.
    failed: HashSet<String>,
    persistence: Box<dyn CachePersistence>,
    dirty: bool,
}

impl GeocodeCache {
    /// Load from `persistence`. An unreadable cache starts empty.
    pub async fn open(persistence: Box<dyn CachePersistence>) -> Self {
        let entries = match persistence.load().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "geocode cache unreadable; starting empty");
                CacheEntries::new()
            }
        };
        Self {
            entries,
            failed: HashSet::new(),
            persistence,
            dirty: false,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            entries: CacheEntries::new(),
            failed: HashSet::new(),
            persistence: Box::new(NoPersistence),
            dirty: false,
        }
    }

    /// `Some(None)` is a cached miss or an earlier failed lookup.
    pub fn get(&self, key: &str) -> Option<Option<Coordinates>> {
        match self.entries.get(key) {
            Some(found) => Some(*found),
            None if self.failed.contains(key) => Some(None),
            None => None,
        }
    }

    pub fn mark_failed(&mut self, key: String) {
        self.failed.insert(key);
    }

    pub fn insert(&mut self, key: String, value: Option<Coordinates>) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn flush(&mut self) -> Result<(), GeocodeError> {
        if !self.dirty {
            return Ok(());
        }
        self.persistence.save(&self.entries).await?;
        self.dirty = false;
        Ok(())
    }
}

/// Serialized, rate-limited, cached geocoding. Failures yield `None`.
pub struct GeocodeService {
    geocoder: Arc<dyn Geocoder>,
    cache: Mutex<GeocodeCache>,
    pacer: RequestPacer,
    timeout: Duration,
}

impl GeocodeService {
    pub fn new(geocoder: Arc<dyn Geocoder>, cache: GeocodeCache, interval: Duration, timeout: Duration) -> Self {
        Self {
            geocoder,
            cache: Mutex::new(cache),
            pacer: RequestPacer::new(interval),
            timeout,
        }
    }

    pub async fn coordinates_for(&self, supplier: &str) -> Option<Coordinates> {
        let key = cache_key(supplier);
        if key.is_empty() {
            return None;
        }

        // Held across the lookup so requests go out one at a time.
        let mut cache = self.cache.lock().await;
        if let Some(hit) = cache.get(&key) {
            return hit;
        }

        self.pacer.wait().await;
        match tokio::time::timeout(self.timeout, self.geocoder.geocode(supplier.trim())).await {
            Ok(Ok(found)) => {
                debug!(supplier, hit = found.is_some(), "geocoded");
                cache.insert(key, found);
                found
            }
            Ok(Err(err)) => {
                warn!(supplier, error = %err, "geocode failed");
                cache.mark_failed(key);
                None
            }
            Err(_) => {
                warn!(supplier, timeout_secs = self.timeout.as_secs(), "geocode timed out");
                cache.mark_failed(key);
                None
            }
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn flush(&self) -> Result<(), GeocodeError> {
        self.cache.lock().await.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGeocoder {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if query.contains("Nowhere") {
                Ok(None)
            } else {
                Ok(Some(Coordinates { lat: 51.5, lon: -0.12 }))
            }
        }
    }

    fn service(geocoder: Arc<CountingGeocoder>, cache: GeocodeCache, timeout: Duration) -> GeocodeService {
        GeocodeService::new(geocoder, cache, Duration::from_millis(1), timeout)
    }

    #[tokio::test]
    async fn hits_and_misses_are_cached() {
        let geocoder = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let svc = service(geocoder.clone(), GeocodeCache::in_memory(), Duration::from_secs(5));

        assert!(svc.coordinates_for("Acme Ltd").await.is_some());
        assert!(svc.coordinates_for("  acme   LTD ").await.is_some());
        assert!(svc.coordinates_for("Nowhere Supplies").await.is_none());
        assert!(svc.coordinates_for("Nowhere Supplies").await.is_none());
        assert!(svc.coordinates_for("   ").await.is_none());

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(svc.cached_entries().await, 2);
    }

    #[tokio::test]
    async fn timeouts_are_attempted_once_and_not_persisted() {
        let geocoder = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let svc = service(geocoder.clone(), GeocodeCache::in_memory(), Duration::from_millis(10));
        assert!(svc.coordinates_for("Slow Ltd").await.is_none());
        assert!(svc.coordinates_for("slow  ltd").await.is_none());
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.cached_entries().await, 0);
    }

    struct FailingGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for FailingGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GeocodeError::Coordinate("bad lat".into()))
        }
    }

    #[tokio::test]
    async fn failed_supplier_is_looked_up_once_per_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let geocoder = Arc::new(FailingGeocoder {
            calls: AtomicUsize::new(0),
        });
        let cache = GeocodeCache::open(Box::new(JsonFilePersistence::new(&path))).await;
        let svc = GeocodeService::new(geocoder.clone(), cache, Duration::from_millis(1), Duration::from_secs(1));

        for _ in 0..5 {
            assert!(svc.coordinates_for("Acme Ltd").await.is_none());
        }
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        svc.flush().await.unwrap();

        let reopened = GeocodeCache::open(Box::new(JsonFilePersistence::new(&path))).await;
        assert_eq!(reopened.get("acme ltd"), None);
    }

    #[tokio::test]
    async fn json_file_cache_persists_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo/cache.json");

        let mut cache = GeocodeCache::open(Box::new(JsonFilePersistence::new(&path))).await;
        assert!(cache.is_empty());
        cache.insert("acme".into(), Some(Coordinates { lat: 1.0, lon: 2.0 }));
        cache.insert("nowhere".into(), None);
        cache.flush().await.unwrap();

        let reopened = GeocodeCache::open(Box::new(JsonFilePersistence::new(&path))).await;
        assert_eq!(reopened.get("acme"), Some(Some(Coordinates { lat: 1.0, lon: 2.0 })));
        assert_eq!(reopened.get("nowhere"), Some(None));
        assert_eq!(reopened.get("unknown"), None);
    }

    #[tokio::test]
    async fn corrupt_cache_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, b"[1, 2").await.unwrap();
        let cache = GeocodeCache::open(Box::new(JsonFilePersistence::new(&path))).await;
        assert!(cache.is_empty());
    }
}
