//! Durable per-search tracking of already-alerted listings.
//!
//! One partition per saved search. The store is reloaded from its backend at
//! the start of every run and flushed at the end; the process is not expected
//! to stay resident between runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lettingwatch_core::{CandidateListing, ListingKey, TrackedListing};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The tracking state exists but could not be read or decoded. A run must
    /// abort on this rather than treat every candidate as unseen.
    #[error("tracking state unreadable: {0}")]
    Load(String),
    /// The tracking state could not be durably written.
    #[error("tracking state not durably written: {0}")]
    Flush(String),
}

/// Persistence seam for one search partition: in-memory for tests, a JSON
/// file in production.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    async fn load(&self) -> Result<Vec<TrackedListing>, StoreError>;
    async fn flush(&self, records: &[TrackedListing]) -> Result<(), StoreError>;
}

/// Filesystem-safe partition name derived from a search's display name.
pub fn partition_slug(search_name: &str) -> String {
    search_name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// One JSON file per partition under an explicit state directory.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn for_search(state_dir: impl AsRef<Path>, search_name: &str) -> Self {
        let path = state_dir
            .as_ref()
            .join(format!("{}.json", partition_slug(search_name)));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrackingBackend for JsonFileBackend {
    async fn load(&self) -> Result<Vec<TrackedListing>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            // A missing partition is a first run, not a failure.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no tracking state yet, starting empty");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(StoreError::Load(format!(
                    "reading {}: {err}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Load(format!("parsing {}: {err}", self.path.display())))
    }

    async fn flush(&self, records: &[TrackedListing]) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| StoreError::Flush(format!("{} has no parent", self.path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::Flush(format!("creating {}: {err}", parent.display())))?;

        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|err| StoreError::Flush(format!("encoding tracked listings: {err}")))?;

        // Temp file + rename so a crash mid-write never leaves a truncated
        // partition behind.
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(|err| format!("opening {}: {err}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .map_err(|err| format!("writing {}: {err}", temp_path.display()))?;
            file.flush()
                .await
                .map_err(|err| format!("flushing {}: {err}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &self.path)
                .await
                .map_err(|err| format!("renaming into {}: {err}", self.path.display()))
        }
        .await;

        if let Err(reason) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Flush(reason));
        }
        Ok(())
    }
}

/// Shared in-memory backend for tests. Clones observe the same records, so a
/// test can re-open the partition after a run and inspect what was flushed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<Vec<TrackedListing>>>,
    fail_flush: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<TrackedListing> {
        self.records.lock().expect("memory backend lock").clone()
    }
}

#[async_trait]
impl TrackingBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<TrackedListing>, StoreError> {
        Ok(self.snapshot())
    }

    async fn flush(&self, records: &[TrackedListing]) -> Result<(), StoreError> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(StoreError::Flush("memory backend forced failure".into()));
        }
        *self.records.lock().expect("memory backend lock") = records.to_vec();
        Ok(())
    }
}

/// Loaded tracking state for one search partition.
///
/// `record_sent` takes exactly the listings that made it into a dispatched
/// alert; a candidate that was new but lost the ranking cutoff stays
/// unrecorded and eligible for the next run.
pub struct TrackingStore {
    backend: Box<dyn TrackingBackend>,
    records: Vec<TrackedListing>,
    seen: HashSet<ListingKey>,
}

impl TrackingStore {
    /// Load eagerly so an unreadable partition fails the run before any
    /// network traffic happens.
    pub async fn open(backend: Box<dyn TrackingBackend>) -> Result<Self, StoreError> {
        let records = backend.load().await?;
        let seen = records.iter().map(|r| r.key).collect();
        Ok(Self {
            backend,
            records,
            seen,
        })
    }

    pub fn filter_unseen(&self, candidates: Vec<CandidateListing>) -> Vec<CandidateListing> {
        candidates
            .into_iter()
            .filter(|c| !self.seen.contains(&c.key()))
            .collect()
    }

    pub fn record_sent(&mut self, listings: &[TrackedListing]) {
        for listing in listings {
            if self.seen.insert(listing.key) {
                self.records.push(listing.clone());
            }
        }
    }

    /// Evict oldest entries beyond `max_entries`, keeping the most recent by
    /// first-seen insertion order.
    pub fn prune(&mut self, max_entries: usize) {
        if self.records.len() <= max_entries {
            return;
        }
        let excess = self.records.len() - max_entries;
        for removed in self.records.drain(..excess) {
            self.seen.remove(&removed.key);
        }
        debug!(evicted = excess, retained = self.records.len(), "pruned tracking history");
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush(&self.records).await
    }

    pub fn contains(&self, key: ListingKey) -> bool {
        self.seen.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn tracked(id: i64, address: &str) -> TrackedListing {
        TrackedListing {
            key: ListingKey::derive(id, address),
            address: address.to_string(),
            price_display: "£1,400 pcm".to_string(),
            bedrooms: 2,
            bathrooms: Some(1),
            url: format!("https://portal.example/properties/{id}"),
            first_seen: Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).single().unwrap(),
        }
    }

    fn candidate(id: i64, address: &str) -> CandidateListing {
        CandidateListing {
            portal_id: id,
            address: address.to_string(),
            price_display: "£1,400 pcm".to_string(),
            bedrooms: 2,
            bathrooms: Some(1),
            image_count: 4,
            first_visible: None,
            listing_path: format!("/properties/{id}"),
        }
    }

    #[test]
    fn partition_slug_is_deterministic_and_safe() {
        assert_eq!(partition_slug("Two-bed flats, Hackney (E8)"), "two-bed-flats-hackney-e8");
        assert_eq!(partition_slug("  Hackney  "), "hackney");
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_store() {
        let dir = tempdir().expect("tempdir");
        let backend = JsonFileBackend::for_search(dir.path(), "Hackney rentals");
        let store = TrackingStore::open(Box::new(backend)).await.expect("open");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_fails_load_instead_of_resetting() {
        let dir = tempdir().expect("tempdir");
        let backend = JsonFileBackend::for_search(dir.path(), "Hackney rentals");
        std::fs::write(backend.path(), b"not json at all").expect("seed corrupt file");

        let result = TrackingStore::open(Box::new(backend)).await;
        assert!(matches!(result, Err(StoreError::Load(_))));
    }

    #[tokio::test]
    async fn flush_and_reload_round_trips_records() {
        let dir = tempdir().expect("tempdir");
        let backend = JsonFileBackend::for_search(dir.path(), "Hackney rentals");

        let mut store = TrackingStore::open(Box::new(backend.clone())).await.expect("open");
        store.record_sent(&[tracked(1, "1 Mare St"), tracked(2, "2 Mare St")]);
        store.flush().await.expect("flush");

        let reloaded = TrackingStore::open(Box::new(backend)).await.expect("reopen");
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(ListingKey::derive(1, "1 Mare St")));
    }

    #[tokio::test]
    async fn partitions_are_isolated_per_search() {
        let dir = tempdir().expect("tempdir");
        let a = JsonFileBackend::for_search(dir.path(), "Search A");
        let b = JsonFileBackend::for_search(dir.path(), "Search B");

        let mut store_a = TrackingStore::open(Box::new(a)).await.expect("open a");
        store_a.record_sent(&[tracked(1, "1 Mare St")]);
        store_a.flush().await.expect("flush a");

        let store_b = TrackingStore::open(Box::new(b)).await.expect("open b");
        assert!(store_b.is_empty());
        assert!(!store_b.contains(ListingKey::derive(1, "1 Mare St")));
    }

    #[tokio::test]
    async fn filter_unseen_drops_only_tracked_keys() {
        let mut store = TrackingStore::open(Box::<MemoryBackend>::default())
            .await
            .expect("open");
        store.record_sent(&[tracked(1, "1 Mare St")]);

        let unseen = store.filter_unseen(vec![candidate(1, "1 Mare St"), candidate(2, "2 Mare St")]);
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0].portal_id, 2);
    }

    #[tokio::test]
    async fn record_sent_ignores_duplicate_keys() {
        let mut store = TrackingStore::open(Box::<MemoryBackend>::default())
            .await
            .expect("open");
        store.record_sent(&[tracked(1, "1 Mare St")]);
        store.record_sent(&[tracked(1, "1 Mare St")]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_entries() {
        let mut store = TrackingStore::open(Box::<MemoryBackend>::default())
            .await
            .expect("open");
        let records: Vec<_> = (0..6).map(|i| tracked(i, &format!("{i} Mare St"))).collect();
        store.record_sent(&records);

        store.prune(4);
        assert_eq!(store.len(), 4);
        assert!(!store.contains(ListingKey::derive(0, "0 Mare St")));
        assert!(!store.contains(ListingKey::derive(1, "1 Mare St")));
        assert!(store.contains(ListingKey::derive(5, "5 Mare St")));
    }

    #[tokio::test]
    async fn prune_below_cap_is_a_no_op() {
        let mut store = TrackingStore::open(Box::<MemoryBackend>::default())
            .await
            .expect("open");
        store.record_sent(&[tracked(1, "1 Mare St")]);
        store.prune(1000);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn forced_flush_failure_surfaces_as_flush_error() {
        let backend = MemoryBackend::default();
        backend.set_fail_flush(true);
        let mut store = TrackingStore::open(Box::new(backend)).await.expect("open");
        store.record_sent(&[tracked(1, "1 Mare St")]);
        assert!(matches!(store.flush().await, Err(StoreError::Flush(_))));
    }
}
