//! # Peer Persistence & Scoring Module
//!
//! Durable, encrypted, queryable store of everything the node knows about
//! peers it has met.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PEER STORE LAYOUT                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  tether.peers.index         ──►  ["a1f...", "9c2...", ...]             │
//! │  tether.peers.record.a1f…   ──►  PeerRecord (secret sealed)            │
//! │  tether.peers.record.9c2…   ──►  PeerRecord (secret sealed)            │
//! │  tether.peers.metadata      ──►  {last_cleanup, total_peers, size}     │
//! │                                                                         │
//! │  Reads decrypt the shared secret on the way out; writes seal it on    │
//! │  the way in. Every other field is stored in the clear.                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Retention
//!
//! Cleanup runs when the store grows past 80% of its cap and at least
//! daily: stale peers (>30 d inactive) go first, then peers that only
//! ever failed and whose blacklist expired, then the oldest by
//! `last_seen` until the count fits the cap. Only peers with zero
//! successful connections are ever auto-blacklisted.
//!
//! ## Concurrency
//!
//! Every operation is individually atomic behind one internal lock; there
//! are no cross-peer transactions. KV failures are logged and surface as
//! errors the caller degrades around: reconnection keeps working from
//! in-memory state, just with reduced quality.

mod record;
mod scoring;

pub use record::{
    ice_cache_validity_ms, CachedCandidate, ConnectionQuality, PeerRecord, RECORD_SCHEMA_VERSION,
};
pub use scoring::{cold_start_score, quality_score, reconnection_score};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{open_blob, seal_blob, EncryptionKey, PublicKey};
use crate::error::{Error, Result};
use crate::storage::{keys, Kv};
use crate::transport::ConnectionType;

/// Tunables for the peer store
#[derive(Debug, Clone)]
pub struct PeerStoreConfig {
    /// Hard cap on stored peers
    pub max_peers: usize,
    /// Attempts after which a never-successful peer is blacklisted
    pub max_reconnection_attempts: u32,
    /// Auto-blacklist duration (ms)
    pub blacklist_duration_ms: i64,
    /// Inactivity horizon after which peers are deleted (ms)
    pub retention_ms: i64,
    /// Minimum interval between automatic cleanups (ms)
    pub cleanup_interval_ms: i64,
}

impl Default for PeerStoreConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            max_reconnection_attempts: 5,
            blacklist_duration_ms: 24 * 60 * 60 * 1000,
            retention_ms: 30 * 24 * 60 * 60 * 1000,
            cleanup_interval_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Partial quality update merged into a record
///
/// Any populated field overwrites or folds into the stored quality; a
/// populated `attempt` also bumps the connection counters. Applying an
/// update resets `reconnection_attempts` to zero.
#[derive(Debug, Clone, Default)]
pub struct QualityUpdate {
    /// New latency measurement
    pub latency_ms: Option<u32>,
    /// New candidate classification
    pub connection_type: Option<ConnectionType>,
    /// Outcome of a connection attempt to fold in
    pub attempt: Option<bool>,
    /// Observed session uptime to fold into the running average
    pub uptime_s: Option<f64>,
    /// Updated network address
    pub last_known_address: Option<String>,
}

/// Sort key for peer queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSortKey {
    /// Most recently seen
    LastSeen,
    /// Highest quality score
    Quality,
    /// Most recently connected
    LastConnected,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

/// Options for [`PeerStore::query`]
#[derive(Debug, Clone)]
pub struct PeerQuery {
    /// Sort key
    pub sort_by: PeerSortKey,
    /// Sort direction
    pub order: SortOrder,
    /// Maximum records returned
    pub limit: Option<usize>,
    /// Minimum quality score
    pub min_quality: Option<f64>,
    /// Maximum age of `last_seen` (ms)
    pub max_age_ms: Option<i64>,
    /// Drop blacklisted peers
    pub exclude_blacklisted: bool,
}

impl Default for PeerQuery {
    fn default() -> Self {
        Self {
            sort_by: PeerSortKey::LastSeen,
            order: SortOrder::Descending,
            limit: None,
            min_quality: None,
            max_age_ms: None,
            exclude_blacklisted: true,
        }
    }
}

/// Options for [`PeerStore::reconnection_candidates`]
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    /// Maximum candidates returned
    pub limit: usize,
    /// Maximum age of `last_seen` (ms)
    pub max_age_ms: Option<i64>,
    /// Minimum reconnection score
    pub min_score: Option<f64>,
    /// Peer ids to skip (already connected, in-flight, ...)
    pub exclude: Vec<String>,
}

impl Default for CandidateQuery {
    fn default() -> Self {
        Self { limit: 20, max_age_ms: None, min_score: None, exclude: Vec::new() }
    }
}

/// What a cleanup pass deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Peers inactive beyond the retention horizon
    pub stale: usize,
    /// Never-successful peers whose blacklist expired
    pub failed: usize,
    /// Oldest peers evicted to fit the cap
    pub evicted: usize,
}

#[derive(Serialize, Deserialize)]
struct StoredPeerRecord {
    record: PeerRecord,
    encrypted_shared_secret: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreMetadata {
    last_cleanup: i64,
    total_peers: u64,
    estimated_size: u64,
}

/// The durable peer store (single owner of the `tether.peers.*` keys)
pub struct PeerStore {
    kv: Arc<dyn Kv>,
    storage_key: EncryptionKey,
    config: PeerStoreConfig,
    // One lock makes each operation's read-modify-write atomic; there is
    // deliberately no cross-peer transaction.
    op_lock: tokio::sync::Mutex<()>,
}

impl PeerStore {
    /// Create a store over the given KV namespace
    pub fn new(kv: Arc<dyn Kv>, storage_key: EncryptionKey, config: PeerStoreConfig) -> Self {
        Self { kv, storage_key, config, op_lock: tokio::sync::Mutex::new(()) }
    }

    /// The configured cap
    pub fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    // ------------------------------------------------------------------
    // Core operations
    // ------------------------------------------------------------------

    /// Insert or replace a record
    ///
    /// Seals the shared secret, updates the index, and opportunistically
    /// runs retention when the store is crowded or a day has passed.
    pub async fn store(&self, record: &PeerRecord) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.write_record(record).await?;
        self.add_to_index(&record.peer_id).await?;
        drop(_guard);

        self.maybe_cleanup().await;
        Ok(())
    }

    /// Fetch a record, decrypting the shared secret on the way out
    pub async fn get(&self, peer_id: &str) -> Result<Option<PeerRecord>> {
        let key = keys::peer_record(peer_id);
        let Some(bytes) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let stored: StoredPeerRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::StorageCorrupted(format!("Peer record {}: {}", peer_id, e)))?;

        let mut record = stored.record;
        if let Some(sealed) = stored.encrypted_shared_secret {
            match open_blob(&self.storage_key, &sealed, key.as_bytes()) {
                Ok(secret) => record.shared_secret = Some(secret),
                Err(e) => {
                    // The rest of the record is still useful.
                    warn!(peer_id, "Failed to decrypt shared secret: {}", e);
                }
            }
        }
        Ok(Some(record))
    }

    /// Delete a record and its index entry
    pub async fn remove(&self, peer_id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.kv.delete(&keys::peer_record(peer_id)).await?;
        self.remove_from_index(peer_id).await
    }

    /// All known peer ids, in index order
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        match self.kv.get(keys::PEER_INDEX).await? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::StorageCorrupted(format!("Peer index: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Number of known peers
    pub async fn count(&self) -> Result<usize> {
        Ok(self.list_ids().await?.len())
    }

    // ------------------------------------------------------------------
    // Field updates
    // ------------------------------------------------------------------

    /// Apply a mutation to a record, creating it first if unknown
    pub async fn update_peer<F>(&self, peer_id: &str, display_name: Option<&str>, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut PeerRecord),
    {
        let _guard = self.op_lock.lock().await;
        let now = crate::time::now_timestamp_millis();
        let mut record = match self.read_record(peer_id).await? {
            Some(record) => record,
            None => PeerRecord::new(peer_id, display_name.unwrap_or(peer_id), now),
        };
        if let Some(name) = display_name {
            record.display_name = name.to_string();
        }
        mutate(&mut record);
        self.write_record(&record).await?;
        self.add_to_index(peer_id).await
    }

    /// Bump `last_seen` to now
    pub async fn update_last_seen(&self, peer_id: &str, display_name: Option<&str>) -> Result<()> {
        let now = crate::time::now_timestamp_millis();
        self.update_peer(peer_id, display_name, |record| {
            record.last_seen = now;
        })
        .await
    }

    /// Record a successful connection: `last_connected`, `last_seen`
    pub async fn mark_connected(&self, peer_id: &str, display_name: Option<&str>) -> Result<()> {
        let now = crate::time::now_timestamp_millis();
        self.update_peer(peer_id, display_name, |record| {
            record.last_seen = now;
            record.last_connected = Some(now);
        })
        .await
    }

    /// Merge a partial quality update; resets the attempt counter
    pub async fn update_connection_quality(&self, peer_id: &str, update: QualityUpdate) -> Result<()> {
        let now = crate::time::now_timestamp_millis();
        self.update_peer(peer_id, None, |record| {
            let quality = &mut record.connection_quality;
            if let Some(success) = update.attempt {
                quality.record_attempt(success, now);
            }
            if let Some(latency) = update.latency_ms {
                quality.latency_ms = Some(latency);
            }
            if let Some(connection_type) = update.connection_type {
                quality.connection_type = Some(connection_type);
            }
            if let Some(uptime) = update.uptime_s {
                quality.record_uptime(uptime);
            }
            if let Some(address) = update.last_known_address {
                record.last_known_address = Some(address);
            }
            quality.last_measured = Some(now);
            record.last_seen = now;
            record.reconnection_attempts = 0;
        })
        .await
    }

    /// Count a failed reconnection attempt
    ///
    /// A peer that has never connected successfully is blacklisted for 24
    /// hours once it exhausts the attempt budget. A peer with any prior
    /// success is never auto-blacklisted.
    pub async fn increment_reconnection_attempts(&self, peer_id: &str) -> Result<u32> {
        let now = crate::time::now_timestamp_millis();
        let max_attempts = self.config.max_reconnection_attempts;
        let blacklist_until = now + self.config.blacklist_duration_ms;
        let mut attempts = 0;
        self.update_peer(peer_id, None, |record| {
            record.reconnection_attempts = record.reconnection_attempts.saturating_add(1);
            attempts = record.reconnection_attempts;
            if record.reconnection_attempts >= max_attempts
                && record.connection_quality.successful_connections == 0
            {
                warn!(peer_id = %record.peer_id, attempts, "Blacklisting never-successful peer");
                record.blacklist(blacklist_until);
            }
        })
        .await?;
        Ok(attempts)
    }

    /// Store a peer's public keys
    pub async fn update_peer_public_key(&self, peer_id: &str, public_key: PublicKey) -> Result<()> {
        self.update_peer(peer_id, None, |record| {
            record.public_key = Some(public_key);
        })
        .await
    }

    /// Store a peer's shared secret (sealed at rest)
    pub async fn update_shared_secret(&self, peer_id: &str, secret: &[u8]) -> Result<()> {
        let secret = secret.to_vec();
        self.update_peer(peer_id, None, |record| {
            record.shared_secret = Some(secret);
        })
        .await
    }

    /// Cache signalling data for the fast reconnect path
    pub async fn cache_ice_candidates(&self, peer_id: &str, blobs: Vec<serde_json::Value>) -> Result<()> {
        let now = crate::time::now_timestamp_millis();
        self.update_peer(peer_id, None, |record| {
            record.cached_ice_candidates = blobs
                .into_iter()
                .map(|blob| CachedCandidate { blob, cached_at: now })
                .collect();
        })
        .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Query records with filtering and sorting
    pub async fn query(&self, query: &PeerQuery) -> Result<Vec<PeerRecord>> {
        let now = crate::time::now_timestamp_millis();
        let mut records = self.load_all().await?;

        records.retain(|record| {
            if query.exclude_blacklisted && record.is_blacklisted(now) {
                return false;
            }
            if let Some(max_age) = query.max_age_ms {
                if now - record.last_seen > max_age {
                    return false;
                }
            }
            if let Some(min_quality) = query.min_quality {
                if quality_score(&record.connection_quality) < min_quality {
                    return false;
                }
            }
            true
        });

        records.sort_by(|a, b| {
            let ordering = match query.sort_by {
                PeerSortKey::LastSeen => a.last_seen.cmp(&b.last_seen),
                PeerSortKey::LastConnected => {
                    a.last_connected.unwrap_or(0).cmp(&b.last_connected.unwrap_or(0))
                }
                PeerSortKey::Quality => quality_score(&a.connection_quality)
                    .partial_cmp(&quality_score(&b.connection_quality))
                    .unwrap_or(std::cmp::Ordering::Equal),
            };
            match query.order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Rank candidates for reconnection, best first
    ///
    /// Blacklisted and excluded peers never appear.
    pub async fn reconnection_candidates(&self, query: &CandidateQuery) -> Result<Vec<PeerRecord>> {
        let now = crate::time::now_timestamp_millis();
        let mut records = self.load_all().await?;

        records.retain(|record| {
            if record.is_blacklisted(now) || query.exclude.iter().any(|id| id == &record.peer_id) {
                return false;
            }
            if let Some(max_age) = query.max_age_ms {
                if now - record.last_seen > max_age {
                    return false;
                }
            }
            if let Some(min_score) = query.min_score {
                if reconnection_score(record, now) < min_score {
                    return false;
                }
            }
            true
        });

        records.sort_by(|a, b| {
            reconnection_score(b, now)
                .partial_cmp(&reconnection_score(a, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records.truncate(query.limit);
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Run a retention pass now
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let _guard = self.op_lock.lock().await;
        let now = crate::time::now_timestamp_millis();
        let mut report = CleanupReport::default();
        let mut records = self.load_all_locked().await?;

        // Stale peers first.
        let mut keep = Vec::with_capacity(records.len());
        for record in records.drain(..) {
            if now - record.last_seen > self.config.retention_ms {
                self.delete_record_locked(&record.peer_id).await?;
                report.stale += 1;
            } else if record.reconnection_attempts >= self.config.max_reconnection_attempts
                && record.connection_quality.successful_connections == 0
                && !record.is_blacklisted(now)
            {
                self.delete_record_locked(&record.peer_id).await?;
                report.failed += 1;
            } else {
                keep.push(record);
            }
        }

        // LRU-evict down to the cap.
        if keep.len() > self.config.max_peers {
            keep.sort_by_key(|record| record.last_seen);
            let excess = keep.len() - self.config.max_peers;
            for record in keep.drain(..excess) {
                self.delete_record_locked(&record.peer_id).await?;
                report.evicted += 1;
            }
        }

        let index: Vec<String> = keep.iter().map(|r| r.peer_id.clone()).collect();
        self.kv
            .put(keys::PEER_INDEX, bincode::serialize(&index)?)
            .await?;
        self.write_metadata(StoreMetadata {
            last_cleanup: now,
            total_peers: index.len() as u64,
            estimated_size: 0,
        })
        .await?;

        if report != CleanupReport::default() {
            info!(?report, remaining = index.len(), "Peer store cleanup");
        }
        Ok(report)
    }

    async fn maybe_cleanup(&self) {
        let Ok(count) = self.count().await else { return };
        let now = crate::time::now_timestamp_millis();
        let metadata = self.read_metadata().await;
        let crowded = count * 5 > self.config.max_peers * 4; // > 80%

        if metadata.last_cleanup == 0 && !crowded {
            // First use: start the daily clock without sweeping.
            let _ = self
                .write_metadata(StoreMetadata {
                    last_cleanup: now,
                    total_peers: count as u64,
                    estimated_size: 0,
                })
                .await;
            return;
        }

        let overdue = now - metadata.last_cleanup > self.config.cleanup_interval_ms;
        if crowded || overdue {
            if let Err(e) = self.cleanup().await {
                warn!("Peer store cleanup failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn read_record(&self, peer_id: &str) -> Result<Option<PeerRecord>> {
        // Same as get(), but callable while holding the op lock.
        let key = keys::peer_record(peer_id);
        let Some(bytes) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let stored: StoredPeerRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::StorageCorrupted(format!("Peer record {}: {}", peer_id, e)))?;
        let mut record = stored.record;
        if let Some(sealed) = stored.encrypted_shared_secret {
            record.shared_secret = open_blob(&self.storage_key, &sealed, key.as_bytes()).ok();
        }
        Ok(Some(record))
    }

    async fn write_record(&self, record: &PeerRecord) -> Result<()> {
        let key = keys::peer_record(&record.peer_id);
        let encrypted_shared_secret = match &record.shared_secret {
            Some(secret) => Some(seal_blob(&self.storage_key, secret, key.as_bytes())?),
            None => None,
        };
        // Records go through JSON: cached signalling blobs are free-form
        // JSON values, which a non-self-describing format cannot decode.
        let stored = StoredPeerRecord { record: record.clone(), encrypted_shared_secret };
        let bytes = serde_json::to_vec(&stored)?;
        self.kv.put(&key, bytes).await?;
        debug!(peer_id = %record.peer_id, "Stored peer record");
        Ok(())
    }

    async fn add_to_index(&self, peer_id: &str) -> Result<()> {
        let mut index = self.list_ids().await?;
        if !index.iter().any(|id| id == peer_id) {
            index.push(peer_id.to_string());
            self.kv
                .put(keys::PEER_INDEX, bincode::serialize(&index)?)
                .await?;
        }
        Ok(())
    }

    async fn remove_from_index(&self, peer_id: &str) -> Result<()> {
        let mut index = self.list_ids().await?;
        let before = index.len();
        index.retain(|id| id != peer_id);
        if index.len() != before {
            self.kv
                .put(keys::PEER_INDEX, bincode::serialize(&index)?)
                .await?;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PeerRecord>> {
        let mut records = Vec::new();
        for peer_id in self.list_ids().await? {
            if let Some(record) = self.get(&peer_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load_all_locked(&self) -> Result<Vec<PeerRecord>> {
        let mut records = Vec::new();
        for peer_id in self.list_ids().await? {
            if let Some(record) = self.read_record(&peer_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn delete_record_locked(&self, peer_id: &str) -> Result<()> {
        self.kv.delete(&keys::peer_record(peer_id)).await
    }

    async fn read_metadata(&self) -> StoreMetadata {
        match self.kv.get(keys::PEER_METADATA).await {
            Ok(Some(bytes)) => bincode::deserialize(&bytes).unwrap_or_default(),
            _ => StoreMetadata::default(),
        }
    }

    async fn write_metadata(&self, metadata: StoreMetadata) -> Result<()> {
        self.kv
            .put(keys::PEER_METADATA, bincode::serialize(&metadata)?)
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_or_init_storage_key, MemoryKv};

    async fn store_with(config: PeerStoreConfig) -> PeerStore {
        let kv = Arc::new(MemoryKv::new());
        let key = load_or_init_storage_key(kv.as_ref()).await.unwrap();
        PeerStore::new(kv, key, config)
    }

    async fn store() -> PeerStore {
        store_with(PeerStoreConfig::default()).await
    }

    fn record(peer_id: &str) -> PeerRecord {
        PeerRecord::new(peer_id, peer_id.to_uppercase(), crate::time::now_timestamp_millis())
    }

    #[tokio::test]
    async fn test_store_get_roundtrip() {
        let store = store().await;
        let mut original = record("abc");
        original.shared_secret = Some(vec![9; 32]);

        store.store(&original).await.unwrap();
        let loaded = store.get("abc").await.unwrap().unwrap();

        assert_eq!(loaded, original);
        assert_eq!(loaded.shared_secret, Some(vec![9; 32]));
    }

    #[tokio::test]
    async fn test_store_get_store_is_idempotent() {
        let store = store().await;
        let mut original = record("abc");
        original.shared_secret = Some(vec![7; 32]);
        store.store(&original).await.unwrap();

        let loaded = store.get("abc").await.unwrap().unwrap();
        store.store(&loaded).await.unwrap();
        let again = store.get("abc").await.unwrap().unwrap();

        assert_eq!(again, loaded);
    }

    #[tokio::test]
    async fn test_shared_secret_sealed_at_rest() {
        let kv = Arc::new(MemoryKv::new());
        let key = load_or_init_storage_key(kv.as_ref()).await.unwrap();
        let store = PeerStore::new(kv.clone(), key, PeerStoreConfig::default());

        let mut original = record("abc");
        original.shared_secret = Some(vec![0xAB; 32]);
        store.store(&original).await.unwrap();

        let raw = kv.get(&keys::peer_record("abc")).await.unwrap().unwrap();
        assert!(!raw.windows(32).any(|w| w == [0xAB; 32]));
    }

    #[tokio::test]
    async fn test_remove_updates_index() {
        let store = store().await;
        store.store(&record("a")).await.unwrap();
        store.store(&record("b")).await.unwrap();

        store.remove("a").await.unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec!["b".to_string()]);
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_quality_resets_attempts() {
        let store = store().await;
        let mut r = record("abc");
        r.reconnection_attempts = 3;
        store.store(&r).await.unwrap();

        store
            .update_connection_quality(
                "abc",
                QualityUpdate { latency_ms: Some(45), attempt: Some(true), ..Default::default() },
            )
            .await
            .unwrap();

        let loaded = store.get("abc").await.unwrap().unwrap();
        assert_eq!(loaded.reconnection_attempts, 0);
        assert_eq!(loaded.connection_quality.latency_ms, Some(45));
        assert_eq!(loaded.connection_quality.successful_connections, 1);
    }

    #[tokio::test]
    async fn test_attempts_blacklist_never_successful_peer() {
        let store = store().await;
        store.store(&record("abc")).await.unwrap();

        for _ in 0..5 {
            store.increment_reconnection_attempts("abc").await.unwrap();
        }

        let loaded = store.get("abc").await.unwrap().unwrap();
        let now = crate::time::now_timestamp_millis();
        assert!(loaded.is_blacklisted(now));
    }

    #[tokio::test]
    async fn test_successful_peer_is_never_auto_blacklisted() {
        let store = store().await;
        let mut r = record("abc");
        r.connection_quality.record_attempt(true, 0);
        store.store(&r).await.unwrap();

        for _ in 0..10 {
            store.increment_reconnection_attempts("abc").await.unwrap();
        }

        let loaded = store.get("abc").await.unwrap().unwrap();
        assert_eq!(loaded.blacklist_until, None);
    }

    #[tokio::test]
    async fn test_query_excludes_blacklisted() {
        let store = store().await;
        store.store(&record("good")).await.unwrap();
        let mut bad = record("bad");
        bad.blacklist(crate::time::now_timestamp_millis() + 60_000);
        store.store(&bad).await.unwrap();

        let results = store.query(&PeerQuery::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].peer_id, "good");

        let all = store
            .query(&PeerQuery { exclude_blacklisted: false, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_query_sorting_and_limit() {
        let store = store().await;
        let now = crate::time::now_timestamp_millis();
        for (id, age) in [("old", 30_000), ("mid", 20_000), ("new", 10_000)] {
            let mut r = record(id);
            r.last_seen = now - age;
            store.store(&r).await.unwrap();
        }

        let results = store
            .query(&PeerQuery {
                sort_by: PeerSortKey::LastSeen,
                order: SortOrder::Descending,
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn test_reconnection_candidates_ranked_and_excluded() {
        let store = store().await;
        let now = crate::time::now_timestamp_millis();

        let mut strong = record("strong");
        strong.last_connected = Some(now - 1000);
        strong.connection_quality.latency_ms = Some(20);
        strong.connection_quality.connection_type = Some(ConnectionType::Host);
        strong.connection_quality.record_attempt(true, now);
        store.store(&strong).await.unwrap();

        let mut weak = record("weak");
        weak.last_connected = Some(now - 6 * 24 * 60 * 60 * 1000);
        weak.reconnection_attempts = 2;
        store.store(&weak).await.unwrap();

        store.store(&record("connected")).await.unwrap();

        let candidates = store
            .reconnection_candidates(&CandidateQuery {
                exclude: vec!["connected".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let ids: Vec<&str> = candidates.iter().map(|r| r.peer_id.as_str()).collect();
        assert_eq!(ids[0], "strong");
        assert!(!ids.contains(&"connected"));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_stale_peers() {
        let store = store().await;
        let now = crate::time::now_timestamp_millis();

        let mut stale = record("stale");
        stale.last_seen = now - 31 * 24 * 60 * 60 * 1000;
        store.store(&stale).await.unwrap();
        store.store(&record("fresh")).await.unwrap();

        let report = store.cleanup().await.unwrap();

        assert_eq!(report.stale, 1);
        assert!(store.get("stale").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cap_is_enforced_lru() {
        // Crossing 80% of the cap triggers the sweep on its own; the
        // oldest peers by last_seen go first and the bound holds.
        let store = store_with(PeerStoreConfig { max_peers: 3, ..Default::default() }).await;
        let now = crate::time::now_timestamp_millis();

        for (i, id) in ["oldest", "old", "newer", "newest"].iter().enumerate() {
            let mut r = record(id);
            r.last_seen = now - (3 - i as i64) * 10_000;
            store.store(&r).await.unwrap();
        }
        store.cleanup().await.unwrap();

        let survivors = store.list_ids().await.unwrap();
        assert!(survivors.len() <= 3);
        assert!(!survivors.contains(&"oldest".to_string()));
        assert!(survivors.contains(&"newest".to_string()));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_exhausted_failures_after_blacklist() {
        let store = store().await;
        let mut hopeless = record("hopeless");
        hopeless.reconnection_attempts = 7;
        // Blacklist already expired
        hopeless.blacklist_until = Some(crate::time::now_timestamp_millis() - 1000);
        store.store(&hopeless).await.unwrap();

        let report = store.cleanup().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.get("hopeless").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_creates_missing_record() {
        let store = store().await;
        store.update_last_seen("ghost", Some("Ghost")).await.unwrap();

        let loaded = store.get("ghost").await.unwrap().unwrap();
        assert_eq!(loaded.display_name, "Ghost");
    }
}
