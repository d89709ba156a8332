//! Remote cache tier.
//!
//! Values live in a shared key-value store under a configurable prefix. Each
//! value has a small JSON metadata record at `{prefix}{key}:meta` holding the
//! source fingerprint and etag, so freshness is decided before the (possibly
//! large) value is fetched or decoded. A bounded in-process mirror keeps a
//! copy of recent entries and serves reads while the store is unreachable.
//! No failure of the store ever reaches the caller.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, etag_for};
use crate::config::DistributedConfig;
use crate::error::{CacheError, CacheResult};
use crate::model::SchemaNode;

/// Key-value store backing the distributed tier
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    async fn remove(&self, key: &str) -> CacheResult<()>;

    /// Remove every key starting with `prefix`, returning how many were removed
    async fn remove_prefix(&self, prefix: &str) -> CacheResult<usize>;

    async fn ping(&self) -> CacheResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredExpiry {
    key: String,
    expires_at: DateTime<Utc>,
}

/// Store on a shared cacache directory
///
/// Any process pointed at the same directory sees the same entries. Expiry
/// times are kept in sidecar JSON files next to the content store.
pub struct CacacheStore {
    cache_dir: PathBuf,
}

impl CacacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    fn unavailable(&self, details: impl std::fmt::Display) -> CacheError {
        CacheError::RemoteUnavailable {
            store: self.name().to_string(),
            details: details.to_string(),
        }
    }

    fn expiry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.cache_dir
            .join("expiry")
            .join(format!("{}.json", digest))
    }

    async fn read_expiry(&self, key: &str) -> CacheResult<Option<StoredExpiry>> {
        match fs::read_to_string(self.expiry_path(key)).await {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.unavailable(format!("Failed to read expiry: {}", e))),
        }
    }

    async fn write_expiry(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let path = self.expiry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.unavailable(format!("Failed to create expiry directory: {}", e)))?;
        }

        let expiry = StoredExpiry {
            key: key.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24)),
        };
        let content = serde_json::to_string(&expiry)
            .map_err(|e| self.unavailable(format!("Failed to serialize expiry: {}", e)))?;
        fs::write(&path, content)
            .await
            .map_err(|e| self.unavailable(format!("Failed to write expiry: {}", e)))
    }
}

#[async_trait]
impl RemoteStore for CacacheStore {
    fn name(&self) -> &str {
        "cacache"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(expiry) = self.read_expiry(key).await?
            && Utc::now() >= expiry.expires_at
        {
            self.remove(key).await?;
            return Ok(None);
        }

        match cacache::read(&self.cache_dir, key).await {
            Ok(data) => Ok(Some(data)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(e) => Err(self.unavailable(format!("Failed to read: {}", e))),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        cacache::write(&self.cache_dir, key, value)
            .await
            .map_err(|e| self.unavailable(format!("Failed to write: {}", e)))?;
        self.write_expiry(key, ttl).await
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        match cacache::remove(&self.cache_dir, key).await {
            Ok(()) | Err(cacache::Error::EntryNotFound(_, _)) => {}
            Err(e) => return Err(self.unavailable(format!("Failed to remove: {}", e))),
        }
        match fs::remove_file(self.expiry_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(key, error = %e, "Failed to remove expiry record"),
        }
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> CacheResult<usize> {
        if !fs::try_exists(&self.cache_dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let entries = cacache::index::ls(&self.cache_dir)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.unavailable(format!("Failed to read index: {}", e)))?;

        // The index is append-only, so a rewritten key shows up more than once
        let keys: BTreeSet<String> = entries
            .into_iter()
            .map(|entry| entry.key)
            .filter(|key| key.starts_with(prefix))
            .collect();
        for key in &keys {
            self.remove(key).await?;
        }
        Ok(keys.len())
    }

    async fn ping(&self) -> CacheResult<()> {
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| self.unavailable(e))
    }
}

/// In-process store with a switch to simulate an outage
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    available: AtomicBool,
    requests: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            requests: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Requests that reached the store while it was available
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn check(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(CacheError::RemoteUnavailable {
                store: "memory".to_string(),
                details: "connection refused".to_string(),
            })
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expires_at)) if Instant::now() >= *expires_at => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.check()?;
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> CacheResult<usize> {
        self.check()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check()
    }
}

const BINARY_TAG: u8 = b'B';
const TEXT_TAG: u8 = b'J';

/// Serialize with bincode, falling back to JSON if that fails
pub fn encode<T: Serialize>(key: &str, value: &T) -> CacheResult<Vec<u8>> {
    match bincode::serialize(value) {
        Ok(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(BINARY_TAG);
            out.extend_from_slice(&bytes);
            Ok(out)
        }
        Err(err) => {
            warn!(key, error = %err, "Binary encoding failed, falling back to JSON");
            let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
                key: key.to_string(),
                details: e.to_string(),
            })?;
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(TEXT_TAG);
            out.extend_from_slice(&bytes);
            Ok(out)
        }
    }
}

pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CacheResult<T> {
    let corruption = |details: String| CacheError::Corruption {
        key: key.to_string(),
        details,
    };
    match bytes.split_first() {
        Some((&BINARY_TAG, body)) => bincode::deserialize(body).map_err(|e| corruption(e.to_string())),
        Some((&TEXT_TAG, body)) => serde_json::from_slice(body).map_err(|e| corruption(e.to_string())),
        Some((tag, _)) => Err(corruption(format!("unknown codec tag {:#04x}", tag))),
        None => Err(corruption("empty value".to_string())),
    }
}

/// Freshness record stored beside every value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub source_fingerprint: String,
    pub etag: String,
    pub inserted_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl EntryMetadata {
    pub fn new(key: &str, fingerprint: &str, ttl: Duration) -> Self {
        Self {
            source_fingerprint: fingerprint.to_string(),
            etag: etag_for(key, fingerprint),
            inserted_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn is_expired(&self) -> bool {
        let ttl = chrono::Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX));
        Utc::now() - self.inserted_at >= ttl
    }

    pub fn is_fresh(&self, current_fingerprint: &str) -> bool {
        !self.is_expired() && self.source_fingerprint == current_fingerprint
    }
}

/// The mirror's own serialized copy of an entry
#[derive(Debug)]
struct MirrorEntry {
    bytes: Vec<u8>,
    metadata: EntryMetadata,
}

struct MirrorExpiry;

impl Expiry<String, Arc<MirrorEntry>> for MirrorExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<MirrorEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.metadata.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<MirrorEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.metadata.ttl())
    }
}

/// Tracks store outages so a failing store is not hit on every call
struct RemoteHealth {
    down_until: Mutex<Option<Instant>>,
    retry_after: Duration,
}

impl RemoteHealth {
    fn new(retry_after: Duration) -> Self {
        Self {
            down_until: Mutex::new(None),
            retry_after,
        }
    }

    fn is_available(&self) -> bool {
        match *self.down_until.lock() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    fn mark_failure(&self, store: &str, err: &CacheError) {
        let mut down_until = self.down_until.lock();
        if down_until.is_none() {
            warn!(store, error = %err, "Remote cache unavailable, serving from local mirror");
        }
        *down_until = Some(Instant::now() + self.retry_after);
    }

    fn mark_success(&self, store: &str) {
        let mut down_until = self.down_until.lock();
        if down_until.take().is_some() {
            info!(store, "Remote cache available again");
        }
    }
}

/// Distributed tier: remote store plus local mirror
pub struct DistributedCache {
    store: Arc<dyn RemoteStore>,
    prefix: String,
    mirror: Cache<String, Arc<MirrorEntry>>,
    health: RemoteHealth,
}

impl DistributedCache {
    pub fn new(store: Arc<dyn RemoteStore>, config: &DistributedConfig) -> Self {
        let mirror = Cache::builder()
            .max_capacity(config.mirror_capacity)
            .expire_after(MirrorExpiry)
            .build();

        Self {
            store,
            prefix: config.key_prefix.clone(),
            mirror,
            health: RemoteHealth::new(config.retry_after()),
        }
    }

    /// Tier backed by a cacache directory
    pub fn from_config(config: &DistributedConfig) -> Self {
        Self::new(Arc::new(CacacheStore::new(&config.directory)), config)
    }

    fn value_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn meta_key(&self, key: &CacheKey) -> String {
        format!("{}{}:meta", self.prefix, key)
    }

    pub fn is_available(&self) -> bool {
        self.health.is_available()
    }

    /// Metadata record for `key`, without touching the value
    pub async fn metadata(&self, key: &CacheKey) -> Option<EntryMetadata> {
        if self.health.is_available() {
            match self.remote_metadata(key).await {
                Ok(metadata) => {
                    self.health.mark_success(self.store.name());
                    return metadata;
                }
                Err(err) => self.health.mark_failure(self.store.name(), &err),
            }
        }
        self.mirror
            .get(key.as_str())
            .await
            .map(|entry| entry.metadata.clone())
    }

    pub async fn is_fresh(&self, key: &CacheKey, current_fingerprint: &str) -> bool {
        self.metadata(key)
            .await
            .is_some_and(|metadata| metadata.is_fresh(current_fingerprint))
    }

    /// Fresh value for `key`; every failure degrades to the mirror or a miss
    pub async fn get(&self, key: &CacheKey, current_fingerprint: &str) -> Option<Arc<SchemaNode>> {
        if self.health.is_available() {
            match self.remote_get(key, current_fingerprint).await {
                Ok(found) => {
                    self.health.mark_success(self.store.name());
                    return found;
                }
                Err(err) => self.health.mark_failure(self.store.name(), &err),
            }
        }
        self.mirror_get(key, current_fingerprint).await
    }

    async fn remote_metadata(&self, key: &CacheKey) -> CacheResult<Option<EntryMetadata>> {
        let Some(bytes) = self.store.get(&self.meta_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable cache metadata");
                Ok(None)
            }
        }
    }

    async fn remote_get(
        &self,
        key: &CacheKey,
        current_fingerprint: &str,
    ) -> CacheResult<Option<Arc<SchemaNode>>> {
        let Some(metadata) = self.remote_metadata(key).await? else {
            return Ok(None);
        };
        if !metadata.is_fresh(current_fingerprint) {
            debug!(key = %key, "Distributed cache entry stale or expired");
            return Ok(None);
        }

        let Some(bytes) = self.store.get(&self.value_key(key)).await? else {
            return Ok(None);
        };
        let node: SchemaNode = match decode(key.as_str(), &bytes) {
            Ok(node) => node,
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache value");
                return Ok(None);
            }
        };

        self.mirror
            .insert(
                key.as_str().to_string(),
                Arc::new(MirrorEntry { bytes, metadata }),
            )
            .await;
        Ok(Some(Arc::new(node)))
    }

    async fn mirror_get(
        &self,
        key: &CacheKey,
        current_fingerprint: &str,
    ) -> Option<Arc<SchemaNode>> {
        let entry = self.mirror.get(key.as_str()).await?;
        if !entry.metadata.is_fresh(current_fingerprint) {
            self.mirror.invalidate(key.as_str()).await;
            return None;
        }
        match decode::<SchemaNode>(key.as_str(), &entry.bytes) {
            Ok(node) => Some(Arc::new(node)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable mirror entry");
                self.mirror.invalidate(key.as_str()).await;
                None
            }
        }
    }

    /// Store a value in the mirror and, when reachable, the remote store
    pub async fn put(&self, key: &CacheKey, value: &SchemaNode, fingerprint: &str, ttl: Duration) {
        let bytes = match encode(key.as_str(), value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping distributed cache write");
                return;
            }
        };
        let metadata = EntryMetadata::new(key.as_str(), fingerprint, ttl);

        if self.health.is_available() {
            match self.remote_put(key, &bytes, &metadata, ttl).await {
                Ok(()) => self.health.mark_success(self.store.name()),
                Err(err) => {
                    self.health.mark_failure(self.store.name(), &err);
                    warn!(key = %key, error = %err, "Distributed cache write failed");
                }
            }
        }

        self.mirror
            .insert(
                key.as_str().to_string(),
                Arc::new(MirrorEntry { bytes, metadata }),
            )
            .await;
    }

    async fn remote_put(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        metadata: &EntryMetadata,
        ttl: Duration,
    ) -> CacheResult<()> {
        let meta = serde_json::to_vec(metadata).map_err(|e| CacheError::Serialization {
            key: key.as_str().to_string(),
            details: e.to_string(),
        })?;
        // Value first, so a readable metadata record implies a stored value
        self.store.set(&self.value_key(key), bytes, ttl).await?;
        self.store.set(&self.meta_key(key), &meta, ttl).await
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.mirror.invalidate(key.as_str()).await;
        if !self.health.is_available() {
            return;
        }
        match self.remote_remove(key).await {
            Ok(()) => self.health.mark_success(self.store.name()),
            Err(err) => {
                self.health.mark_failure(self.store.name(), &err);
                warn!(key = %key, error = %err, "Distributed cache invalidation failed");
            }
        }
    }

    async fn remote_remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.store.remove(&self.meta_key(key)).await?;
        self.store.remove(&self.value_key(key)).await
    }

    /// Remove every entry of one source scope from both the mirror and the store
    pub async fn invalidate_scope(&self, scope: &str) -> usize {
        let mirror_prefix = format!("{}:", scope);
        let keys: Vec<Arc<String>> = self
            .mirror
            .iter()
            .filter(|(key, _)| key.starts_with(&mirror_prefix))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.mirror.invalidate(key.as_str()).await;
        }

        if !self.health.is_available() {
            return 0;
        }
        let remote_prefix = format!("{}{}:", self.prefix, scope);
        match self.store.remove_prefix(&remote_prefix).await {
            Ok(removed) => {
                self.health.mark_success(self.store.name());
                removed
            }
            Err(err) => {
                self.health.mark_failure(self.store.name(), &err);
                warn!(scope, error = %err, "Distributed cache scope invalidation failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> DistributedCacheStats {
        self.mirror.run_pending_tasks().await;

        DistributedCacheStats {
            store: self.store.name().to_string(),
            remote_available: self.health.is_available(),
            mirror_entries: self.mirror.entry_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedCacheStats {
    pub store: String,
    pub remote_available: bool,
    pub mirror_entries: u64,
}
