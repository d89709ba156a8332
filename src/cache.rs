use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::ParserConfig;
use crate::error::{Result, SchemaTreeError};
use crate::model::SchemaNode;

/// Depth- and root-restricted view of a tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeView {
    pub root_path: Option<String>,
    pub max_depth: Option<usize>,
}

impl TreeView {
    pub fn subtree(path: impl Into<String>) -> Self {
        Self {
            root_path: Some(path.into()),
            max_depth: None,
        }
    }

    pub fn depth(max_depth: usize) -> Self {
        Self {
            root_path: None,
            max_depth: Some(max_depth),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    /// Derive the view from a full tree without touching it
    pub fn apply(&self, tree: &SchemaNode) -> Result<SchemaNode> {
        let root = match self.root_path.as_deref() {
            Some(path) => tree.find(path).ok_or_else(|| SchemaTreeError::NodeNotFound {
                path: path.to_string(),
            })?,
            None => tree,
        };
        Ok(match self.max_depth {
            Some(depth) => root.pruned(depth),
            None => root.clone(),
        })
    }

    fn render(&self) -> String {
        let path = self.root_path.as_deref().unwrap_or("");
        match self.max_depth {
            Some(depth) => format!("path={};depth={}", path, depth),
            None => format!("path={};depth=*", path),
        }
    }
}

/// What part of a source's tree a caller asks for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalKey {
    FullTree,
    /// Derived from the cached full tree on every call
    Subtree(TreeView),
    /// Derived once and cached under its own key
    CachedSubtree(TreeView),
}

impl LogicalKey {
    pub fn render(&self) -> String {
        match self {
            LogicalKey::FullTree => "full".to_string(),
            LogicalKey::Subtree(view) => format!("view:{}", view.render()),
            LogicalKey::CachedSubtree(view) => format!("cached-view:{}", view.render()),
        }
    }
}

/// Composite key of (source identity, root, parser config, logical key)
///
/// Every key of one source shares the same scope prefix, which is what
/// source-wide invalidation matches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: String,
    rendered: String,
}

impl CacheKey {
    pub fn new(
        source_identity: &str,
        root: Option<&str>,
        config: &ParserConfig,
        logical: &LogicalKey,
    ) -> Self {
        let scope = Self::scope_for(source_identity);
        let rendered = format!(
            "{}:{}:root={}:{}",
            scope,
            config.cache_key(),
            root.unwrap_or("*"),
            logical.render()
        );
        Self { scope, rendered }
    }

    /// Scope shared by every key of one source
    pub fn scope_for(source_identity: &str) -> String {
        let digest = hex::encode(Sha256::digest(source_identity.as_bytes()));
        format!("src_{}", &digest[..16])
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Entity tag of one cached value
pub fn etag_for(key: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b"\0");
    hasher.update(fingerprint.as_bytes());
    format!("\"{}\"", &hex::encode(hasher.finalize())[..16])
}

/// A cached tree with its freshness data
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<SchemaNode>,
    pub inserted_at: DateTime<Utc>,
    pub ttl: Duration,
    pub source_fingerprint: String,
    pub etag: String,
}

impl CacheEntry {
    pub fn new(key: &CacheKey, value: Arc<SchemaNode>, fingerprint: &str, ttl: Duration) -> Self {
        Self {
            key: key.as_str().to_string(),
            value,
            inserted_at: Utc::now(),
            ttl,
            etag: etag_for(key.as_str(), fingerprint),
            source_fingerprint: fingerprint.to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        Utc::now() - self.inserted_at >= ttl
    }

    pub fn is_stale(&self, current_fingerprint: &str) -> bool {
        self.source_fingerprint != current_fingerprint
    }
}

/// Per-entry TTL taken from the entry itself
struct EntryExpiry;

impl Expiry<String, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process tier using Moka
///
/// A hit must pass both the TTL check and the fingerprint check; an entry
/// failing either is removed on the spot.
pub struct LocalCache {
    cache: Cache<String, Arc<CacheEntry>>,
}

impl LocalCache {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();

        Self { cache }
    }

    /// Fresh value for `key`, or `None` on a miss
    pub async fn get(&self, key: &CacheKey, current_fingerprint: &str) -> Option<Arc<SchemaNode>> {
        let entry = self.get_entry(key, current_fingerprint).await?;
        Some(entry.value.clone())
    }

    /// Fresh entry for `key` including its metadata
    pub async fn get_entry(
        &self,
        key: &CacheKey,
        current_fingerprint: &str,
    ) -> Option<Arc<CacheEntry>> {
        let entry = self.cache.get(key.as_str()).await?;

        if entry.is_expired() {
            debug!(key = %key, "Local cache entry expired");
            self.cache.invalidate(key.as_str()).await;
            return None;
        }
        if entry.is_stale(current_fingerprint) {
            debug!(key = %key, "Local cache entry stale");
            self.cache.invalidate(key.as_str()).await;
            return None;
        }

        Some(entry)
    }

    pub async fn put(
        &self,
        key: &CacheKey,
        value: Arc<SchemaNode>,
        fingerprint: &str,
        ttl: Duration,
    ) {
        let entry = CacheEntry::new(key, value, fingerprint, ttl);
        self.cache
            .insert(key.as_str().to_string(), Arc::new(entry))
            .await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key.as_str()).await;
    }

    /// Remove every entry of one source scope, returning how many were dropped
    pub async fn invalidate_scope(&self, scope: &str) -> usize {
        let prefix = format!("{}:", scope);
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.cache.invalidate(key.as_str()).await;
        }
        keys.len()
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    pub async fn stats(&self) -> LocalCacheStats {
        self.cache.run_pending_tasks().await;

        LocalCacheStats {
            entry_count: self.cache.entry_count(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub entry_count: u64,
}
