//! Two-tier resolution of schema trees.
//!
//! A resolve goes local tier, then distributed tier, then a build. Misses on
//! the same key and source version share one build through [`SingleFlight`],
//! and the build itself runs on the blocking pool under a time budget.
//! Failures are handed to every joiner and never cached.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::builder::{BuildCancel, BuildOutput, TreeBuilder};
use crate::cache::{CacheKey, LocalCache, LocalCacheStats, LogicalKey, TreeView};
use crate::config::{CacheConfig, Config, ParserConfig};
use crate::distributed::{DistributedCache, DistributedCacheStats, RemoteStore};
use crate::error::{Result, SchemaTreeError};
use crate::extension::ExtensionIndex;
use crate::flight::SingleFlight;
use crate::model::SchemaNode;
use crate::source::{LoadedSource, SchemaSource, SourceRegistry};
use crate::type_system::TypeSystem;

/// The tree construction step, swappable for instrumentation
///
/// `cancel` is set once the resolver stops waiting for the result; an
/// implementation should give up soon after.
pub trait TreeBuild: Send + Sync {
    fn build(
        &self,
        types: &TypeSystem,
        index: &ExtensionIndex,
        config: &ParserConfig,
        root: Option<&str>,
        cancel: &BuildCancel,
    ) -> Result<BuildOutput>;
}

/// Builds with [`TreeBuilder`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTreeBuild;

impl TreeBuild for DefaultTreeBuild {
    fn build(
        &self,
        types: &TypeSystem,
        index: &ExtensionIndex,
        config: &ParserConfig,
        root: Option<&str>,
        cancel: &BuildCancel,
    ) -> Result<BuildOutput> {
        TreeBuilder::new(types, index, config)
            .cancel_on(cancel)
            .build(root)
    }
}

/// Resolver counters and tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub builds: u64,
    pub parses: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub joins: u64,
    pub timeouts: u64,
    pub sources: usize,
    pub local: LocalCacheStats,
    pub distributed: Option<DistributedCacheStats>,
}

#[derive(Debug, Default)]
struct Counters {
    builds: AtomicU64,
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What a flight produces on a miss in both tiers
enum Fill {
    Build,
    Derive {
        full: Arc<SchemaNode>,
        view: TreeView,
    },
}

struct Inner {
    registry: SourceRegistry,
    local: LocalCache,
    distributed: Option<DistributedCache>,
    tree_build: Arc<dyn TreeBuild>,
    flights: SingleFlight<Arc<SchemaNode>>,
    ttl: Duration,
    build_timeout: Duration,
    counters: Counters,
}

/// Builder for [`SchemaResolver`]
pub struct ResolverBuilder {
    cache: CacheConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    tree_build: Arc<dyn TreeBuild>,
}

impl ResolverBuilder {
    pub fn new(cache: CacheConfig) -> Self {
        Self {
            cache,
            remote: None,
            tree_build: Arc::new(DefaultTreeBuild),
        }
    }

    /// Use `store` as the distributed tier, enabled or not in the config
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn tree_build(mut self, tree_build: Arc<dyn TreeBuild>) -> Self {
        self.tree_build = tree_build;
        self
    }

    pub fn build(self) -> SchemaResolver {
        let distributed = match self.remote {
            Some(store) => Some(DistributedCache::new(store, &self.cache.distributed)),
            None if self.cache.distributed.enabled => {
                Some(DistributedCache::from_config(&self.cache.distributed))
            }
            None => None,
        };

        SchemaResolver {
            inner: Arc::new(Inner {
                registry: SourceRegistry::new(),
                local: LocalCache::new(self.cache.max_memory_entries),
                distributed,
                tree_build: self.tree_build,
                flights: SingleFlight::new(),
                ttl: self.cache.ttl(),
                build_timeout: self.cache.build_timeout(),
                counters: Counters::default(),
            }),
        }
    }
}

/// Entry point for reading, invalidating and fingerprinting schema trees
///
/// Cloning is cheap and every clone shares the same caches. Tests get a clean
/// slate by constructing a new resolver.
#[derive(Clone)]
pub struct SchemaResolver {
    inner: Arc<Inner>,
}

impl SchemaResolver {
    pub fn new(cache: CacheConfig) -> Self {
        ResolverBuilder::new(cache).build()
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cache.clone())
    }

    pub fn builder(cache: CacheConfig) -> ResolverBuilder {
        ResolverBuilder::new(cache)
    }

    /// Resolve the tree (or view) of `source` built with `config`
    pub async fn resolve(
        &self,
        source: &SchemaSource,
        config: &ParserConfig,
        logical: &LogicalKey,
    ) -> Result<Arc<SchemaNode>> {
        let loaded = self.inner.registry.load(source).await?;
        let root = source.root();

        match logical {
            LogicalKey::FullTree => {
                self.resolve_cached(&loaded, root, config, LogicalKey::FullTree, Fill::Build)
                    .await
            }
            LogicalKey::Subtree(view) => {
                let full = self.resolve_full(&loaded, root, config).await?;
                Ok(Arc::new(view.apply(&full)?))
            }
            LogicalKey::CachedSubtree(view) => {
                let key = CacheKey::new(loaded.identity(), root, config, logical);
                if let Some(hit) = self.local_hit(&key, loaded.fingerprint()).await {
                    return Ok(hit);
                }

                let full = self.resolve_full(&loaded, root, config).await?;
                let fill = Fill::Derive {
                    full,
                    view: view.clone(),
                };
                self.resolve_cached(&loaded, root, config, logical.clone(), fill)
                    .await
            }
        }
    }

    /// Discard the loaded source and every cached tree derived from it
    pub async fn invalidate(&self, source: &SchemaSource) {
        let identity = source.identity();
        let scope = CacheKey::scope_for(&identity);

        self.inner.registry.invalidate(&identity);
        let local = self.inner.local.invalidate_scope(&scope).await;
        let remote = match &self.inner.distributed {
            Some(distributed) => distributed.invalidate_scope(&scope).await,
            None => 0,
        };

        info!(source = %identity, local, remote, "Schema source invalidated");
    }

    /// Content fingerprint of the current version of `source`
    pub async fn fingerprint(&self, source: &SchemaSource) -> Result<String> {
        let loaded = self.inner.registry.load(source).await?;
        Ok(loaded.fingerprint().to_string())
    }

    pub async fn stats(&self) -> ResolverStats {
        let counters = &self.inner.counters;
        let distributed = match &self.inner.distributed {
            Some(distributed) => Some(distributed.stats().await),
            None => None,
        };

        ResolverStats {
            builds: counters.builds.load(Ordering::Relaxed),
            parses: self.inner.registry.parse_count(),
            local_hits: counters.local_hits.load(Ordering::Relaxed),
            local_misses: counters.local_misses.load(Ordering::Relaxed),
            remote_hits: counters.remote_hits.load(Ordering::Relaxed),
            remote_misses: counters.remote_misses.load(Ordering::Relaxed),
            joins: self.inner.flights.join_count(),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            sources: self.inner.registry.len(),
            local: self.inner.local.stats().await,
            distributed,
        }
    }

    async fn resolve_full(
        &self,
        loaded: &Arc<LoadedSource>,
        root: Option<&str>,
        config: &ParserConfig,
    ) -> Result<Arc<SchemaNode>> {
        self.resolve_cached(loaded, root, config, LogicalKey::FullTree, Fill::Build)
            .await
    }

    async fn local_hit(&self, key: &CacheKey, fingerprint: &str) -> Option<Arc<SchemaNode>> {
        let hit = self.inner.local.get(key, fingerprint).await?;
        Counters::bump(&self.inner.counters.local_hits);
        debug!(key = %key, "Local cache hit");
        Some(hit)
    }

    async fn resolve_cached(
        &self,
        loaded: &Arc<LoadedSource>,
        root: Option<&str>,
        config: &ParserConfig,
        logical: LogicalKey,
        fill: Fill,
    ) -> Result<Arc<SchemaNode>> {
        let key = CacheKey::new(loaded.identity(), root, config, &logical);
        if let Some(hit) = self.local_hit(&key, loaded.fingerprint()).await {
            return Ok(hit);
        }

        // Keyed by version too, so a caller seeing a new fingerprint never
        // joins a build of the old one
        let flight_key = format!("{}@{}", key, loaded.fingerprint());
        let resolver = self.clone();
        let loaded = loaded.clone();
        let root = root.map(str::to_string);
        let config = config.clone();

        self.inner
            .flights
            .run(&flight_key, async move {
                resolver.fill(key, loaded, root, config, fill).await
            })
            .await
    }

    /// Body of a flight: recheck both tiers, then build or derive and store
    async fn fill(
        &self,
        key: CacheKey,
        loaded: Arc<LoadedSource>,
        root: Option<String>,
        config: ParserConfig,
        fill: Fill,
    ) -> Result<Arc<SchemaNode>> {
        let fingerprint = loaded.fingerprint();

        // A flight that just finished may have stored the value
        if let Some(hit) = self.local_hit(&key, fingerprint).await {
            return Ok(hit);
        }
        Counters::bump(&self.inner.counters.local_misses);

        if let Some(distributed) = &self.inner.distributed {
            match distributed.get(&key, fingerprint).await {
                Some(value) => {
                    Counters::bump(&self.inner.counters.remote_hits);
                    debug!(key = %key, "Distributed cache hit");
                    self.inner
                        .local
                        .put(&key, value.clone(), fingerprint, self.inner.ttl)
                        .await;
                    return Ok(value);
                }
                None => Counters::bump(&self.inner.counters.remote_misses),
            }
        }

        let value = match fill {
            Fill::Build => self.build(&key, loaded.clone(), root, config).await?,
            Fill::Derive { full, view } => Arc::new(view.apply(&full)?),
        };

        self.inner
            .local
            .put(&key, value.clone(), fingerprint, self.inner.ttl)
            .await;
        if let Some(distributed) = &self.inner.distributed {
            distributed
                .put(&key, &value, fingerprint, self.inner.ttl)
                .await;
        }

        Ok(value)
    }

    async fn build(
        &self,
        key: &CacheKey,
        loaded: Arc<LoadedSource>,
        root: Option<String>,
        config: ParserConfig,
    ) -> Result<Arc<SchemaNode>> {
        let started = Instant::now();
        let identity = loaded.identity().to_string();
        let tree_build = self.inner.tree_build.clone();
        info!(key = %key, "Building schema tree");

        let cancel = BuildCancel::new();
        let task = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let types = loaded.types()?;
                let index = loaded.index(config.max_extension_depth)?;
                tree_build.build(&types, &index, &config, root.as_deref(), &cancel)
            })
        };

        let timeout = self.inner.build_timeout;
        let output = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(output)) => output.map_err(|e| e.into_unresolvable(&identity))?,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Schema tree build panicked");
                return Err(SchemaTreeError::BuildFailed {
                    details: e.to_string(),
                });
            }
            Err(_) => {
                // The blocking task is detached; tell it to stop
                cancel.cancel();
                Counters::bump(&self.inner.counters.timeouts);
                warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Schema tree build timed out");
                return Err(SchemaTreeError::BuildTimeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        Counters::bump(&self.inner.counters.builds);
        info!(
            key = %key,
            nodes = output.root.node_count(),
            issues = output.issues.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Schema tree built"
        );

        Ok(Arc::new(output.root))
    }
}
