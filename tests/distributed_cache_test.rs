mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::TestFixtures;
use tempfile::TempDir;
use xsd_tree::{
    CacacheStore, CacheKey, DistributedCache, DistributedConfig, ExtensionIndex, LogicalKey,
    MemoryStore, ParserConfig, RemoteStore, SchemaNode, TreeBuilder, TypeSystem,
    content_fingerprint,
};

fn building_tree(content: &str) -> SchemaNode {
    let config = ParserConfig::default();
    let types = TypeSystem::parse(content).unwrap();
    let index = ExtensionIndex::build(&types, config.max_extension_depth);
    TreeBuilder::new(&types, &index, &config)
        .build(None)
        .unwrap()
        .root
}

fn full_key(identity: &str) -> CacheKey {
    CacheKey::new(
        identity,
        None,
        &ParserConfig::default(),
        &LogicalKey::FullTree,
    )
}

fn distributed_config(prefix: &str) -> DistributedConfig {
    DistributedConfig {
        enabled: true,
        key_prefix: prefix.to_string(),
        ..DistributedConfig::default()
    }
}

#[tokio::test]
async fn test_prefixes_isolate_deployments_on_one_store() {
    let fixtures = TestFixtures::new();
    let content = fixtures.read(&fixtures.building_schema());
    let fingerprint = content_fingerprint(&content);
    let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());

    let staging = DistributedCache::new(store.clone(), &distributed_config("staging:"));
    let production = DistributedCache::new(store.clone(), &distributed_config("production:"));
    let key = full_key("file:/schemas/building.xsd");

    staging
        .put(&key, &building_tree(&content), &fingerprint, Duration::from_secs(60))
        .await;

    assert!(staging.get(&key, &fingerprint).await.is_some());
    assert!(production.get(&key, &fingerprint).await.is_none());

    production.invalidate_scope(key.scope()).await;
    assert!(staging.get(&key, &fingerprint).await.is_some());
}

#[tokio::test]
async fn test_metadata_decides_staleness_across_instances() {
    let fixtures = TestFixtures::new();
    let content = fixtures.read(&fixtures.building_schema());
    let fingerprint = content_fingerprint(&content);
    let cache_dir = TempDir::new().unwrap();
    let config = DistributedConfig {
        directory: cache_dir.path().to_path_buf(),
        ..distributed_config("xsd-tree:")
    };

    let writer = DistributedCache::from_config(&config);
    let reader = DistributedCache::new(Arc::new(CacacheStore::new(cache_dir.path())), &config);
    let key = full_key("file:/schemas/building.xsd");

    writer
        .put(&key, &building_tree(&content), &fingerprint, Duration::from_secs(60))
        .await;

    let metadata = reader.metadata(&key).await.unwrap();
    assert_eq!(metadata.source_fingerprint, fingerprint);
    assert!(reader.is_fresh(&key, &fingerprint).await);

    let changed = content_fingerprint(&content.replace("Zone", "Area"));
    assert!(!reader.is_fresh(&key, &changed).await);
    assert!(reader.get(&key, &changed).await.is_none());

    let fetched = reader.get(&key, &fingerprint).await.unwrap();
    assert_eq!(*fetched, building_tree(&content));
}

#[tokio::test]
async fn test_outage_mid_life_serves_the_mirror() {
    let fixtures = TestFixtures::new();
    let content = fixtures.read(&fixtures.building_schema());
    let fingerprint = content_fingerprint(&content);
    let store = Arc::new(MemoryStore::new());
    let cache = DistributedCache::new(store.clone(), &distributed_config("xsd-tree:"));
    let key = full_key("inline:building");

    cache
        .put(&key, &building_tree(&content), &fingerprint, Duration::from_secs(60))
        .await;
    store.set_available(false);

    let served = cache.get(&key, &fingerprint).await.unwrap();
    assert_eq!(served.name, "Building");
    assert!(!cache.is_available());

    let stats = cache.stats().await;
    assert!(!stats.remote_available);
    assert_eq!(stats.mirror_entries, 1);
}
