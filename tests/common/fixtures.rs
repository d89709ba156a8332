use std::path::{Path, PathBuf};

use tempfile::TempDir;
use xsd_tree::{CacheConfig, DistributedConfig, SchemaSource};

/// Test fixture paths
pub struct TestFixtures {
    pub fixtures_dir: PathBuf,
}

impl TestFixtures {
    pub fn new() -> Self {
        let fixtures_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures");

        Self { fixtures_dir }
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.fixtures_dir.join("schemas")
    }

    /// `Record` of type L5, five levels of extension deep
    pub fn extension_chain_schema(&self) -> PathBuf {
        self.schemas_dir().join("extension_chain.xsd")
    }

    /// `Widget` of type C, where C extends B extends A extends C
    pub fn cyclic_schema(&self) -> PathBuf {
        self.schemas_dir().join("cyclic_types.xsd")
    }

    pub fn building_schema(&self) -> PathBuf {
        self.schemas_dir().join("building.xsd")
    }

    pub fn read(&self, path: &Path) -> String {
        std::fs::read_to_string(path).expect("fixture should be readable")
    }
}

/// A schema copied into a temporary directory so tests can rewrite it
pub struct WritableSchema {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl WritableSchema {
    pub fn copy_of(fixture: &Path) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join(
            fixture
                .file_name()
                .expect("fixture path should have a file name"),
        );
        std::fs::copy(fixture, &path).expect("fixture copy");
        Self { temp_dir, path }
    }

    pub fn source(&self) -> SchemaSource {
        SchemaSource::file(&self.path)
    }

    pub fn rewrite(&self, content: &str) {
        std::fs::write(&self.path, content).expect("schema rewrite");
    }

    /// Replace the content, then put the old modification time back
    pub fn rewrite_keeping_mtime(&self, content: &str) {
        let modified = std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .expect("schema mtime");
        self.rewrite(content);
        std::fs::File::options()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(modified))
            .expect("restore schema mtime");
    }
}

/// Cache settings with a short build budget for timeout tests
pub fn cache_config_with_timeout(timeout_ms: u64) -> CacheConfig {
    CacheConfig {
        build_timeout_ms: timeout_ms,
        ..CacheConfig::default()
    }
}

/// Cache settings whose remote tier lives in `dir`
pub fn cacache_config(dir: &Path) -> CacheConfig {
    CacheConfig {
        distributed: DistributedConfig {
            enabled: true,
            directory: dir.to_path_buf(),
            ..DistributedConfig::default()
        },
        ..CacheConfig::default()
    }
}

/// Install a test subscriber honoring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
