use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid parser option: {0}")]
    ParserOption(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings that shape a built tree
///
/// Two configs that differ in any field produce different trees, so the whole
/// value participates in every cache key through [`ParserConfig::cache_key`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct ParserConfig {
    /// Number of ancestor types inlined into a derived type
    pub max_extension_depth: usize,
    /// Maximum element nesting depth below the root
    pub max_recursion_depth: usize,
    /// Record chain truncation and cycle notes on nodes
    pub track_extension_metadata: bool,
    /// Look up the declaration behind `ref="extension"` before marking it
    pub resolve_extension_refs: bool,
    /// Memoize element-reference lookups within a build
    pub cache_resolved_refs: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_extension_depth: 3,
            max_recursion_depth: 10,
            track_extension_metadata: true,
            resolve_extension_refs: false,
            cache_resolved_refs: true,
        }
    }
}

impl ParserConfig {
    /// Stable key fragment, identical across processes for equal configs
    pub fn cache_key(&self) -> String {
        format!(
            "ext{}-rec{}-meta{}-refs{}-memo{}",
            self.max_extension_depth,
            self.max_recursion_depth,
            u8::from(self.track_extension_metadata),
            u8::from(self.resolve_extension_refs),
            u8::from(self.cache_resolved_refs),
        )
    }
}

/// Parses the compact `key=value,key=value` form used by request overrides.
///
/// Unknown keys are rejected; keys not mentioned keep their defaults.
impl FromStr for ParserConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let mut config = ParserConfig::default();

        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::ParserOption(format!("expected key=value: {}", pair)))?;
            let (key, value) = (key.trim(), value.trim());
            let invalid = || ConfigError::ParserOption(format!("{} = {}", key, value));

            match key {
                "max_extension_depth" => {
                    config.max_extension_depth = value.parse().map_err(|_| invalid())?
                }
                "max_recursion_depth" => {
                    config.max_recursion_depth = value.parse().map_err(|_| invalid())?
                }
                "track_extension_metadata" => {
                    config.track_extension_metadata = parse_flag(value).ok_or_else(invalid)?
                }
                "resolve_extension_refs" => {
                    config.resolve_extension_refs = parse_flag(value).ok_or_else(invalid)?
                }
                "cache_resolved_refs" => {
                    config.cache_resolved_refs = parse_flag(value).ok_or_else(invalid)?
                }
                other => {
                    return Err(ConfigError::ParserOption(format!("unknown key: {}", other)));
                }
            }
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub parser: ParserConfig,
    pub cache: CacheConfig,
}

/// Cache tier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live for every cached tree in seconds
    pub ttl_seconds: u64,
    /// Maximum number of entries in the local tier
    pub max_memory_entries: u64,
    /// Budget for a single build in milliseconds
    pub build_timeout_ms: u64,
    pub distributed: DistributedConfig,
}

/// Remote tier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistributedConfig {
    pub enabled: bool,
    /// Directory of the shared on-disk store
    pub directory: PathBuf,
    /// Namespace prepended to every remote key
    pub key_prefix: String,
    /// Entries kept in the in-process mirror of the remote tier
    pub mirror_capacity: u64,
    /// Seconds to stay on the mirror after a remote failure
    pub retry_after_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_memory_entries: 1000,
            build_timeout_ms: 30_000,
            distributed: DistributedConfig::default(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("xsd-tree"),
            key_prefix: "xsd-tree:".to_string(),
            mirror_capacity: 256,
            retry_after_seconds: 30,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

impl DistributedConfig {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_seconds)
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment
    pub async fn load_config(path: Option<&Path>) -> Result<Config> {
        Self::load_config_with(&SystemEnvProvider, path).await
    }

    /// Load configuration using a custom environment provider
    pub async fn load_config_with(env: &impl EnvProvider, path: Option<&Path>) -> Result<Config> {
        let config = match path {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::find_config_file().await?.unwrap_or_default(),
        };

        let config = Self::apply_environment_overrides_with(env, config)?;
        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "xsd-tree.toml",
            "xsd-tree.json",
            ".xsd-tree.toml",
            ".xsd-tree.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("xsd-tree");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        fn parsed<T: FromStr>(env: &impl EnvProvider, key: &str) -> Result<Option<T>> {
            match env.get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, raw))),
                None => Ok(None),
            }
        }

        fn flag(env: &impl EnvProvider, key: &str) -> Result<Option<bool>> {
            match env.get(key) {
                Some(raw) => parse_flag(raw.trim())
                    .map(Some)
                    .ok_or_else(|| ConfigError::Environment(format!("Invalid {} value: {}", key, raw))),
                None => Ok(None),
            }
        }

        // Parser settings
        if let Some(depth) = parsed(env, "XSD_TREE_MAX_EXTENSION_DEPTH")? {
            config.parser.max_extension_depth = depth;
        }
        if let Some(depth) = parsed(env, "XSD_TREE_MAX_RECURSION_DEPTH")? {
            config.parser.max_recursion_depth = depth;
        }
        if let Some(track) = flag(env, "XSD_TREE_TRACK_EXTENSION_METADATA")? {
            config.parser.track_extension_metadata = track;
        }
        if let Some(resolve) = flag(env, "XSD_TREE_RESOLVE_EXTENSION_REFS")? {
            config.parser.resolve_extension_refs = resolve;
        }
        if let Some(memo) = flag(env, "XSD_TREE_CACHE_RESOLVED_REFS")? {
            config.parser.cache_resolved_refs = memo;
        }

        // Cache settings
        if let Some(cache_type) = env.get("XSD_TREE_CACHE_TYPE") {
            config.cache.distributed.enabled = match cache_type.to_lowercase().as_str() {
                "local" | "memory" => false,
                "distributed" | "remote" => true,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid XSD_TREE_CACHE_TYPE value: {}",
                        cache_type
                    )));
                }
            };
        }
        if let Some(ttl) = parsed(env, "XSD_TREE_CACHE_TTL")? {
            config.cache.ttl_seconds = ttl;
        }
        if let Some(entries) = parsed(env, "XSD_TREE_MAX_MEMORY_ENTRIES")? {
            config.cache.max_memory_entries = entries;
        }
        if let Some(timeout) = parsed(env, "XSD_TREE_BUILD_TIMEOUT_MS")? {
            config.cache.build_timeout_ms = timeout;
        }
        if let Some(dir) = env.get("XSD_TREE_CACHE_DIR") {
            config.cache.distributed.directory = PathBuf::from(dir);
        }
        if let Some(prefix) = env.get("XSD_TREE_CACHE_PREFIX") {
            config.cache.distributed.key_prefix = prefix;
        }

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if config.parser.max_extension_depth > 20 {
            return Err(ConfigError::Validation(
                "Max extension depth cannot exceed 20".to_string(),
            ));
        }

        if !(1..=50).contains(&config.parser.max_recursion_depth) {
            return Err(ConfigError::Validation(
                "Max recursion depth must be between 1 and 50".to_string(),
            ));
        }

        if config.cache.ttl_seconds == 0 {
            return Err(ConfigError::Validation(
                "Cache TTL must be greater than 0".to_string(),
            ));
        }

        if config.cache.max_memory_entries == 0 {
            return Err(ConfigError::Validation(
                "Cache max memory entries must be greater than 0".to_string(),
            ));
        }

        if config.cache.build_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Build timeout must be greater than 0".to_string(),
            ));
        }

        let distributed = &config.cache.distributed;
        if distributed.enabled {
            if distributed.key_prefix.is_empty() {
                return Err(ConfigError::Validation(
                    "Distributed cache key prefix cannot be empty".to_string(),
                ));
            }
            if distributed.mirror_capacity == 0 {
                return Err(ConfigError::Validation(
                    "Distributed cache mirror capacity must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    /// Mock environment variable provider for testing
    #[derive(Default)]
    struct MockEnvProvider {
        vars: HashMap<String, String>,
    }

    impl MockEnvProvider {
        fn new() -> Self {
            Self {
                vars: HashMap::new(),
            }
        }

        fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
            self.vars.insert(key.into(), value.into());
        }
    }

    impl EnvProvider for MockEnvProvider {
        fn get(&self, key: &str) -> Option<String> {
            self.vars.get(key).cloned()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.parser.max_extension_depth, 3);
        assert_eq!(config.parser.max_recursion_depth, 10);
        assert!(config.parser.track_extension_metadata);
        assert!(!config.parser.resolve_extension_refs);
        assert!(config.parser.cache_resolved_refs);

        assert_eq!(config.cache.ttl_seconds, 3600);
        assert_eq!(config.cache.max_memory_entries, 1000);
        assert_eq!(config.cache.build_timeout_ms, 30_000);
        assert!(!config.cache.distributed.enabled);
        assert_eq!(config.cache.distributed.key_prefix, "xsd-tree:");
        assert!(
            config
                .cache
                .distributed
                .directory
                .to_string_lossy()
                .contains("xsd-tree")
        );
    }

    #[test]
    fn test_cache_key_distinguishes_configs() {
        let default = ParserConfig::default();
        assert_eq!(default.cache_key(), "ext3-rec10-meta1-refs0-memo1");

        let shallow = ParserConfig {
            max_extension_depth: 1,
            ..ParserConfig::default()
        };
        assert_ne!(default.cache_key(), shallow.cache_key());

        let untracked = ParserConfig {
            track_extension_metadata: false,
            ..ParserConfig::default()
        };
        assert_ne!(default.cache_key(), untracked.cache_key());
    }

    #[test]
    fn test_parser_config_from_str() {
        let config: ParserConfig = "max_extension_depth=2, track_extension_metadata=false"
            .parse()
            .unwrap();
        assert_eq!(config.max_extension_depth, 2);
        assert!(!config.track_extension_metadata);
        assert_eq!(config.max_recursion_depth, 10);

        let empty: ParserConfig = "".parse().unwrap();
        assert_eq!(empty, ParserConfig::default());

        assert!(matches!(
            "max_extension_depth".parse::<ParserConfig>(),
            Err(ConfigError::ParserOption(_))
        ));
        assert!(matches!(
            "max_extension_depth=deep".parse::<ParserConfig>(),
            Err(ConfigError::ParserOption(_))
        ));
        assert!(matches!(
            "colour=blue".parse::<ParserConfig>(),
            Err(ConfigError::ParserOption(_))
        ));
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let toml_content = r#"
[parser]
max_extension_depth = 5
max_recursion_depth = 12
resolve_extension_refs = true

[cache]
ttl_seconds = 600
build_timeout_ms = 5000

[cache.distributed]
enabled = true
directory = "/tmp/xsd-tree-cache"
key_prefix = "staging:"
"#;
        fs::write(&config_path, toml_content).unwrap();

        let config = ConfigManager::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.parser.max_extension_depth, 5);
        assert_eq!(config.parser.max_recursion_depth, 12);
        assert!(config.parser.resolve_extension_refs);
        assert!(config.parser.track_extension_metadata);
        assert_eq!(config.cache.ttl_seconds, 600);
        assert_eq!(config.cache.max_memory_entries, 1000);
        assert_eq!(config.cache.build_timeout_ms, 5000);
        assert!(config.cache.distributed.enabled);
        assert_eq!(
            config.cache.distributed.directory,
            PathBuf::from("/tmp/xsd-tree-cache")
        );
        assert_eq!(config.cache.distributed.key_prefix, "staging:");
        assert_eq!(config.cache.distributed.mirror_capacity, 256);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let json_content = r#"{
            "parser": { "max_extension_depth": 1, "cache_resolved_refs": false },
            "cache": { "ttl_seconds": 120 }
        }"#;
        fs::write(&config_path, json_content).unwrap();

        let config = ConfigManager::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.parser.max_extension_depth, 1);
        assert!(!config.parser.cache_resolved_refs);
        assert_eq!(config.cache.ttl_seconds, 120);
        assert!(!config.cache.distributed.enabled);
    }

    #[tokio::test]
    async fn test_unsupported_file_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        fs::write(&config_path, "invalid: yaml").unwrap();

        let result = ConfigManager::load_from_file(&config_path).await;
        match result.unwrap_err() {
            ConfigError::UnsupportedFormat(ext) => assert_eq!(ext, "yaml"),
            _ => panic!("Expected UnsupportedFormat error"),
        }
    }

    #[tokio::test]
    async fn test_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid toml [[[").unwrap();

        let result = ConfigManager::load_from_file(&config_path).await;
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParsing(_)));
    }

    #[test]
    fn test_environment_overrides() {
        let mut mock_env = MockEnvProvider::new();
        mock_env.set("XSD_TREE_MAX_EXTENSION_DEPTH", "4");
        mock_env.set("XSD_TREE_MAX_RECURSION_DEPTH", "8");
        mock_env.set("XSD_TREE_TRACK_EXTENSION_METADATA", "false");
        mock_env.set("XSD_TREE_CACHE_TYPE", "distributed");
        mock_env.set("XSD_TREE_CACHE_TTL", "90");
        mock_env.set("XSD_TREE_CACHE_DIR", "/env/cache");
        mock_env.set("XSD_TREE_CACHE_PREFIX", "blue:");
        mock_env.set("XSD_TREE_BUILD_TIMEOUT_MS", "1500");

        let config =
            ConfigManager::apply_environment_overrides_with(&mock_env, Config::default()).unwrap();

        assert_eq!(config.parser.max_extension_depth, 4);
        assert_eq!(config.parser.max_recursion_depth, 8);
        assert!(!config.parser.track_extension_metadata);
        assert!(config.cache.distributed.enabled);
        assert_eq!(config.cache.ttl_seconds, 90);
        assert_eq!(config.cache.distributed.directory, PathBuf::from("/env/cache"));
        assert_eq!(config.cache.distributed.key_prefix, "blue:");
        assert_eq!(config.cache.build_timeout_ms, 1500);
    }

    #[test]
    fn test_invalid_environment_values() {
        let mut mock_env = MockEnvProvider::new();
        mock_env.set("XSD_TREE_MAX_RECURSION_DEPTH", "invalid");

        let result = ConfigManager::apply_environment_overrides_with(&mock_env, Config::default());
        assert!(matches!(result.unwrap_err(), ConfigError::Environment(_)));

        let mut mock_env = MockEnvProvider::new();
        mock_env.set("XSD_TREE_CACHE_TYPE", "memcached");

        let result = ConfigManager::apply_environment_overrides_with(&mock_env, Config::default());
        assert!(matches!(result.unwrap_err(), ConfigError::Environment(_)));
    }

    #[test]
    fn test_config_validation() {
        assert!(ConfigManager::validate_config(&Config::default()).is_ok());

        let mut config = Config::default();
        config.parser.max_extension_depth = 21;
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.parser.max_recursion_depth = 0;
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.cache.ttl_seconds = 0;
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.cache.build_timeout_ms = 0;
        assert!(ConfigManager::validate_config(&config).is_err());

        let mut config = Config::default();
        config.cache.distributed.key_prefix.clear();
        assert!(ConfigManager::validate_config(&config).is_ok());
        config.cache.distributed.enabled = true;
        assert!(ConfigManager::validate_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_load_config_integration() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("xsd-tree.toml");
        fs::write(
            &config_path,
            "[parser]\nmax_extension_depth = 2\n\n[cache]\nttl_seconds = 300\n",
        )
        .unwrap();

        let mut mock_env = MockEnvProvider::new();
        mock_env.set("XSD_TREE_CACHE_TTL", "60");

        let config = ConfigManager::load_config_with(&mock_env, Some(&config_path))
            .await
            .unwrap();

        assert_eq!(config.parser.max_extension_depth, 2);
        // Environment wins over the file
        assert_eq!(config.cache.ttl_seconds, 60);

        let mut bad_env = MockEnvProvider::new();
        bad_env.set("XSD_TREE_MAX_RECURSION_DEPTH", "99");
        let result = ConfigManager::load_config_with(&bad_env, Some(&config_path)).await;
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }
}
