//! # xsd-tree Library
//!
//! Builds depth-limited, inheritance-flattened trees from XSD schemas and
//! serves them from a two-tier cache with single-flight rebuilds.
//!
//! ```no_run
//! use xsd_tree::{CacheConfig, LogicalKey, ParserConfig, SchemaResolver, SchemaSource};
//!
//! # async fn run() -> xsd_tree::Result<()> {
//! let resolver = SchemaResolver::new(CacheConfig::default());
//! let source = SchemaSource::file("schemas/HPXMLBaseElements.xsd").with_root("HPXML");
//! let tree = resolver
//!     .resolve(&source, &ParserConfig::default(), &LogicalKey::FullTree)
//!     .await?;
//! println!("{} nodes", tree.node_count());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod distributed;
pub mod error;
pub mod extension;
pub mod flight;
pub mod model;
pub mod resolver;
pub mod source;
pub mod type_system;

pub use builder::{BuildCancel, BuildOutput, EXTENSION_ELEMENT, TreeBuilder};
pub use cache::{CacheEntry, CacheKey, LocalCache, LocalCacheStats, LogicalKey, TreeView};
pub use config::{
    CacheConfig, Config, ConfigError, ConfigManager, DistributedConfig, EnvProvider, ParserConfig,
    SystemEnvProvider,
};
pub use distributed::{
    CacacheStore, DistributedCache, DistributedCacheStats, EntryMetadata, MemoryStore,
    RemoteStore,
};
pub use error::{BuildIssue, CacheError, Result, SchemaTreeError};
pub use extension::{ExtensionChain, ExtensionIndex};
pub use flight::SingleFlight;
pub use model::{MaxOccurs, NodeKind, SchemaNode, notes};
pub use resolver::{DefaultTreeBuild, ResolverBuilder, ResolverStats, SchemaResolver, TreeBuild};
pub use source::{LoadedSource, SchemaSource, SourceRegistry, content_fingerprint};
pub use type_system::TypeSystem;
