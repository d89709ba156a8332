use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, SchemaTreeError};
use crate::extension::ExtensionIndex;
use crate::type_system::TypeSystem;

/// SHA-256 of schema content, hex encoded
pub fn content_fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Where a schema document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSource {
    File {
        path: PathBuf,
        root: Option<String>,
    },
    Inline {
        name: String,
        content: Arc<str>,
        root: Option<String>,
    },
}

impl SchemaSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SchemaSource::File {
            path: path.into(),
            root: None,
        }
    }

    pub fn inline(name: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        SchemaSource::Inline {
            name: name.into(),
            content: content.into(),
            root: None,
        }
    }

    /// Select the top-level element the tree is built under
    pub fn with_root(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            SchemaSource::File { root, .. } | SchemaSource::Inline { root, .. } => {
                *root = Some(name.into());
            }
        }
        self
    }

    pub fn root(&self) -> Option<&str> {
        match self {
            SchemaSource::File { root, .. } | SchemaSource::Inline { root, .. } => root.as_deref(),
        }
    }

    /// Stable identity of the document, independent of the chosen root
    pub fn identity(&self) -> String {
        match self {
            SchemaSource::File { path, .. } => {
                let path = std::path::absolute(path).unwrap_or_else(|_| path.clone());
                format!("file:{}", path.display())
            }
            SchemaSource::Inline { name, .. } => format!("inline:{}", name),
        }
    }

    async fn read(&self) -> Result<Arc<str>> {
        match self {
            SchemaSource::File { path, .. } => tokio::fs::read_to_string(path)
                .await
                .map(Arc::from)
                .map_err(|e| unresolvable(self, path, e)),
            SchemaSource::Inline { content, .. } => Ok(content.clone()),
        }
    }
}

fn unresolvable(source: &SchemaSource, path: &Path, err: std::io::Error) -> SchemaTreeError {
    let reason = match err.kind() {
        std::io::ErrorKind::NotFound => format!("schema file not found: {}", path.display()),
        _ => err.to_string(),
    };
    SchemaTreeError::SourceUnresolvable {
        source_id: source.identity(),
        reason,
    }
}

/// One version of a schema document
///
/// Parsing and indexing happen lazily, at most once per version. A changed
/// document gets a new `LoadedSource`; builds still holding the old one keep
/// using its type system and indexes.
#[derive(Debug)]
pub struct LoadedSource {
    identity: String,
    fingerprint: String,
    content: Arc<str>,
    types: OnceLock<Result<Arc<TypeSystem>>>,
    indexes: Mutex<HashMap<usize, Arc<ExtensionIndex>>>,
    parses: Arc<AtomicU64>,
}

impl LoadedSource {
    fn new(
        identity: String,
        content: Arc<str>,
        parses: Arc<AtomicU64>,
    ) -> Self {
        Self {
            fingerprint: content_fingerprint(&content),
            identity,
            content,
            types: OnceLock::new(),
            indexes: Mutex::new(HashMap::new()),
            parses,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Parsed declarations; parse failures are remembered for this version
    pub fn types(&self) -> Result<Arc<TypeSystem>> {
        self.types
            .get_or_init(|| {
                self.parses.fetch_add(1, Ordering::Relaxed);
                TypeSystem::parse(&self.content)
                    .map(Arc::new)
                    .map_err(|e| e.into_unresolvable(&self.identity))
            })
            .clone()
    }

    /// Extension index for one depth limit, built on first request
    pub fn index(&self, max_depth: usize) -> Result<Arc<ExtensionIndex>> {
        let types = self.types()?;
        let mut indexes = self.indexes.lock();
        let index = indexes
            .entry(max_depth)
            .or_insert_with(|| Arc::new(ExtensionIndex::build(&types, max_depth)));
        Ok(index.clone())
    }
}

/// Latest loaded version of every known source
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<LoadedSource>>>,
    parses: Arc<AtomicU64>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of `source`, reloading it when its content changed
    ///
    /// Files are re-read and re-hashed on every call. File metadata is not
    /// trusted as a change signal: a copy that preserves the modification
    /// time and length would otherwise go unnoticed.
    pub async fn load(&self, source: &SchemaSource) -> Result<Arc<LoadedSource>> {
        let identity = source.identity();

        if let SchemaSource::Inline { content, .. } = source
            && let Some(current) = self.sources.read().get(&identity)
            && Arc::ptr_eq(content, &current.content)
        {
            return Ok(current.clone());
        }

        let content = source.read().await?;
        let fingerprint = content_fingerprint(&content);

        let mut sources = self.sources.write();
        if let Some(existing) = sources.get(&identity)
            && existing.fingerprint == fingerprint
        {
            return Ok(existing.clone());
        }

        if let Some(previous) = sources.get(&identity) {
            info!(
                source = %identity,
                previous = %&previous.fingerprint[..12],
                current = %&fingerprint[..12],
                "Schema source changed"
            );
        } else {
            debug!(source = %identity, fingerprint = %&fingerprint[..12], "Schema source loaded");
        }

        let loaded = Arc::new(LoadedSource::new(
            identity.clone(),
            content,
            self.parses.clone(),
        ));
        sources.insert(identity, loaded.clone());
        Ok(loaded)
    }

    /// Drop the loaded version of a source, returning it if present
    pub fn invalidate(&self, identity: &str) -> Option<Arc<LoadedSource>> {
        self.sources.write().remove(identity)
    }

    pub fn get(&self, identity: &str) -> Option<Arc<LoadedSource>> {
        self.sources.read().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// Number of schema documents parsed so far
    pub fn parse_count(&self) -> u64 {
        self.parses.load(Ordering::Relaxed)
    }
}
