//! Configuration file support and profile resolution
//!
//! Config is YAML with a top-level `semantic:` section:
//!
//! ```yaml
//! semantic:
//!   max_results: 10
//!   min_score: 0.25
//!   stale_days: 14
//!   auto_update: false
//!   enabled: true
//!   multi_query_boost: 0.05
//!   code_collection: my_code
//!   code_storage: sqlite
//!   docs_enabled: true
//! ```
//!
//! CLI flags override env vars, which override config values, which override
//! built-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::chunker::Domain;
use crate::error::{ErrorKind, SemanticError};

/// Default index directory name (also the rejection sentinel for
/// collection-name derivation).
pub const DEFAULT_INDEX_DIR: &str = ".llm-index";
/// Default collection name when every other resolution level is empty.
pub const DEFAULT_COLLECTION: &str = "llm_semantic";

const CONFIG_EXAMPLE: &str = "semantic:\n  max_results: 10\n  min_score: 0.25";

/// The `semantic:` section of the config file.
///
/// Per-profile keys (`code_collection`, `docs_storage`, `sprints_enabled`, ...)
/// land in `extra` and are read through the accessor methods, so new profiles
/// don't require struct changes.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Default result limit (overridden by --top)
    pub max_results: Option<usize>,
    /// Default similarity threshold (overridden by --threshold)
    pub min_score: Option<f32>,
    /// Days before the index is considered stale
    pub stale_days: Option<u32>,
    /// Run an incremental update before searching when stale
    pub auto_update: Option<bool>,
    /// Master enable switch
    pub enabled: Option<bool>,
    /// Score added per extra matching query in multisearch
    pub multi_query_boost: Option<f32>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    semantic: Option<SemanticConfig>,
}

impl SemanticConfig {
    pub const DEFAULT_MAX_RESULTS: usize = 10;
    pub const DEFAULT_MIN_SCORE: f32 = 0.25;
    pub const DEFAULT_MULTI_QUERY_BOOST: f32 = 0.05;

    /// Load from an explicit path. Errors if the file is missing, unreadable,
    /// invalid YAML, or lacks a `semantic:` section.
    pub fn load(path: &Path) -> Result<Self, SemanticError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SemanticError::not_found(format!("config file not found: {}", path.display()))
            } else {
                SemanticError::new(
                    ErrorKind::Configuration,
                    format!("failed to read config {}: {}", path.display(), e),
                )
                .with_hint("Check file permissions on the config file")
            }
        })?;

        if content.trim().is_empty() {
            return Err(SemanticError::configuration(format!(
                "config file {} is empty",
                path.display()
            ))
            .with_hint(format!("Minimal config:\n{}", CONFIG_EXAMPLE)));
        }

        let file: ConfigFile = serde_yaml::from_str(&content).map_err(|e| {
            SemanticError::configuration(format!("invalid YAML in {}: {}", path.display(), e))
        })?;

        file.semantic.ok_or_else(|| {
            SemanticError::configuration(format!(
                "config file {} has no 'semantic:' section",
                path.display()
            ))
            .with_hint(format!("Minimal config:\n{}", CONFIG_EXAMPLE))
        })
    }

    /// Load from the first config file found, or defaults if none exists.
    ///
    /// Search order: `--config` path (must exist), `{index_dir}/config.yaml`,
    /// `~/.config/llm-semantic/config.yaml`.
    pub fn discover(explicit: Option<&Path>, index_dir: &Path) -> Result<Self, SemanticError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidates = [
            Some(index_dir.join("config.yaml")),
            dirs::config_dir().map(|d| d.join("llm-semantic/config.yaml")),
        ];
        for candidate in candidates.into_iter().flatten() {
            if candidate.is_file() {
                match Self::load(&candidate) {
                    Ok(cfg) => {
                        tracing::debug!(path = %candidate.display(), "Loaded config");
                        return Ok(cfg);
                    }
                    Err(e) => {
                        tracing::warn!(path = %candidate.display(), error = %e, "Ignoring unusable config");
                    }
                }
            }
        }
        Ok(Self::default())
    }

    fn extra_str(&self, key: &str) -> Option<String> {
        self.extra
            .get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    /// Profile-specific collection name (`{profile}_collection`).
    pub fn profile_collection(&self, domain: Domain) -> Option<String> {
        self.extra_str(&format!("{}_collection", domain))
    }

    /// Profile-specific storage backend (`{profile}_storage`).
    pub fn profile_storage(&self, domain: Domain) -> Option<String> {
        self.extra_str(&format!("{}_storage", domain))
    }

    /// Profile-specific enable switch (`{profile}_enabled`), default true.
    pub fn profile_enabled(&self, domain: Domain) -> bool {
        self.extra
            .get(&format!("{}_enabled", domain))
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn max_results_or_default(&self) -> usize {
        self.max_results.unwrap_or(Self::DEFAULT_MAX_RESULTS)
    }

    pub fn min_score_or_default(&self) -> f32 {
        self.min_score.unwrap_or(Self::DEFAULT_MIN_SCORE)
    }

    pub fn multi_query_boost_or_default(&self) -> f32 {
        self.multi_query_boost
            .unwrap_or(Self::DEFAULT_MULTI_QUERY_BOOST)
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Sqlite,
    Qdrant,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Sqlite => f.write_str("sqlite"),
            StorageKind::Qdrant => f.write_str("qdrant"),
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = SemanticError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageKind::Sqlite),
            "qdrant" => Ok(StorageKind::Qdrant),
            other => Err(SemanticError::invalid_input(format!(
                "unknown storage backend: '{}'",
                other
            ))
            .with_hint("Available backends: sqlite, qdrant")),
        }
    }
}

/// Where a resolved collection name came from (highest-precedence match).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionSource {
    Flag,
    ProfileConfig,
    IndexDir,
    Env,
    Default,
}

/// A resolved collection name with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCollection {
    pub name: String,
    pub source: CollectionSource,
}

/// Derive a collection name from the index directory.
///
/// Takes the last path segment, replaces `-` and `.` with `_`, drops any
/// other character outside `[A-Za-z0-9_]`, and prefixes `idx_` when the
/// result starts with a digit. Returns an empty string when the segment is
/// the default index dir (`.llm-index` / `llm-index`) or reduces to nothing.
pub fn sanitize_index_collection(index_dir: &str) -> String {
    let segment = Path::new(index_dir)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    if segment.is_empty() || segment == DEFAULT_INDEX_DIR || segment == "llm-index" {
        return String::new();
    }

    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '-' | '.' => out.push('_'),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            _ => {}
        }
    }
    // A name that is nothing but separators is no name at all
    if out.chars().all(|c| c == '_') {
        return String::new();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "idx_");
    }
    out
}

/// Resolve the collection name for a profile.
///
/// Precedence, highest first:
/// 1. explicit `--collection` value
/// 2. profile-specific config (`{profile}_collection`)
/// 3. derivation from a non-default index dir
/// 4. `QDRANT_COLLECTION` env var
/// 5. `llm_semantic`
pub fn resolve_collection(
    explicit: Option<&str>,
    config: &SemanticConfig,
    domain: Domain,
    index_dir: &str,
    env_collection: Option<&str>,
) -> ResolvedCollection {
    if let Some(name) = explicit.filter(|s| !s.is_empty()) {
        return ResolvedCollection {
            name: name.to_string(),
            source: CollectionSource::Flag,
        };
    }
    if let Some(name) = config.profile_collection(domain).filter(|s| !s.is_empty()) {
        return ResolvedCollection {
            name,
            source: CollectionSource::ProfileConfig,
        };
    }
    if index_dir != DEFAULT_INDEX_DIR {
        let derived = sanitize_index_collection(index_dir);
        if !derived.is_empty() {
            return ResolvedCollection {
                name: derived,
                source: CollectionSource::IndexDir,
            };
        }
    }
    if let Some(name) = env_collection.filter(|s| !s.is_empty()) {
        return ResolvedCollection {
            name: name.to_string(),
            source: CollectionSource::Env,
        };
    }
    ResolvedCollection {
        name: DEFAULT_COLLECTION.to_string(),
        source: CollectionSource::Default,
    }
}

/// Resolve the storage backend for a profile: flag > profile config > sqlite.
pub fn resolve_storage(
    explicit: Option<&str>,
    config: &SemanticConfig,
    domain: Domain,
) -> Result<StorageKind, SemanticError> {
    if let Some(s) = explicit.filter(|s| !s.is_empty()) {
        return s.parse();
    }
    if let Some(s) = config.profile_storage(domain) {
        return s.parse();
    }
    Ok(StorageKind::Sqlite)
}

/// Default database path inside the index directory.
pub fn database_path(index_dir: &Path) -> PathBuf {
    index_dir.join("semantic.db")
}
