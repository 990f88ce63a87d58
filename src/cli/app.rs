//! Shared command context
//!
//! Resolves the config file, profile, storage backend, and embedder from the
//! global flags, env vars, and config values (in that precedence), and hands
//! opened handles to the command implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use llm_semantic::chunker::Domain;
use llm_semantic::config::{
    self, resolve_collection, resolve_storage, CollectionSource, SemanticConfig, StorageKind,
};
use llm_semantic::embedder::{Embedder, EmbedderKind, EmbedderOptions, TextEmbedder};
use llm_semantic::error::{ErrorKind, SemanticError};
use llm_semantic::storage::{QdrantStore, SqliteStore, Storage};

use super::Cli;

pub struct App {
    pub config: SemanticConfig,
    pub index_dir: PathBuf,
    pub profile: Domain,
    pub json: bool,
    pub min: bool,
    pub verbose: bool,
    storage_flag: Option<String>,
    collection_flag: Option<String>,
    embedder_kind: EmbedderKind,
    embedder_opts: EmbedderOptions,
    /// One handle per backend kind; SQLite profiles share a database
    stores: std::sync::Mutex<HashMap<StorageKind, Arc<dyn Storage>>>,
}

impl App {
    pub fn new(cli: &Cli) -> Result<Self, SemanticError> {
        let config = SemanticConfig::discover(cli.config.as_deref(), &cli.index_dir)?;

        if config.enabled == Some(false) {
            return Err(SemanticError::configuration(
                "semantic search is disabled in the config",
            )
            .with_hint("Set 'enabled: true' under the semantic: section"));
        }

        let profile: Domain = cli
            .profile
            .parse()
            .map_err(|e: String| SemanticError::invalid_input(e))?;

        let embedder_kind: EmbedderKind = cli.embedder.parse()?;
        let embedder_opts = EmbedderOptions {
            api_url: cli.api_url.clone(),
            model: cli.model.clone(),
            api_key: cli.api_key.clone(),
            ..Default::default()
        };

        Ok(Self {
            config,
            index_dir: cli.index_dir.clone(),
            profile,
            json: cli.json || cli.min,
            min: cli.min,
            verbose: cli.verbose,
            storage_flag: cli.storage.clone(),
            collection_flag: cli.collection.clone(),
            embedder_kind,
            embedder_opts,
            stores: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn make_embedder(&self) -> Result<Embedder, SemanticError> {
        Embedder::new(self.embedder_kind, self.embedder_opts.clone())
    }

    /// The profiles a search should consult: `--profiles` when given,
    /// otherwise the single `--profile`, minus any disabled in config.
    pub fn resolve_profiles(&self, named: &[String]) -> Result<Vec<Domain>, SemanticError> {
        let mut domains: Vec<Domain> = if named.is_empty() {
            vec![self.profile]
        } else {
            named
                .iter()
                .map(|s| s.parse::<Domain>())
                .collect::<Result<_, _>>()
                .map_err(|e: String| {
                    SemanticError::invalid_input(e)
                        .with_hint("Available profiles: code, docs, memory, sprints")
                })?
        };
        domains.retain(|&d| self.config.profile_enabled(d));
        if domains.is_empty() {
            return Err(SemanticError::configuration(
                "every requested profile is disabled in the config",
            ));
        }
        Ok(domains)
    }

    /// Open (or reuse) the storage backend for a profile.
    pub fn open_storage(&self, domain: Domain) -> Result<Arc<dyn Storage>, SemanticError> {
        let kind = resolve_storage(self.storage_flag.as_deref(), &self.config, domain)?;
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(store) = stores.get(&kind) {
            return Ok(Arc::clone(store));
        }

        let store: Arc<dyn Storage> = match kind {
            StorageKind::Sqlite => {
                let path = config::database_path(&self.index_dir);
                Arc::new(SqliteStore::open(&path, None).map_err(|e| {
                    SemanticError::new(ErrorKind::StorageOpen, e.to_string())
                        .with_hint("Check the --index-dir path and file permissions")
                })?)
            }
            StorageKind::Qdrant => {
                let url = std::env::var("QDRANT_API_URL")
                    .ok()
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| "http://localhost:6333".to_string());
                let api_key = std::env::var("QDRANT_API_KEY").ok().filter(|v| !v.is_empty());
                let (base, collections) = self.qdrant_collections();
                Arc::new(
                    QdrantStore::new(&url, api_key, &base, collections, None).map_err(|e| {
                        SemanticError::new(ErrorKind::StorageOpen, e.to_string())
                            .with_hint("Check QDRANT_API_URL and that the server is reachable")
                    })?,
                )
            }
        };
        stores.insert(kind, Arc::clone(&store));
        Ok(store)
    }

    /// The resolved collection name for a profile (all five precedence
    /// levels applied).
    pub fn collection_for(&self, domain: Domain) -> config::ResolvedCollection {
        let env = std::env::var("QDRANT_COLLECTION").ok();
        resolve_collection(
            self.collection_flag.as_deref(),
            &self.config,
            domain,
            &self.index_dir.to_string_lossy().replace('\\', "/"),
            env.as_deref(),
        )
    }

    /// Qdrant needs a collection per profile: explicit and profile-config
    /// names are used verbatim, shared names get a profile suffix.
    fn qdrant_collections(&self) -> (String, HashMap<Domain, String>) {
        let base = self.collection_for(self.profile).name;
        let collections = Domain::ALL
            .iter()
            .map(|&domain| {
                let resolved = self.collection_for(domain);
                let name = match resolved.source {
                    CollectionSource::Flag | CollectionSource::ProfileConfig => resolved.name,
                    _ => format!("{}_{}", resolved.name, domain),
                };
                (domain, name)
            })
            .collect();
        (base, collections)
    }

    /// Fail closed when the store's stamped dimension disagrees with the
    /// embedder's probed dimension.
    pub fn check_dimensions(
        &self,
        store: &dyn Storage,
        embedder: &dyn TextEmbedder,
    ) -> Result<(), SemanticError> {
        let stored = store
            .vector_dim()
            .map_err(|e| SemanticError::new(ErrorKind::StorageOpen, e.to_string()))?;
        let Some(stored) = stored else {
            return Ok(()); // nothing indexed yet
        };
        let probed = embedder.probe().map_err(SemanticError::from)?;
        if stored != probed {
            return Err(SemanticError::new(
                ErrorKind::StorageOpen,
                format!(
                    "index stores {}-dim vectors but embedder '{}' produces {}-dim",
                    stored,
                    embedder.model(),
                    probed
                ),
            )
            .with_hint("Re-index with --force, or switch back to the original embedding model"));
        }
        Ok(())
    }
}
