//! `search`

use llm_semantic::chunker::ChunkType;
use llm_semantic::error::SemanticError;
use llm_semantic::search::{SearchOptions, Searcher};
use llm_semantic::storage::Storage;

use crate::cli::{display, App};

pub(crate) struct SearchFlags {
    pub top: usize,
    pub threshold: Option<f32>,
    pub chunk_type: Vec<String>,
    pub path: Option<String>,
    pub hybrid: bool,
    pub fusion_k: f32,
    pub fusion_alpha: f32,
    pub recency_boost: bool,
    pub recency_factor: f32,
    pub recency_decay: f32,
    pub profiles: Vec<String>,
}

pub(crate) fn build_options(app: &App, flags: &SearchFlags) -> Result<SearchOptions, SemanticError> {
    let chunk_types = if flags.chunk_type.is_empty() {
        None
    } else {
        Some(
            flags
                .chunk_type
                .iter()
                .map(|s| s.parse::<ChunkType>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    SemanticError::invalid_input(e).with_hint(
                        "Available types: function, method, struct, interface, class, module, section, block, generic",
                    )
                })?,
        )
    };

    let opts = SearchOptions {
        top: flags.top,
        threshold: flags
            .threshold
            .unwrap_or_else(|| app.config.min_score_or_default()),
        chunk_types,
        path_prefix: flags.path.clone(),
        hybrid: flags.hybrid,
        fusion_k: flags.fusion_k,
        fusion_alpha: flags.fusion_alpha,
        recency_boost: flags.recency_boost,
        recency_factor: flags.recency_factor,
        recency_decay_days: flags.recency_decay,
    };
    opts.validate()?;
    Ok(opts)
}

pub(crate) fn cmd_search(app: &App, query: &str, flags: SearchFlags) -> Result<(), SemanticError> {
    let opts = build_options(app, &flags)?;
    let domains = app.resolve_profiles(&flags.profiles)?;

    let embedder = app.make_embedder()?;
    let handles: Vec<_> = domains
        .iter()
        .map(|&d| app.open_storage(d).map(|s| (d, s)))
        .collect::<Result<_, _>>()?;
    for (_, store) in &handles {
        app.check_dimensions(store.as_ref(), &embedder)?;
    }
    let stores: Vec<(_, &dyn Storage)> = handles
        .iter()
        .map(|(d, s)| (*d, s.as_ref() as &dyn Storage))
        .collect();

    let searcher = Searcher::new(&embedder);
    let results = searcher.search_profiles(&stores, query, &opts)?;
    display::print_results(&results, app.json, app.min);
    Ok(())
}
