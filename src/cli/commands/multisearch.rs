//! `multisearch`

use llm_semantic::error::SemanticError;
use llm_semantic::search::{MultisearchOptions, OutputMode, SearchOptions, Searcher};
use llm_semantic::storage::Storage;

use crate::cli::{display, App};

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_multisearch(
    app: &App,
    queries: Vec<String>,
    top: usize,
    threshold: Option<f32>,
    profiles: Vec<String>,
    no_boost: bool,
    no_dedupe: bool,
    output: &str,
) -> Result<(), SemanticError> {
    let output: OutputMode = output.parse()?;
    let opts = MultisearchOptions {
        base: SearchOptions {
            top,
            threshold: threshold.unwrap_or_else(|| app.config.min_score_or_default()),
            ..Default::default()
        },
        boost: !no_boost,
        boost_factor: app.config.multi_query_boost_or_default(),
        dedupe: !no_dedupe,
        output,
    };

    let domains = app.resolve_profiles(&profiles)?;
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
    let results = searcher.multisearch(&stores, &queries, &opts)?;
    display::print_multisearch(&results, app.json, app.min);
    Ok(())
}
