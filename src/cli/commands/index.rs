//! `index` and `index-update`

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};

use llm_semantic::error::SemanticError;
use llm_semantic::indexer::{IndexOptions, Indexer};

use crate::cli::{check_interrupted, display, setup_signal_handler, App};

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_index(
    app: &App,
    path: Option<PathBuf>,
    includes: Vec<String>,
    excludes: Vec<String>,
    force: bool,
    no_ignore: bool,
    update: bool,
) -> Result<(), SemanticError> {
    setup_signal_handler();

    let root = path.unwrap_or_else(|| PathBuf::from("."));
    let root = dunce::canonicalize(&root).unwrap_or(root);

    let storage = app.open_storage(app.profile)?;
    let embedder = app.make_embedder()?;
    app.check_dimensions(storage.as_ref(), &embedder)?;

    let opts = IndexOptions {
        includes,
        excludes,
        force,
        no_gitignore: no_ignore,
        verbose: app.verbose,
    };

    let progress = if app.json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    };

    let indexer = Indexer::new(storage.as_ref(), &embedder, app.profile);
    let on_progress = |event: &llm_semantic::indexer::IndexProgress| {
        progress.set_length(event.total as u64);
        progress.set_position(event.current as u64);
        progress.set_message(format!("chunks: {}", event.chunks_total));
    };

    let report = if update {
        indexer.update(&root, &opts, on_progress, check_interrupted)?
    } else {
        indexer.index(&root, &opts, on_progress, check_interrupted)?
    };
    progress.finish_and_clear();

    display::print_index_report(&report, app.json);
    Ok(())
}
