//! Command implementations

mod collection;
mod index;
mod memory;
mod multisearch;
mod search;
mod status;

use llm_semantic::error::SemanticError;

use super::{App, Commands};

pub(crate) fn execute(app: &App, command: Commands) -> Result<(), SemanticError> {
    match command {
        Commands::Index {
            path,
            includes,
            excludes,
            force,
            no_ignore,
        } => index::cmd_index(app, path, includes, excludes, force, no_ignore, false),
        Commands::IndexUpdate {
            path,
            includes,
            excludes,
            no_ignore,
        } => index::cmd_index(app, path, includes, excludes, false, no_ignore, true),
        Commands::IndexStatus => status::cmd_status(app),
        Commands::Search {
            query,
            top,
            threshold,
            chunk_type,
            path,
            hybrid,
            fusion_k,
            fusion_alpha,
            recency_boost,
            recency_factor,
            recency_decay,
            profiles,
        } => search::cmd_search(
            app,
            &query,
            search::SearchFlags {
                top,
                threshold,
                chunk_type,
                path,
                hybrid,
                fusion_k,
                fusion_alpha,
                recency_boost,
                recency_factor,
                recency_decay,
                profiles,
            },
        ),
        Commands::Multisearch {
            queries,
            top,
            threshold,
            profiles,
            no_boost,
            no_dedupe,
            output,
        } => multisearch::cmd_multisearch(
            app, queries, top, threshold, profiles, no_boost, no_dedupe, &output,
        ),
        Commands::Memory { command } => memory::cmd_memory(app, command),
        Commands::Collection { command } => collection::cmd_collection(app, command),
        Commands::Completions { .. } => unreachable!("handled before context setup"),
    }
}
