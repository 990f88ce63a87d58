//! `collection` subcommands

use std::io::Write;

use serde_json::json;

use llm_semantic::chunker::Domain;
use llm_semantic::error::{ErrorKind, SemanticError};

use crate::cli::{App, CollectionCommands};

pub(crate) fn cmd_collection(app: &App, command: CollectionCommands) -> Result<(), SemanticError> {
    match command {
        CollectionCommands::Delete { profile, force } => {
            let domain: Domain = profile.parse().map_err(|e: String| {
                SemanticError::invalid_input(e)
                    .with_hint("Available profiles: code, docs, memory, sprints")
            })?;

            if !force && !app.json && !confirm(&format!("Delete every '{}' chunk?", domain)) {
                println!("Aborted.");
                return Ok(());
            }

            let storage = app.open_storage(domain)?;
            let removed = storage
                .delete_domain(domain)
                .map_err(|e| SemanticError::new(ErrorKind::StorageOpen, e.to_string()))?;

            if app.json {
                println!("{}", json!({"profile": domain.to_string(), "chunks_removed": removed}));
            } else {
                println!("Removed {} chunks from profile '{}'", removed, domain);
            }
            Ok(())
        }
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
