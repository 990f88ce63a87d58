//! `memory` subcommands

use serde_json::json;

use llm_semantic::chunker::Domain;
use llm_semantic::error::SemanticError;
use llm_semantic::memory::{MemoryFilter, MemoryStore, RetrievalLogger};
use llm_semantic::storage::MemoryStatus;

use crate::cli::{display, App, MemoryCommands};

pub(crate) fn cmd_memory(app: &App, command: MemoryCommands) -> Result<(), SemanticError> {
    let storage = app.open_storage(Domain::Memory)?;
    let embedder = app.make_embedder()?;
    let memory = MemoryStore::new(storage.as_ref(), &embedder);

    match command {
        MemoryCommands::Store {
            question,
            answer,
            tags,
            source,
        } => {
            let (entry, is_new) = memory.store(&question, &answer, tags, &source)?;
            if app.json {
                println!(
                    "{}",
                    json!({"id": entry.id, "created": is_new, "occurrences": entry.occurrences})
                );
            } else if is_new {
                println!("Stored memory {}", entry.id);
            } else {
                println!("Updated memory {}", entry.id);
            }
            Ok(())
        }
        MemoryCommands::Search {
            query,
            top,
            threshold,
            tags,
            status,
            no_track,
        } => {
            let filter = MemoryFilter {
                tags,
                status: parse_status(status.as_deref())?,
            };
            let logger = if no_track {
                None
            } else {
                Some(RetrievalLogger::spawn(storage.clone()))
            };
            let hits = memory.search(
                &query,
                top,
                threshold.unwrap_or_else(|| app.config.min_score_or_default()),
                &filter,
                logger.as_ref(),
            )?;
            display::print_memory_hits(&hits, app.json, app.min);
            Ok(())
        }
        MemoryCommands::List { status, tag, limit } => {
            let filter = MemoryFilter {
                tags: tag.into_iter().collect(),
                status: parse_status(status.as_deref())?,
            };
            let entries = memory.list(&filter, limit)?;
            display::print_memory_list(&entries, app.json, app.min);
            Ok(())
        }
        MemoryCommands::Get { id } => {
            let entry = memory.get(&id)?;
            if app.json {
                println!("{}", display::memory_to_json(&entry, app.min));
            } else {
                println!("id:       {}", entry.id);
                println!("question: {}", entry.question);
                println!("answer:   {}", entry.answer);
                println!("tags:     {}", entry.tags.join(", "));
                println!("status:   {} ({}x)", entry.status, entry.occurrences);
                for retrieval in memory.history(Some(&entry.id), 5)? {
                    println!(
                        "  retrieved for '{}' (score {:.2})",
                        retrieval.query, retrieval.score
                    );
                }
            }
            Ok(())
        }
        MemoryCommands::Delete { id } => {
            memory.delete(&id)?;
            if app.json {
                println!("{}", json!({"deleted": id}));
            } else {
                println!("Deleted memory {}", id);
            }
            Ok(())
        }
        MemoryCommands::Promote { id, file, section } => {
            memory.promote(&id, &file, &section)?;
            if app.json {
                println!("{}", json!({"promoted": id, "file": file.to_string_lossy()}));
            } else {
                println!("Promoted {} into {} (## {})", id, file.display(), section);
            }
            Ok(())
        }
        MemoryCommands::Import { file } => {
            let (stored, updated) = memory.import(&file)?;
            if app.json {
                println!("{}", json!({"stored": stored, "updated": updated}));
            } else {
                println!("Imported {} new, {} updated", stored, updated);
            }
            Ok(())
        }
        MemoryCommands::Stats => {
            let stats = memory.stats()?;
            if app.json {
                println!(
                    "{}",
                    serde_json::to_value(&stats).unwrap_or_else(|_| json!({"error": true}))
                );
            } else {
                println!(
                    "{} memories ({} pending, {} promoted), {} retrievals logged",
                    stats.total, stats.pending, stats.promoted, stats.retrievals
                );
            }
            Ok(())
        }
        MemoryCommands::PruneLog { older_than } => {
            let removed = memory.prune_log(older_than)?;
            if app.json {
                println!("{}", json!({"removed": removed}));
            } else {
                println!("Removed {} retrieval-log rows", removed);
            }
            Ok(())
        }
    }
}

fn parse_status(status: Option<&str>) -> Result<Option<MemoryStatus>, SemanticError> {
    status
        .map(|s| {
            s.parse::<MemoryStatus>().map_err(|e| {
                SemanticError::invalid_input(e).with_hint("Available statuses: pending, promoted")
            })
        })
        .transpose()
}
