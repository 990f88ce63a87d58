//! Output rendering: human, JSON, and minimal-JSON modes
//!
//! Human output goes to stdout with light coloring; JSON modes print one
//! document to stdout and nothing else, so callers can pipe the output.

use colored::Colorize;
use serde_json::{json, Value};

use llm_semantic::error::SemanticError;
use llm_semantic::indexer::IndexReport;
use llm_semantic::memory::MemoryHit;
use llm_semantic::search::{MultisearchOutput, RankedResult};
use llm_semantic::storage::MemoryEntry;

pub fn print_error(err: &SemanticError, json: bool, min: bool) {
    if json {
        println!("{}", err.to_json(min));
    } else {
        eprintln!("{} {}", "error:".red().bold(), err.message);
        if let Some(ref hint) = err.hint {
            eprintln!("  {} {}", "hint:".yellow(), hint);
        }
    }
}

pub fn result_to_json(result: &RankedResult, min: bool) -> Value {
    if min {
        let mut v = json!({
            "file": result.chunk.file_path.to_string_lossy(),
            "name": result.chunk.name,
            "line": result.chunk.start_line,
            "score": round3(result.score),
            "r": result.relevance.short(),
            "pr": result.preview,
        });
        if let Some(boosted) = result.boosted_score {
            v["bs"] = json!(round3(boosted));
        }
        if !result.matched_queries.is_empty() {
            v["q"] = json!(result.matched_queries);
        }
        v
    } else {
        let mut v = json!({
            "chunk": {
                "file_path": result.chunk.file_path.to_string_lossy(),
                "name": result.chunk.name,
                "type": result.chunk.chunk_type.to_string(),
                "start_line": result.chunk.start_line,
                "end_line": result.chunk.end_line,
                "signature": result.chunk.signature,
                "domain": result.profile.to_string(),
            },
            "score": round3(result.score),
            "relevance": result.relevance.to_string(),
            "preview": result.preview,
        });
        if let Some(boosted) = result.boosted_score {
            v["boosted_score"] = json!(round3(boosted));
        }
        if !result.matched_queries.is_empty() {
            v["matched_queries"] = json!(result.matched_queries);
        }
        v
    }
}

pub fn print_results(results: &[RankedResult], json: bool, min: bool) {
    if json {
        let items: Vec<Value> = results.iter().map(|r| result_to_json(r, min)).collect();
        println!("{}", Value::Array(items));
        return;
    }

    if results.is_empty() {
        println!("{}", "No results.".dimmed());
        return;
    }

    for (i, result) in results.iter().enumerate() {
        let location = format!(
            "{}:{}",
            result.chunk.file_path.display(),
            result.chunk.start_line
        );
        let score = match result.boosted_score {
            Some(boosted) => format!("{:.2} (boosted {:.2})", result.score, boosted),
            None => format!("{:.2}", result.score),
        };
        println!(
            "{}. {} {} {} [{} {}]",
            i + 1,
            location.cyan(),
            result.chunk.name.bold(),
            format!("({})", result.chunk.chunk_type).dimmed(),
            score,
            relevance_colored(result)
        );
        if !result.matched_queries.is_empty() && result.matched_queries.len() > 1 {
            println!(
                "   {} {}",
                "matched:".dimmed(),
                result.matched_queries.join(", ")
            );
        }
        if !result.preview.is_empty() {
            println!("   {}", result.preview.dimmed());
        }
    }
}

fn relevance_colored(result: &RankedResult) -> colored::ColoredString {
    use llm_semantic::calibration::Relevance;
    match result.relevance {
        Relevance::High => "high".green(),
        Relevance::Medium => "medium".yellow(),
        Relevance::Low => "low".dimmed(),
        Relevance::None => "none".dimmed(),
    }
}

pub fn print_multisearch(output: &MultisearchOutput, json: bool, min: bool) {
    match output {
        MultisearchOutput::Blended(results) => print_results(results, json, min),
        MultisearchOutput::ByQuery(groups) => {
            if json {
                let mut obj = serde_json::Map::new();
                for (query, results) in groups {
                    let items: Vec<Value> =
                        results.iter().map(|r| result_to_json(r, min)).collect();
                    obj.insert(query.clone(), Value::Array(items));
                }
                println!("{}", Value::Object(obj));
                return;
            }
            for (query, results) in groups {
                println!("{} {}", "query:".bold(), query);
                print_results(results, false, false);
                println!();
            }
        }
        MultisearchOutput::ByProfile(groups) => {
            if json {
                let mut obj = serde_json::Map::new();
                for (domain, results) in groups {
                    let items: Vec<Value> =
                        results.iter().map(|r| result_to_json(r, min)).collect();
                    obj.insert(domain.to_string(), Value::Array(items));
                }
                println!("{}", Value::Object(obj));
                return;
            }
            for (domain, results) in groups {
                println!("{} {}", "profile:".bold(), domain);
                print_results(results, false, false);
                println!();
            }
        }
    }
}

pub fn print_index_report(report: &IndexReport, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_value(report).unwrap_or_else(|_| json!({"error": true}))
        );
        return;
    }

    println!(
        "Indexed {} of {} files ({} unchanged, {} skipped)",
        report.files_indexed.to_string().green(),
        report.files_seen,
        report.files_unchanged,
        report.files_skipped
    );
    println!(
        "Chunks: {} created, {} removed",
        report.chunks_created, report.chunks_removed
    );
    if report.files_removed > 0 {
        println!("Removed {} deleted files from the index", report.files_removed);
    }
    if report.interrupted {
        println!("{}", "Interrupted: index is partially updated.".yellow());
    }
    if !report.errors.is_empty() {
        println!("{}", format!("{} files failed:", report.errors.len()).red());
        for err in report.errors.iter().take(10) {
            println!("  {}: {}", err.path, err.message);
        }
        if report.errors.len() > 10 {
            println!("  ... and {} more", report.errors.len() - 10);
        }
    }
}

pub fn memory_to_json(entry: &MemoryEntry, min: bool) -> Value {
    if min {
        json!({
            "id": entry.id,
            "q": entry.question,
            "a": entry.answer,
            "st": entry.status.to_string(),
            "n": entry.occurrences,
        })
    } else {
        serde_json::to_value(entry).unwrap_or_else(|_| json!({"error": true}))
    }
}

pub fn print_memory_hits(hits: &[MemoryHit], json: bool, min: bool) {
    if json {
        let items: Vec<Value> = hits
            .iter()
            .map(|hit| {
                let mut v = memory_to_json(&hit.entry, min);
                if min {
                    v["score"] = json!(round3(hit.score));
                    v["r"] = json!(hit.relevance.short());
                } else {
                    v["score"] = json!(round3(hit.score));
                    v["relevance"] = json!(hit.relevance.to_string());
                }
                v
            })
            .collect();
        println!("{}", Value::Array(items));
        return;
    }

    if hits.is_empty() {
        println!("{}", "No matching memories.".dimmed());
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2} {}] {} {}",
            i + 1,
            hit.score,
            hit.relevance,
            hit.entry.id.dimmed(),
            hit.entry.question.bold()
        );
        println!("   {}", hit.entry.answer);
    }
}

pub fn print_memory_list(entries: &[MemoryEntry], json: bool, min: bool) {
    if json {
        let items: Vec<Value> = entries.iter().map(|e| memory_to_json(e, min)).collect();
        println!("{}", Value::Array(items));
        return;
    }
    if entries.is_empty() {
        println!("{}", "No memories stored.".dimmed());
        return;
    }
    for entry in entries {
        println!(
            "{} [{}] ({}x) {}",
            entry.id.dimmed(),
            entry.status,
            entry.occurrences,
            entry.question
        );
    }
}

fn round3(v: f32) -> f64 {
    (v as f64 * 1000.0).round() / 1000.0
}
