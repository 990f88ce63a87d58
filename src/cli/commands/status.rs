//! `index-status`

use colored::Colorize;
use serde_json::json;

use llm_semantic::error::{ErrorKind, SemanticError};

use crate::cli::App;

pub(crate) fn cmd_status(app: &App) -> Result<(), SemanticError> {
    let storage = app.open_storage(app.profile)?;
    let stats = storage
        .stats()
        .map_err(|e| SemanticError::new(ErrorKind::StorageOpen, e.to_string()))?;
    let calibration = storage.get_calibration(app.profile).ok().flatten();

    if app.json {
        let mut by_domain = serde_json::Map::new();
        for (domain, (files, chunks)) in &stats.by_domain {
            by_domain.insert(
                domain.to_string(),
                json!({"files": files, "chunks": chunks}),
            );
        }
        let mut v = json!({
            "backend": storage.backend_name(),
            "files_indexed": stats.files_indexed,
            "chunks_total": stats.chunks_total,
            "last_updated": stats.last_updated,
            "by_domain": by_domain,
            "vector_dim": stats.vector_dim,
            "embedding_model": stats.embedding_model,
            "size_bytes": stats.size_bytes,
        });
        if let Some(cal) = calibration {
            v["calibration"] = json!({
                "model": cal.embedding_model,
                "date": cal.calibration_date,
                "thresholds": {
                    "high": cal.threshold_high,
                    "medium": cal.threshold_medium,
                    "low": cal.threshold_low,
                },
            });
        }
        println!("{}", v);
        return Ok(());
    }

    println!("{} {}", "backend:".bold(), storage.backend_name());
    println!(
        "{} {} files, {} chunks",
        "indexed:".bold(),
        stats.files_indexed,
        stats.chunks_total
    );
    if let Some(dim) = stats.vector_dim {
        let model = stats.embedding_model.as_deref().unwrap_or("unknown");
        println!("{} {} ({}-dim)", "model:".bold(), model, dim);
    }
    if !stats.last_updated.is_empty() {
        println!("{} {}", "updated:".bold(), stats.last_updated);
    }
    if stats.size_bytes > 0 {
        println!(
            "{} {:.1} MB",
            "size:".bold(),
            stats.size_bytes as f64 / (1024.0 * 1024.0)
        );
    }
    let mut domains: Vec<_> = stats.by_domain.iter().collect();
    domains.sort_by_key(|(d, _)| d.to_string());
    for (domain, (files, chunks)) in domains {
        println!("  {}: {} files, {} chunks", domain, files, chunks);
    }
    if let Some(cal) = calibration {
        println!(
            "{} high >= {:.2}, medium >= {:.2}, low >= {:.2} ({})",
            "calibration:".bold(),
            cal.threshold_high,
            cal.threshold_medium,
            cal.threshold_low,
            cal.embedding_model
        );
    }
    Ok(())
}
