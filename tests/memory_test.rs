//! Memory subsystem scenarios

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::BagEmbedder;
use llm_semantic::memory::{memory_id, MemoryFilter, MemoryStore, RetrievalLogger};
use llm_semantic::storage::{MemoryStatus, SqliteStore, Storage};

fn open(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(&dir.path().join("semantic.db"), None).unwrap())
}

#[test]
fn test_store_then_search_logs_retrieval() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    let (entry, is_new) = memory
        .store(
            "How do I rebuild the index?",
            "Run the index command with --force.",
            vec!["ops".to_string()],
            "manual",
        )
        .unwrap();
    assert!(is_new);
    assert_eq!(entry.id, memory_id("How do I rebuild the index?"));

    {
        let logger = RetrievalLogger::spawn(store.clone());
        let hits = memory
            .search(
                "rebuild the index",
                5,
                0.0,
                &MemoryFilter::default(),
                Some(&logger),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, entry.id);
        // Shared vocabulary puts the score well above unrelated text
        assert!(hits[0].score > 0.4, "score was {}", hits[0].score);
        // logger drains on drop
    }

    let history = store.retrieval_history(Some(&entry.id), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].query, "rebuild the index");
    assert!(history[0].score > 0.0);
}

#[test]
fn test_restore_same_question_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    let (first, is_new) = memory.store("What is X?", "X is a thing.", vec![], "").unwrap();
    assert!(is_new);
    let (second, is_new) = memory
        .store("  what is x?  ", "X is a revised thing.", vec![], "")
        .unwrap();
    assert!(!is_new);
    assert_eq!(first.id, second.id);

    let fetched = memory.get(&first.id).unwrap();
    assert_eq!(fetched.answer, "X is a revised thing.");
    assert_eq!(fetched.occurrences, 2);
}

#[test]
fn test_search_filters_by_tag_and_status() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    memory
        .store("deploy question", "deploy answer", vec!["ops".to_string()], "")
        .unwrap();
    memory
        .store("deploy other question", "other answer", vec!["web".to_string()], "")
        .unwrap();

    let ops_only = memory
        .search(
            "deploy question",
            10,
            0.0,
            &MemoryFilter {
                tags: vec!["ops".to_string()],
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(ops_only.len(), 1);
    assert!(ops_only[0].entry.tags.contains(&"ops".to_string()));

    let promoted_only = memory
        .search(
            "deploy question",
            10,
            0.0,
            &MemoryFilter {
                status: Some(MemoryStatus::Promoted),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert!(promoted_only.is_empty());
}

#[test]
fn test_promote_appends_markdown_and_flips_status() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    let (entry, _) = memory
        .store("Which port does the server use?", "Port 8080.", vec![], "")
        .unwrap();

    let target = dir.path().join("LEARNED.md");
    memory.promote(&entry.id, &target, "Learned Answers").unwrap();

    let content = std::fs::read_to_string(&target).unwrap();
    assert!(content.contains("## Learned Answers"));
    assert!(content.contains("Which port does the server use?"));
    assert!(content.contains("Port 8080."));
    assert!(content.contains(&format!("memory:{}", entry.id)));

    assert_eq!(memory.get(&entry.id).unwrap().status, MemoryStatus::Promoted);

    // Promoting a second memory lands in the same section
    let (second, _) = memory
        .store("Where are logs?", "In /var/log.", vec![], "")
        .unwrap();
    memory.promote(&second.id, &target, "Learned Answers").unwrap();
    let content = std::fs::read_to_string(&target).unwrap();
    assert_eq!(content.matches("## Learned Answers").count(), 1);
    assert!(content.contains("Where are logs?"));
}

#[test]
fn test_prune_log_bounds_and_exactness() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    assert!(memory.prune_log(0).is_err());
    assert!(memory.prune_log(36_501).is_err());

    let now = chrono::Utc::now().timestamp();
    store
        .track_retrievals(&[
            llm_semantic::storage::RetrievalLogEntry {
                memory_id: "m".into(),
                query: "boundary".into(),
                score: 0.5,
                ts: now - 7 * 86_400 + 60, // just inside the window
            },
            llm_semantic::storage::RetrievalLogEntry {
                memory_id: "m".into(),
                query: "outside".into(),
                score: 0.5,
                ts: now - 7 * 86_400 - 60, // just past it
            },
        ])
        .unwrap();

    let removed = memory.prune_log(7).unwrap();
    assert_eq!(removed, 1);
    let remaining = memory.history(None, 10).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].query, "boundary");
}

#[test]
fn test_import_jsonl() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    let jsonl = dir.path().join("memories.jsonl");
    std::fs::write(
        &jsonl,
        concat!(
            "{\"question\": \"q one\", \"answer\": \"a one\", \"tags\": [\"t\"]}\n",
            "\n",
            "{\"question\": \"q two\", \"answer\": \"a two\"}\n",
            "{\"question\": \"q one\", \"answer\": \"a one again\"}\n",
        ),
    )
    .unwrap();

    let (stored, updated) = memory.import(&jsonl).unwrap();
    assert_eq!(stored, 2);
    assert_eq!(updated, 1);

    let stats = memory.stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.pending, 2);

    // Malformed lines surface with a line number
    std::fs::write(&jsonl, "not json\n").unwrap();
    let err = memory.import(&jsonl).unwrap_err();
    assert!(err.message.contains(":1:"));
}

#[test]
fn test_delete_removes_history_too() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let embedder = BagEmbedder::new();
    let memory = MemoryStore::new(store.as_ref(), &embedder);

    let (entry, _) = memory.store("temp question", "temp answer", vec![], "").unwrap();
    {
        let logger = RetrievalLogger::spawn(store.clone());
        memory
            .search("temp question", 5, 0.0, &MemoryFilter::default(), Some(&logger))
            .unwrap();
    }
    assert_eq!(store.retrieval_count().unwrap(), 1);

    memory.delete(&entry.id).unwrap();
    assert!(memory.get(&entry.id).is_err());
    assert_eq!(store.retrieval_count().unwrap(), 0);

    let err = memory.delete(&entry.id).unwrap_err();
    assert_eq!(err.kind, llm_semantic::error::ErrorKind::NotFound);
}
