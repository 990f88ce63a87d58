//! End-to-end indexing scenarios against the SQLite backend

mod common;

use std::sync::atomic::Ordering;

use tempfile::TempDir;

use common::{write_file, BagEmbedder, BrokenEmbedder, TEST_DIM};
use llm_semantic::chunker::Domain;
use llm_semantic::embedder::TextEmbedder;
use llm_semantic::indexer::{IndexOptions, Indexer};
use llm_semantic::storage::{SqliteStore, Storage};

const GO_FILE: &str = "package main\n\n// Foo greets the caller.\nfunc Foo(name string) string {\n\treturn \"hello \" + name\n}\n";
const MD_FILE: &str = "## Intro\n\nThis document introduces the indexing pipeline.\n";

fn setup() -> (TempDir, TempDir) {
    (TempDir::new().unwrap(), TempDir::new().unwrap())
}

fn open(store_dir: &TempDir) -> SqliteStore {
    SqliteStore::open(&store_dir.path().join("semantic.db"), None).unwrap()
}

#[test]
fn test_index_two_files_end_to_end() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);
    write_file(tree.path(), "b.md", MD_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);

    let report = indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();

    assert_eq!(report.files_seen, 2);
    assert_eq!(report.files_indexed, 2);
    assert_eq!(report.chunks_created, 2);
    assert!(report.errors.is_empty());

    let stats = store.stats().unwrap();
    assert_eq!(stats.files_indexed, 2);
    assert_eq!(stats.chunks_total, 2);
    assert_eq!(stats.vector_dim, Some(TEST_DIM));

    // File records carry the hash manifest
    let record = store.get_file_record("a.go", Domain::Code).unwrap().unwrap();
    assert_eq!(record.chunk_count, 1);
    assert!(!record.content_hash.is_empty());

    // Calibration was derived for the profile
    let cal = store.get_calibration(Domain::Code).unwrap().unwrap();
    assert_eq!(cal.embedding_model, "test-bag-embedder");
    assert_eq!(cal.vector_dim, TEST_DIM);
    assert!(cal.threshold_high > cal.threshold_medium);
    assert!(cal.threshold_medium > cal.threshold_low);
}

#[test]
fn test_reindex_without_edits_is_a_no_op() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);
    write_file(tree.path(), "b.md", MD_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);
    indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();

    let report = indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();
    assert_eq!(report.chunks_created, 0);
    assert_eq!(report.files_unchanged, 2);
    assert_eq!(report.files_indexed, 0);
}

#[test]
fn test_update_after_single_file_edit() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);
    write_file(tree.path(), "b.md", MD_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);
    indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();

    write_file(
        tree.path(),
        "b.md",
        "## Intro\n\nThis document introduces the indexing pipeline, revised.\n",
    );

    let report = indexer
        .update(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.files_unchanged, 1);
    assert_eq!(report.chunks_created, 1);
    assert_eq!(report.chunks_removed, 1);
    assert_eq!(report.files_removed, 0);
}

#[test]
fn test_update_removes_deleted_files() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);
    write_file(tree.path(), "b.md", MD_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);
    indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();

    std::fs::remove_file(tree.path().join("b.md")).unwrap();

    let report = indexer
        .update(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();
    assert_eq!(report.files_removed, 1);
    assert_eq!(report.chunks_removed, 1);
    assert!(store.get_file_record("b.md", Domain::Code).unwrap().is_none());
    assert_eq!(store.stats().unwrap().files_indexed, 1);
}

#[test]
fn test_force_reindexes_but_reuses_embeddings() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);
    indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();
    let calls_after_first = embedder.document_calls.load(Ordering::SeqCst);

    let opts = IndexOptions {
        force: true,
        ..Default::default()
    };
    let report = indexer.index(tree.path(), &opts, |_| {}, || false).unwrap();
    assert_eq!(report.files_indexed, 1);
    // Chunk content is unchanged, so stored embeddings are reused and only
    // calibration re-embeds
    let calls_after_second = embedder.document_calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_second - calls_after_first, 1);
}

#[test]
fn test_include_filter_limits_extensions() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);
    write_file(tree.path(), "b.md", MD_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);
    let opts = IndexOptions {
        includes: vec!["*.go".to_string()],
        ..Default::default()
    };
    let report = indexer.index(tree.path(), &opts, |_| {}, || false).unwrap();
    assert_eq!(report.files_seen, 1);
    assert!(store.get_file_record("b.md", Domain::Code).unwrap().is_none());
}

#[test]
fn test_per_file_failures_do_not_abort() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "good.go", GO_FILE);
    // A binary file is skipped, not errored
    std::fs::write(tree.path().join("blob.bin"), [0u8, 159, 146, 150]).unwrap();

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Code);
    let report = indexer
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.files_skipped, 1);
    assert!(report.errors.is_empty());
}

#[test]
fn test_probe_failure_is_fatal() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);

    let store = open(&store_dir);
    let err = Indexer::new(&store, &BrokenEmbedder, Domain::Code)
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap_err();
    assert_eq!(err.kind, llm_semantic::error::ErrorKind::Provider);
}

#[test]
fn test_cancellation_reports_partial_state() {
    let (tree, store_dir) = setup();
    for i in 0..5 {
        write_file(
            tree.path(),
            &format!("f{}.md", i),
            &format!("## Doc {}\n\ncontent number {}\n", i, i),
        );
    }

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    let indexer = Indexer::new(&store, &embedder, Domain::Docs);

    // Cancel after the first progress event
    let cancelled = std::sync::atomic::AtomicBool::new(false);
    let report = indexer
        .index(
            tree.path(),
            &IndexOptions {
                verbose: true,
                ..Default::default()
            },
            |_| {
                cancelled.store(true, Ordering::SeqCst);
            },
            || cancelled.load(Ordering::SeqCst),
        )
        .unwrap();
    assert!(report.interrupted);
    assert!(report.files_indexed < 5);
}

#[test]
fn test_vectors_match_collection_dimension() {
    let (tree, store_dir) = setup();
    write_file(tree.path(), "a.go", GO_FILE);
    write_file(tree.path(), "b.md", MD_FILE);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    Indexer::new(&store, &embedder, Domain::Code)
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();

    assert_eq!(store.vector_dim().unwrap(), Some(TEST_DIM));
    // Reopening at a different dimension fails closed
    let err = SqliteStore::open(&store_dir.path().join("semantic.db"), Some(TEST_DIM * 2));
    assert!(err.is_err());
}

#[test]
fn test_chunk_line_ranges_ordered_per_file() {
    let (tree, store_dir) = setup();
    let mut big = String::from("package main\n\n");
    for i in 0..6 {
        big.push_str(&format!("func F{}() int {{\n\treturn {}\n}}\n\n", i, i));
    }
    write_file(tree.path(), "many.go", &big);

    let store = open(&store_dir);
    let embedder = BagEmbedder::new();
    Indexer::new(&store, &embedder, Domain::Code)
        .index(tree.path(), &IndexOptions::default(), |_| {}, || false)
        .unwrap();

    let query = embedder.embed_query("func return int").unwrap();
    let hits = store
        .dense_top_k(&query, 20, &llm_semantic::storage::SearchScope::default())
        .unwrap();
    let mut chunks: Vec<_> = hits.iter().map(|h| &h.chunk).collect();
    chunks.sort_by_key(|c| c.start_line);
    for pair in chunks.windows(2) {
        assert!(pair[0].start_line <= pair[0].end_line);
        assert!(pair[0].end_line < pair[1].start_line);
    }
}
