//! CLI implementation for llm-semantic

mod app;
mod commands;
mod display;
mod signal;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub(crate) use app::App;
pub(crate) use signal::{check_interrupted, setup_signal_handler};

use llm_semantic::error::SemanticError;

#[derive(Parser)]
#[command(name = "llm-semantic")]
#[command(about = "Semantic search over source trees with remote embeddings")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Embedding API base URL
    #[arg(long, global = true, env = "LLM_SEMANTIC_API_URL")]
    pub api_url: Option<String>,

    /// Embedding model name
    #[arg(long, global = true, env = "LLM_SEMANTIC_MODEL")]
    pub model: Option<String>,

    /// Embedding API key (prefer the provider env var)
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Index directory
    #[arg(long, global = true, default_value = ".llm-index")]
    pub index_dir: PathBuf,

    /// Storage backend: sqlite or qdrant
    #[arg(long, global = true)]
    pub storage: Option<String>,

    /// Collection name override
    #[arg(long, global = true)]
    pub collection: Option<String>,

    /// Embedding provider: openai, cohere, huggingface, openrouter
    #[arg(long, global = true, default_value = "openai")]
    pub embedder: String,

    /// Config file path (default: {index-dir}/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Profile: code, docs, memory, sprints
    #[arg(long, global = true, default_value = "code")]
    pub profile: String,

    /// Output JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Minimal JSON (abbreviated keys)
    #[arg(long, global = true)]
    pub min: bool,

    /// Show debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index a directory tree
    Index {
        /// Root to index (default: current directory)
        path: Option<PathBuf>,
        /// Include globs (file name or relative path)
        #[arg(long = "include")]
        includes: Vec<String>,
        /// Directory names to exclude
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// Re-index unchanged files too
        #[arg(long)]
        force: bool,
        /// Index files ignored by .gitignore
        #[arg(long)]
        no_ignore: bool,
    },
    /// Incrementally update the index (changed + deleted files)
    IndexUpdate {
        path: Option<PathBuf>,
        #[arg(long = "include")]
        includes: Vec<String>,
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        #[arg(long)]
        no_ignore: bool,
    },
    /// Show index statistics
    IndexStatus,
    /// Semantic / hybrid search
    Search {
        /// Search query (quote multi-word queries)
        query: String,
        /// Max results
        #[arg(long, default_value = "10")]
        top: usize,
        /// Minimum similarity score
        #[arg(long)]
        threshold: Option<f32>,
        /// Filter by chunk type (function, class, section, ...)
        #[arg(long = "type")]
        chunk_type: Vec<String>,
        /// Filter by path prefix
        #[arg(long)]
        path: Option<String>,
        /// Fuse dense and lexical rankings (RRF)
        #[arg(long)]
        hybrid: bool,
        /// RRF rank constant
        #[arg(long, default_value = "60")]
        fusion_k: f32,
        /// Dense weight in RRF (0 = pure lexical, 1 = pure dense)
        #[arg(long, default_value = "0.7")]
        fusion_alpha: f32,
        /// Boost recently modified files
        #[arg(long)]
        recency_boost: bool,
        /// Recency boost strength
        #[arg(long, default_value = "0.25")]
        recency_factor: f32,
        /// Recency half-life in days
        #[arg(long, default_value = "30")]
        recency_decay: f32,
        /// Comma-separated profiles to search
        #[arg(long, value_delimiter = ',')]
        profiles: Vec<String>,
    },
    /// Run several queries in one call and merge the results
    Multisearch {
        /// Queries (up to 8)
        #[arg(required = true)]
        queries: Vec<String>,
        #[arg(long, default_value = "10")]
        top: usize,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long, value_delimiter = ',')]
        profiles: Vec<String>,
        /// Disable the multi-match score boost
        #[arg(long)]
        no_boost: bool,
        /// Keep duplicate chunks across queries
        #[arg(long)]
        no_dedupe: bool,
        /// Output shape: blended, by_query, by_collection
        #[arg(long, default_value = "blended")]
        output: String,
    },
    /// Learned question/answer memory
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    /// Collection management
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum MemoryCommands {
    /// Store a question/answer pair
    Store {
        #[arg(short, long)]
        question: String,
        #[arg(short, long)]
        answer: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, default_value = "")]
        source: String,
    },
    /// Semantic search over stored memories
    Search {
        query: String,
        #[arg(long, default_value = "5")]
        top: usize,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Filter by status: pending or promoted
        #[arg(long)]
        status: Option<String>,
        /// Skip the retrieval-log append
        #[arg(long)]
        no_track: bool,
    },
    /// List stored memories
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show one memory by id
    Get { id: String },
    /// Delete a memory and its retrieval history
    Delete { id: String },
    /// Promote a memory into a markdown file section
    Promote {
        #[arg(long)]
        id: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        section: String,
    },
    /// Import question/answer pairs from a JSONL file
    Import { file: PathBuf },
    /// Memory and retrieval-log statistics
    Stats,
    /// Delete retrieval-log rows older than N days
    PruneLog {
        #[arg(long)]
        older_than: u32,
    },
}

#[derive(Subcommand)]
pub enum CollectionCommands {
    /// Delete every chunk and file record in a profile
    Delete {
        #[arg(long)]
        profile: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Run the CLI; returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    match dispatch(cli) {
        Ok(()) => 0,
        Err((err, json, min)) => {
            display::print_error(&err, json, min);
            1
        }
    }
}

fn dispatch(cli: Cli) -> Result<(), (SemanticError, bool, bool)> {
    let json = cli.json || cli.min;
    let min = cli.min;

    // Completions don't need config or storage
    if let Commands::Completions { shell } = &cli.command {
        use clap::CommandFactory;
        let shell = *shell;
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    let app = App::new(&cli).map_err(|e| (e, json, min))?;
    commands::execute(&app, cli.command).map_err(|e| (e, json, min))
}
