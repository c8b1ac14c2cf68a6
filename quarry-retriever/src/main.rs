use clap::{Parser, Subcommand};
use quarry_retriever::config::QuarryConfig;
use quarry_retriever::search::{SearchEngine, SearchStrategy};
use quarry_retriever::storage::{
    BackendKind, BackendOptionsPatch, DatabaseMetadata, OpenedStorage, QueuePriority, RuntimeCapabilities,
    SearchFilters, StorageFactory,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Maintenance CLI for a quarry search database.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory holding the database and quarry.meta.json
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "summary")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database, recording the backend and its options
    Init {
        /// Backend to create; ignored if the directory already has a database
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Backend options as a JSON object, e.g. '{"backend":"sqlite","distance_metric":"l2"}'
        #[arg(long)]
        options: Option<String>,
    },
    /// Show the stored metadata and which backends this build can open
    Info,
    /// Show document, chunk and queue counts
    Stats,
    /// Inspect or change the indexing queue
    Queue {
        #[command(subcommand)]
        action: Option<QueueCommand>,
    },
    /// Keyword search over the indexed chunks
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Restrict to paths under this folder (repeatable)
        #[arg(long)]
        folder: Vec<String>,
        /// Restrict to this file extension (repeatable)
        #[arg(long)]
        file_type: Vec<String>,
    },
    /// Read or write the key/value config store inside the database
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Run raw SQL against the backend
    Sql {
        sql: String,
        /// Bind parameters; each is parsed as JSON, falling back to a string
        params: Vec<String>,
        /// Execute a statement and print the affected row count
        #[arg(long)]
        execute: bool,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    /// Counts by status and priority (the default)
    Status,
    /// Enqueue paths for indexing
    Add {
        paths: Vec<String>,
        #[arg(short, long)]
        priority: Option<QueuePriority>,
    },
    /// Remove completed and failed items
    ClearCompleted,
    /// Remove every item
    Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct BackendAvailability {
    backend: BackendKind,
    native: bool,
    constrained: bool,
}

#[derive(Serialize)]
struct InfoOutput {
    data_dir: PathBuf,
    metadata: Option<DatabaseMetadata>,
    backends: Vec<BackendAvailability>,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// `QUARRY_LOG` wins over `RUST_LOG`; the default level is info.
fn init_logging() {
    let filter = EnvFilter::try_from_env("QUARRY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_config(args: &Args) -> anyhow::Result<QuarryConfig> {
    let mut config = match &args.config {
        Some(path) => QuarryConfig::load(path).await?,
        None => QuarryConfig::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    Ok(config)
}

async fn open(config: &QuarryConfig) -> anyhow::Result<OpenedStorage> {
    let opened = StorageFactory::new()
        .open(&config.storage, RuntimeCapabilities::native())
        .await?;
    Ok(opened)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args).await?;

    match args.command {
        Commands::Init { backend, options } => {
            if let Some(backend) = backend {
                config.storage.backend = Some(backend);
            }
            if let Some(options) = options {
                config.storage.backend_options = Some(BackendOptionsPatch::from_json(&options)?);
            }
            let opened = open(&config).await?;
            match args.format {
                OutputFormat::Json => print_json(&opened.metadata)?,
                OutputFormat::Summary => {
                    let verb = if opened.created { "Created" } else { "Opened existing" };
                    println!(
                        "{verb} {} database at {}",
                        opened.metadata.backend,
                        config.storage.data_dir.display()
                    );
                    println!("Embedding dimensions: {}", opened.metadata.embedding_dimensions);
                    for mismatch in &opened.mismatches {
                        println!("  note: {mismatch}");
                    }
                }
            }
            opened.adapter.close().await?;
        }
        Commands::Info => {
            let factory = StorageFactory::new();
            let output = InfoOutput {
                metadata: DatabaseMetadata::read(&config.storage.data_dir).await?,
                data_dir: config.storage.data_dir.clone(),
                backends: BackendKind::ALL
                    .into_iter()
                    .map(|backend| BackendAvailability {
                        backend,
                        native: factory.is_available(backend, RuntimeCapabilities::native()),
                        constrained: factory.is_available(backend, RuntimeCapabilities::constrained()),
                    })
                    .collect(),
            };
            match args.format {
                OutputFormat::Json => print_json(&output)?,
                OutputFormat::Summary => {
                    println!("Data directory: {}", output.data_dir.display());
                    match &output.metadata {
                        Some(metadata) => {
                            println!("  Backend: {}", metadata.backend);
                            println!("  Options: {}", serde_json::to_string(&metadata.backend_options)?);
                            println!("  Embedding dimensions: {}", metadata.embedding_dimensions);
                            println!("  Schema version: {}", metadata.schema_version);
                            println!("  Created: {} by {}", metadata.created_at, metadata.created_by);
                        }
                        None => println!("  No database yet (run `quarry init`)"),
                    }
                    println!("Backends:");
                    println!("  {:<10} {:<8} {:<11}", "backend", "native", "constrained");
                    for row in &output.backends {
                        println!(
                            "  {:<10} {:<8} {:<11}",
                            row.backend.as_str(),
                            if row.native { "yes" } else { "no" },
                            if row.constrained { "yes" } else { "no" }
                        );
                    }
                }
            }
        }
        Commands::Stats => {
            let opened = open(&config).await?;
            let stats = opened.adapter.stats().await?;
            match args.format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Summary => {
                    println!("Database Statistics:");
                    println!(
                        "  Documents: {} ({} indexed, {} pending, {} failed)",
                        stats.documents,
                        stats.documents_by_status.indexed,
                        stats.documents_by_status.pending,
                        stats.documents_by_status.failed
                    );
                    println!("  Chunks: {} ({} with embeddings)", stats.chunks, stats.embedded_chunks);
                    println!("  Tags: {}", stats.tags);
                    println!("  Queue items: {}", stats.queue_items);
                }
            }
            opened.adapter.close().await?;
        }
        Commands::Queue { action } => {
            let opened = open(&config).await?;
            let store = &opened.adapter;
            match action.unwrap_or(QueueCommand::Status) {
                QueueCommand::Status => {
                    let status = store.queue_status().await?;
                    match args.format {
                        OutputFormat::Json => print_json(&status)?,
                        OutputFormat::Summary => {
                            println!("Queue: {} items", status.total);
                            println!(
                                "  pending {} | processing {} | completed {} | failed {}",
                                status.pending, status.processing, status.completed, status.failed
                            );
                            println!(
                                "  pending by priority: high {} | normal {} | low {}",
                                status.by_priority.high, status.by_priority.normal, status.by_priority.low
                            );
                        }
                    }
                }
                QueueCommand::Add { paths, priority } => {
                    let mut items = Vec::with_capacity(paths.len());
                    for path in &paths {
                        items.push(store.enqueue(path, priority).await?);
                    }
                    match args.format {
                        OutputFormat::Json => print_json(&items)?,
                        OutputFormat::Summary => {
                            for item in items {
                                println!("  #{} {} ({})", item.id, item.file_path, item.priority);
                            }
                        }
                    }
                }
                QueueCommand::ClearCompleted => {
                    println!("Removed {} finished items", store.clear_completed().await?);
                }
                QueueCommand::Clear => {
                    println!("Removed {} items", store.clear_queue().await?);
                }
            }
            opened.adapter.close().await?;
        }
        Commands::Search {
            query,
            limit,
            offset,
            folder,
            file_type,
        } => {
            let opened = open(&config).await?;
            let engine = SearchEngine::new(opened.adapter.clone(), config.search.clone());
            let request = engine
                .query(query)
                .with_strategy(SearchStrategy::Keyword)
                .with_limit(limit)
                .with_offset(offset)
                .with_filters(SearchFilters {
                    folders: folder,
                    file_types: file_type,
                });
            let response = engine.search(&request).await?;

            match args.format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Summary => {
                    println!(
                        "Found {} results ({} candidates):",
                        response.results.len(),
                        response.total_candidates
                    );
                    for hit in &response.results {
                        let preview = hit.highlights.first().cloned().unwrap_or_else(|| {
                            hit.chunk_text.chars().take(100).collect::<String>()
                        });
                        println!("  {:.3} | {} | chunk {} | {}", hit.score, hit.file_path, hit.chunk_id, preview);
                    }
                }
            }
            opened.adapter.close().await?;
        }
        Commands::Config { action } => {
            let opened = open(&config).await?;
            let store = &opened.adapter;
            match action {
                ConfigCommand::Get { key } => match store.get_config(&key).await? {
                    Some(value) => println!("{value}"),
                    None => println!("{key} is not set"),
                },
                ConfigCommand::Set { key, value } => {
                    store.set_config(&key, &value).await?;
                    println!("Set {key}");
                }
                ConfigCommand::Delete { key } => {
                    if store.delete_config(&key).await? {
                        println!("Deleted {key}");
                    } else {
                        println!("{key} is not set");
                    }
                }
            }
            opened.adapter.close().await?;
        }
        Commands::Sql { sql, params, execute } => {
            let params: Vec<serde_json::Value> = params
                .iter()
                .map(|p| serde_json::from_str(p).unwrap_or_else(|_| serde_json::Value::String(p.clone())))
                .collect();
            let opened = open(&config).await?;
            if execute {
                let affected = opened.adapter.raw_execute(&sql, &params).await?;
                println!("{affected} rows affected");
            } else {
                let rows = opened.adapter.raw_query(&sql, &params).await?;
                match args.format {
                    OutputFormat::Json => print_json(&rows)?,
                    OutputFormat::Summary => {
                        for row in &rows {
                            println!("{}", serde_json::to_string(row)?);
                        }
                        println!("({} rows)", rows.len());
                    }
                }
            }
            opened.adapter.close().await?;
        }
    }

    Ok(())
}
