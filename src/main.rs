//! # graph-rag
//!
//! A hybrid retrieval question-answering engine. Documents are chunked,
//! embedded into a vector index, and mined for entities that build a typed
//! knowledge graph; queries are routed between a fast vector-only path and
//! a graph-expanded multi-hop path, and answers carry provenance.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use graph_rag::config;
use graph_rag::context::AppContext;
use graph_rag::db;
use graph_rag::engine::QueryMode;
use graph_rag::ingest::{self, IngestRequest};
use graph_rag::migrate;
use graph_rag::models::DocType;
use graph_rag::server;
use graph_rag::status;

#[derive(Parser)]
#[command(
    name = "grag",
    about = "graph-rag — a hybrid retrieval question-answering engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/grag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Ingest a document from a file, URL, or inline content
    Ingest {
        /// Path to a local file to ingest
        #[arg(long, conflicts_with_all = ["url", "content"])]
        file: Option<PathBuf>,

        /// URL to fetch and ingest
        #[arg(long, conflicts_with = "content")]
        url: Option<String>,

        /// Inline document content
        #[arg(long)]
        content: Option<String>,

        /// Document type: pdf, text, markdown, docx, url, raw
        #[arg(long, default_value = "text")]
        doc_type: String,

        /// Document title
        #[arg(long)]
        title: Option<String>,

        /// Comma-separated tags
        #[arg(long)]
        tags: Option<String>,
    },

    /// Answer a question against the indexed corpus
    Query {
        /// The question to answer
        question: String,

        /// Query mode: auto, speed, or deep
        #[arg(long, default_value = "auto")]
        mode: String,

        /// Number of chunks to retrieve
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Delete a document and its chunks everywhere
    Delete {
        /// Document ID
        doc_id: String,
    },

    /// Show system status and counters
    Status,

    /// Start the HTTP API server
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the JSON HTTP API
    Api,
}

fn parse_mode(s: &str) -> anyhow::Result<QueryMode> {
    match s {
        "auto" => Ok(QueryMode::Auto),
        "speed" => Ok(QueryMode::Speed),
        "deep" => Ok(QueryMode::Deep),
        other => anyhow::bail!("Unknown mode: {}. Use auto, speed, or deep.", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.storage.db_path()).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            url,
            content,
            doc_type,
            title,
            tags,
        } => {
            let doc_type = DocType::parse(&doc_type)
                .ok_or_else(|| anyhow::anyhow!("Unknown doc_type: {}", doc_type))?;

            let file = match file {
                Some(path) => {
                    let filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "upload".to_string());
                    Some((filename, std::fs::read(&path)?))
                }
                None => None,
            };

            let ctx = AppContext::initialize(cfg).await?;
            let outcome = ingest::ingest_document(
                &ctx,
                IngestRequest {
                    file,
                    url,
                    content,
                    doc_type,
                    title,
                    tags,
                },
            )
            .await?;

            println!("{}", outcome.message);
            println!("  doc_id:   {}", outcome.doc_id);
            println!("  chunks:   {}", outcome.chunks_created);
            println!("  entities: {}", outcome.entities_extracted);
            println!("  took:     {:.0}ms", outcome.processing_time_ms);
            ctx.shutdown().await;
        }
        Commands::Query {
            question,
            mode,
            top_k,
        } => {
            let mode = parse_mode(&mode)?;
            let ctx = AppContext::initialize(cfg).await?;
            let outcome = ctx.engine.query(&question, mode, top_k, None, None).await?;

            println!("{}", outcome.answer);
            println!();
            println!(
                "  mode: {}  confidence: {:.2}  chunks: {}  took: {:.0}ms",
                outcome.mode_used.as_str(),
                outcome.confidence,
                outcome.retrieval.metadata.chunks_retrieved,
                outcome.processing_time_ms
            );
            ctx.shutdown().await;
        }
        Commands::Delete { doc_id } => {
            let ctx = AppContext::initialize(cfg).await?;
            ingest::delete_document(&ctx, &doc_id).await?;
            println!("Document {} deleted.", doc_id);
            ctx.shutdown().await;
        }
        Commands::Status => {
            let ctx = AppContext::initialize(cfg).await?;
            let s = status::system_status(&ctx).await?;

            println!("graph-rag — System Status");
            println!("=========================");
            println!();
            println!("  status:       {}", s.status);
            println!("  lm connected: {}", s.lm_connected);
            println!();
            println!("  documents:    {}", s.metrics.document_count);
            println!("  chunks:       {}", s.metrics.chunk_count);
            println!("  entities:     {}", s.metrics.entity_count);
            println!("  relations:    {}", s.metrics.relation_count);
            println!("  queries:      {}", s.metrics.queries_total);
            ctx.shutdown().await;
        }
        Commands::Serve { service } => match service {
            ServeService::Api => {
                let ctx = Arc::new(AppContext::initialize(cfg).await?);
                server::run_server(ctx).await?;
            }
        },
    }

    Ok(())
}
