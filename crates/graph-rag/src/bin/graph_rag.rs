//! graph-rag command line
//!
//! `serve` runs the scheduler; it spawns `graph-rag worker --task <id>` for
//! every task. The remaining subcommands act on the same data directory.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use graph_rag::processing::TaskRunner;
use graph_rag::{ParserMethod, RagConfig, RagService, SearchRequest, SearchScope, WorkerMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "graph-rag")]
#[command(about = "Knowledge-base ingestion scheduler and hybrid retrieval")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl+C
    Serve {
        /// Run tasks on the scheduler's runtime instead of worker processes
        #[arg(long)]
        in_process: bool,
    },
    /// Run one task (spawned by the scheduler)
    Worker {
        #[arg(long)]
        task: Uuid,
    },
    /// Create a knowledge base
    CreateKb {
        name: String,
        /// Vector dimension (defaults to the embedding dimension)
        #[arg(long)]
        dimension: Option<usize>,
    },
    /// List knowledge bases, or the documents of one
    List {
        #[arg(long)]
        kb: Option<Uuid>,
    },
    /// Store a file as a document
    Add {
        path: PathBuf,
        /// Knowledge base; omit for a temporary document
        #[arg(long)]
        kb: Option<Uuid>,
        /// general, ocr or enhanced
        #[arg(long, default_value = "general", value_parser = parse_method)]
        method: ParserMethod,
        /// Chunk token budget
        #[arg(long)]
        budget: Option<usize>,
        /// Submit a parse task right away
        #[arg(long)]
        submit: bool,
    },
    /// Submit a parse task for a document
    Submit { document: Uuid },
    /// Show a task's status and reports
    Status { task: Uuid },
    /// Cancel a task
    Cancel { task: Uuid },
    /// Delete a task, or with --document a document and everything derived from it
    Delete {
        id: Uuid,
        #[arg(long)]
        document: bool,
    },
    /// Submit an export of a knowledge base
    Export { kb: Uuid },
    /// Submit an import of an export file
    Import {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Write a blob (e.g. a finished export) to a file
    Fetch { blob: Uuid, out: PathBuf },
    /// Search a knowledge base or a set of temporary documents
    Search {
        query: String,
        #[arg(long, conflicts_with = "documents")]
        kb: Option<Uuid>,
        /// Temporary document ids
        #[arg(long, num_args = 1..)]
        documents: Vec<Uuid>,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value_t = 1024)]
        budget: usize,
    },
}

fn parse_method(value: &str) -> std::result::Result<ParserMethod, String> {
    ParserMethod::parse(value).ok_or_else(|| format!("unknown parser method '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graph_rag=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RagConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let mode = match &cli.command {
        Command::Serve { in_process: true } => WorkerMode::InProcess,
        _ => WorkerMode::Process {
            config_path: cli.config.clone(),
        },
    };
    let service = RagService::open(config, mode)?;

    match cli.command {
        Command::Serve { .. } => {
            let (tx, rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    let _ = tx.send(true);
                }
            });
            service.serve(rx).await?;
        }
        Command::Worker { task } => {
            let runner = TaskRunner::new(Arc::clone(service.context()));
            runner.run(task).await?;
        }
        Command::CreateKb { name, dimension } => {
            let kb = service.create_knowledge_base(&name, dimension)?;
            println!("{}", kb.id);
        }
        Command::List { kb: None } => {
            for kb in service.list_knowledge_bases()? {
                println!("{}\t{}\t{}\t{}", kb.id, kb.name, kb.dimension, kb.export_status.as_str());
            }
        }
        Command::List { kb: Some(kb) } => {
            for doc in service.list_documents(kb)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    doc.id,
                    doc.name,
                    doc.status.as_str(),
                    if doc.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        Command::Add {
            path,
            kb,
            method,
            budget,
            submit,
        } => {
            let doc = service.add_document(kb, &path, method, budget).await?;
            println!("document {}", doc.id);
            if submit {
                println!("task {}", service.submit_parse_task(doc.id)?);
            }
        }
        Command::Submit { document } => {
            println!("{}", service.submit_parse_task(document)?);
        }
        Command::Status { task } => {
            println!("{}", serde_json::to_string_pretty(&service.get_status(task)?)?);
        }
        Command::Cancel { task } => {
            println!("{}", service.cancel_task(task).await?.as_str());
        }
        Command::Delete { id, document: true } => {
            if !service.delete_document(id).await? {
                return Err(anyhow!("Document {} not found", id));
            }
        }
        Command::Delete { id, document: false } => {
            println!("{}", service.delete_task(id).await?.as_str());
        }
        Command::Export { kb } => {
            let (task, blob) = service.submit_export(kb)?;
            println!("task {}\nblob {}", task, blob);
        }
        Command::Import { path, name } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let (task, kb) = service.submit_import(&data, name).await?;
            println!("task {}\nkb {}", task, kb);
        }
        Command::Fetch { blob, out } => {
            let data = service.read_blob(blob).await?;
            tokio::fs::write(&out, data).await?;
        }
        Command::Search {
            query,
            kb,
            documents,
            top_k,
            budget,
        } => {
            let scope = match kb {
                Some(kb) => SearchScope::KnowledgeBase(kb),
                None if !documents.is_empty() => SearchScope::Temporary(documents),
                None => return Err(anyhow!("Pass --kb or --documents")),
            };
            let request = SearchRequest::new(query, scope, top_k, budget);
            let result = service.get_similar_chunks(&request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
