use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use kb_agent::admin;
use kb_agent::config::AppConfig;
use kb_agent::db::PgStore;
use kb_agent::indexer::collect_documents;
use kb_agent::rag::{build_embedder, DocumentLoader};
use kb_agent::retry::RetryPolicy;

#[derive(Parser, Debug)]
#[command(name = "kb-loader")]
#[command(about = "Manage the company knowledge base")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every .txt, .md, .docx and .pdf file under a directory
    Load {
        /// Directory to recursively load
        #[arg(short, long, env = "KB_DOCS_DIR", default_value = "documentation")]
        dir: PathBuf,
    },
    /// Delete all topics, messages and senders
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Print row counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AppConfig::load()?;

    let store = PgStore::connect(&config.database).await?;
    store.init_schema().await?;

    match args.command {
        Command::Load { dir } => load(&config, store, dir).await,
        Command::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to clear the knowledge base without --yes");
            }
            let removed = admin::clear_all(&store, &store).await?;
            println!("Cleared the knowledge base:");
            println!("  Topics:   {}", removed.topics);
            println!("  Messages: {}", removed.messages);
            println!("  Senders:  {}", removed.senders);
            Ok(())
        }
        Command::Status => {
            let counts = admin::status(&store, &store).await?;
            println!("Knowledge base status:");
            println!("  Topics:   {}", counts.topics);
            println!("  Senders:  {}", counts.senders);
            println!("  Messages: {}", counts.messages);
            Ok(())
        }
    }
}

async fn load(config: &AppConfig, store: PgStore, dir: PathBuf) -> Result<()> {
    println!("Scanning directory: {}", dir.display());
    let collected = collect_documents(&dir)?;
    println!("Found {} documents with content", collected.documents.len());

    if collected.documents.is_empty() {
        println!("No documents to load. Exiting.");
        return Ok(());
    }

    println!("Initializing embedding provider ({})...", config.embedding.model);
    let embedder = build_embedder(&config.embedding)?;
    let loader = DocumentLoader::new(
        embedder,
        Arc::new(store),
        RetryPolicy::new(&config.retry),
        &config.chunking,
        &config.embedding,
    );

    let pb = ProgressBar::new(collected.documents.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut total_topics = 0usize;
    let mut failed: Vec<(String, String)> = Vec::new();

    for document in &collected.documents {
        pb.set_message(document.title.clone());

        match loader.load(std::slice::from_ref(document)).await {
            Ok(report) => total_topics += report.topics_created,
            Err(e) => {
                tracing::warn!("Failed to load {}: {}", document.source, e);
                failed.push((document.source.clone(), e.to_string()));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    println!("\nLoading complete!");
    println!(
        "  Documents loaded: {}/{}",
        collected.documents.len() - failed.len(),
        collected.documents.len()
    );
    println!("  Topics created:   {}", total_topics);
    println!("  Empty files:      {}", collected.empty_files.len());
    println!("  Unreadable files: {}", collected.failed_files.len());

    if !failed.is_empty() || !collected.failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &collected.failed_files {
            println!("  {}: {}", path.display(), err);
        }
        for (source, err) in &failed {
            println!("  {}: {}", source, err);
        }
    }

    Ok(())
}
