//! # docport CLI
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docport import` | Run the full import: enumerate, plan, write, report |
//! | `docport plan` | Print the planned order and chunk counts, no writes |
//!
//! ```bash
//! docport --config ./docport.toml plan
//! docport --config ./docport.toml import --dry-run
//! docport --config ./docport.toml import --write-mode wiki
//! ```
//!
//! Credentials come from the environment: `DOCPORT_APP_ID`,
//! `DOCPORT_APP_SECRET`, and `ORACLE_API_KEY` when the oracle is
//! enabled.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docport::chunker;
use docport::config::load_config;
use docport::notify;
use docport::oracle;
use docport::orchestrator;
use docport::parser;
use docport::remote::{HttpRemote, OfflineBackend, RemoteBackend};

/// Markdown-to-workspace importer.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. See `config/docport.example.toml`.
#[derive(Parser)]
#[command(
    name = "docport",
    about = "Import Markdown trees into a remote document workspace",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docport.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the import end to end.
    ///
    /// Enumerates the source, plans the document order, writes every
    /// document, and prints the final report. Exit code 0 when all
    /// documents succeed, 2 when at least one fails.
    Import {
        /// Compute the full plan and chunking but perform no network
        /// calls at all.
        #[arg(long)]
        dry_run: bool,

        /// Override the configured write mode: folder, wiki, or both.
        #[arg(long)]
        write_mode: Option<String>,
    },

    /// Print the planned document order without writing anything.
    Plan,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(1);
        }
    }
}

async fn execute(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Plan => {
            let oracle = oracle::create_resolver(&config.oracle)?;
            let (documents, manifest) = orchestrator::build_plan(&config, oracle.as_deref()).await?;

            println!("Planned order ({} documents):", manifest.nodes.len());
            for node in &manifest.nodes {
                let doc = documents.iter().find(|d| d.relative_path == node.path);
                let chunk_count = match doc {
                    Some(doc) => {
                        chunker::count_chunks(&parser::parse(&doc.raw_text), &config.chunking)
                            .map(|n| n.to_string())
                            .unwrap_or_else(|e| format!("error: {}", e))
                    }
                    None => "?".to_string(),
                };
                println!(
                    "  {:>3}. {}  ({} chunks)  [{}]",
                    node.order + 1,
                    node.path,
                    chunk_count,
                    node.display_title
                );
            }
            for skipped in &manifest.skipped {
                println!("  skipped: {} ({})", skipped.path, skipped.reason);
            }
            for unresolved in &manifest.unresolved_links {
                println!("  unresolved TOC link: {}", unresolved);
            }
            Ok(0)
        }
        Commands::Import { dry_run, write_mode } => {
            if let Some(mode) = write_mode {
                if !matches!(mode.as_str(), "folder" | "wiki" | "both") {
                    anyhow::bail!("Unknown --write-mode '{}'. Must be folder, wiki, or both.", mode);
                }
                if mode != "folder"
                    && config.import.space_name.is_empty()
                    && config.import.space_id.is_empty()
                {
                    anyhow::bail!("--write-mode {} requires import.space_name or import.space_id", mode);
                }
                config.import.write_mode = mode;
            }

            let backend: Arc<dyn RemoteBackend> = if dry_run {
                Arc::new(OfflineBackend)
            } else {
                Arc::new(HttpRemote::new(&config.remote)?)
            };
            let oracle = oracle::create_resolver(&config.oracle)?;
            let sink = notify::create_sink(&config.notify);

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Cancellation requested, finishing in-flight writes");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let report =
                orchestrator::run(&config, backend, oracle, sink, dry_run, cancel).await?;

            println!("{}", notify::summarize(&report));
            Ok(report.exit_code())
        }
    }
}
