//! VirtDir command-line management tool.
//!
//! Provides subcommands for inspecting partitions and entry mappings,
//! validating configuration files, and running ad-hoc searches and
//! compares against a locally composed engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use console::style;
use tracing_subscriber::EnvFilter;

use virtdir_core::acl::AllowAll;
use virtdir_core::config::{PartitionConfig, ServerConfig};
use virtdir_core::entry::{Dn, SearchScope};
use virtdir_core::filter::Filter;
use virtdir_core::interpreter::InterpreterRegistry;
use virtdir_core::mapping::EntryId;
use virtdir_core::pool::WorkerPool;
use virtdir_core::source::AdapterRegistry;
use virtdir_core::{Engine, PartitionManager};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// VirtDir command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "virtdir",
    version,
    about = "Manage and inspect a VirtDir virtual directory server"
)]
struct Cli {
    /// Path to the TOML server configuration file.
    #[arg(short, long, global = true, default_value = "/etc/virtdir/server.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show partition status.
    Status,

    /// Validate configuration files.
    Validate {
        /// Validate one partition file instead of the whole server config.
        #[arg(long)]
        partition: Option<PathBuf>,
    },

    /// Inspect entry mappings.
    Entries {
        #[command(subcommand)]
        action: EntriesAction,
    },

    /// Run a search against the configured partitions.
    Search {
        /// Base DN.
        base: String,

        /// Scope: base, one, or sub.
        #[arg(short, long, default_value = "sub")]
        scope: String,

        /// Filter string, e.g. '(objectClass=*)'.
        #[arg(short, long)]
        filter: Option<String>,

        /// Maximum number of entries (0 = unlimited).
        #[arg(short = 'z', long, default_value = "0")]
        size_limit: usize,
    },

    /// Compare an attribute value on one entry.
    Compare {
        /// Target DN.
        dn: String,
        /// Attribute name.
        attribute: String,
        /// Asserted value.
        value: String,
    },
}

#[derive(Subcommand, Debug)]
enum EntriesAction {
    /// List entry mappings, optionally for one partition.
    List {
        #[arg(short, long)]
        partition: Option<String>,
    },
    /// Show one entry mapping in full.
    Show {
        /// Partition name.
        partition: String,
        /// Entry id, e.g. e3.
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new("warn").expect("static filter"))
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Status => {
            let (manager, _engine) = compose(&cli.config)?;
            print_status(&manager)
        }
        Commands::Validate { partition } => match partition {
            Some(path) => {
                PartitionConfig::load_and_resolve(&path)
                    .with_context(|| format!("partition file {}", path.display()))?;
                println!("{} {}", style("ok:").green().bold(), path.display());
                Ok(())
            }
            None => {
                let config = ServerConfig::load_from_file(&cli.config)?;
                config.validate()?;
                let mut checked = 0usize;
                if config.daemon.partitions_dir.is_dir() {
                    for entry in std::fs::read_dir(&config.daemon.partitions_dir)? {
                        let path = entry?.path();
                        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                            PartitionConfig::load_and_resolve(&path)
                                .with_context(|| format!("partition file {}", path.display()))?;
                            checked += 1;
                        }
                    }
                }
                println!(
                    "{} server config and {} partition file(s)",
                    style("ok:").green().bold(),
                    checked
                );
                Ok(())
            }
        },
        Commands::Entries { action } => {
            let (manager, _engine) = compose(&cli.config)?;
            match action {
                EntriesAction::List { partition } => print_entries(&manager, partition.as_deref()),
                EntriesAction::Show { partition, id } => print_entry(&manager, &partition, &id),
            }
        }
        Commands::Search {
            base,
            scope,
            filter,
            size_limit,
        } => {
            let (_manager, engine) = compose(&cli.config)?;
            let base = Dn::parse(&base).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let scope = parse_scope(&scope)?;
            let filter = match filter {
                Some(text) => Some(Filter::parse(&text).map_err(|e| anyhow::anyhow!(e.to_string()))?),
                None => None,
            };
            let results = engine
                .search(&Dn::root(), &base, scope, filter.as_ref(), size_limit)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            for result in &results {
                println!("{}", style(format!("dn: {}", result.dn)).bold());
                for attr in result.attributes.iter() {
                    for value in attr.values() {
                        println!("{}: {}", attr.name(), value);
                    }
                }
                println!();
            }
            println!("{} entries", results.len());
            Ok(())
        }
        Commands::Compare {
            dn,
            attribute,
            value,
        } => {
            let (_manager, engine) = compose(&cli.config)?;
            let dn = Dn::parse(&dn).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let matched = engine
                .compare(&Dn::root(), &dn, &attribute, &value)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            if matched {
                println!("{}", style("true").green());
            } else {
                println!("{}", style("false").red());
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Composition and output
// ---------------------------------------------------------------------------

/// Compose a local engine the same way the daemon does.
fn compose(config_path: &PathBuf) -> Result<(Arc<PartitionManager>, Arc<Engine>)> {
    let config = ServerConfig::load_from_file(config_path)?;
    config.validate()?;

    let manager = Arc::new(PartitionManager::new(
        AdapterRegistry::with_defaults(),
        &config.cache.routing,
    ));
    manager
        .load_partitions(&config.daemon.partitions_dir)
        .context("failed to read partitions directory")?;
    manager.start_all();

    let engine = Arc::new(Engine::new(
        manager.clone(),
        Arc::new(InterpreterRegistry::with_defaults()),
        Arc::new(AllowAll),
        WorkerPool::new(config.daemon.worker_threads),
        &config.cache,
    ));
    Ok((manager, engine))
}

fn parse_scope(scope: &str) -> Result<SearchScope> {
    match scope {
        "base" => Ok(SearchScope::Base),
        "one" => Ok(SearchScope::One),
        "sub" => Ok(SearchScope::Sub),
        other => anyhow::bail!("unknown scope '{}', expected base, one, or sub", other),
    }
}

fn print_status(manager: &PartitionManager) -> Result<()> {
    let mut table = Table::new();
    table.set_header(vec!["Partition", "Status", "Roots", "Entries"]);
    for (name, partition) in manager.partitions() {
        let roots = partition.root_dns().join(", ");
        let entries = partition.directory().len();
        table.add_row(vec![
            name,
            partition.status().to_string(),
            roots,
            entries.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_entries(manager: &PartitionManager, only: Option<&str>) -> Result<()> {
    let mut table = Table::new();
    table.set_header(vec!["Partition", "Id", "DN", "Kind", "Sources"]);
    for (name, partition) in manager.partitions() {
        if let Some(only) = only {
            if name != only {
                continue;
            }
        }
        let directory = partition.directory();
        for id in directory.ids() {
            let Some(entry) = directory.get(id) else { continue };
            let sources: Vec<&str> = entry.sources.iter().map(|s| s.alias.as_str()).collect();
            table.add_row(vec![
                name.clone(),
                id.to_string(),
                entry.dn.to_string(),
                entry.kind().to_string(),
                sources.join(", "),
            ]);
        }
    }
    println!("{table}");
    Ok(())
}

fn print_entry(manager: &PartitionManager, partition_name: &str, id: &str) -> Result<()> {
    let partition = manager
        .partition(partition_name)
        .with_context(|| format!("partition '{}' not found", partition_name))?;
    let numeric: u64 = id
        .trim_start_matches('e')
        .parse()
        .with_context(|| format!("invalid entry id '{}'", id))?;
    let directory = partition.directory();
    let entry = directory
        .get(EntryId(numeric))
        .with_context(|| format!("entry '{}' not found", id))?;
    println!("{}", serde_json::to_string_pretty(entry)?);
    Ok(())
}
