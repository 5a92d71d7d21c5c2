#![allow(clippy::multiple_crate_versions)]

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nataili::config::Config;
use nataili::models::download::format_bytes;
use nataili::ModelManager;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nataili")]
#[command(about = "Manage local model assets", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/nataili/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Asset directory (default: ~/.nataili)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Use the bundled manifests instead of fetching the remote ones
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog entries
    List {
        /// List dependencies instead of models
        #[arg(long)]
        deps: bool,
        /// Only models whose metadata matches KEY=VALUE (repeatable)
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },
    /// Show manifest source and what is present on disk
    Status,
    /// Download models or dependencies
    Download {
        names: Vec<String>,
        /// Names refer to dependencies
        #[arg(long)]
        deps: bool,
        /// Every entry in the catalog
        #[arg(long, conflicts_with = "marked")]
        all: bool,
        /// Dependencies plus the models flagged download_all
        #[arg(long)]
        marked: bool,
    },
    /// Verify a model's files and checksums
    Validate { name: String },
    /// Exit non-zero unless every catalog entry is present
    Check,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.base_dir {
        config.storage.base_dir = Some(dir);
    }
    if cli.offline {
        config.manifest.refresh = false;
    }

    let mut manager: ModelManager =
        ModelManager::from_config(&config).context("Failed to initialize model manager")?;
    manager.recompute_availability()?;

    match cli.command {
        Commands::List { deps, filters } => list(&manager, deps, &filters),
        Commands::Status => {
            status(&manager);
            Ok(())
        }
        Commands::Download {
            names,
            deps,
            all,
            marked,
        } => download(&mut manager, &names, deps, all, marked),
        Commands::Validate { name } => {
            if manager.validate_model(&name)? {
                println!("✓ {name} is valid");
                Ok(())
            } else {
                bail!("{name} is missing files or failed checksum validation")
            }
        }
        Commands::Check => {
            if manager.check_all_available() {
                println!("✓ All models and dependencies are present");
                Ok(())
            } else {
                bail!("Some models or dependencies are missing. Run: nataili download --all")
            }
        }
    }
}

fn parse_filter(raw: &str) -> anyhow::Result<(&str, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("Invalid filter '{raw}', expected KEY=VALUE");
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key, value))
}

fn list(manager: &ModelManager, deps: bool, filters: &[String]) -> anyhow::Result<()> {
    let store = manager.manifest();
    let (names, available): (Vec<String>, _) = if deps {
        (
            store.dependencies().names().map(str::to_string).collect(),
            manager.available_dependencies(),
        )
    } else {
        let constraints = filters
            .iter()
            .map(|f| parse_filter(f))
            .collect::<anyhow::Result<Vec<_>>>()?;
        (
            store.filtered_model_names(&constraints),
            manager.available_models(),
        )
    };

    for name in names {
        let marker = if available.contains(&name) { "✓" } else { " " };
        println!("{marker} {name}");
    }
    Ok(())
}

fn status(manager: &ModelManager) {
    let store = manager.manifest();
    println!(
        "Manifest: {} (loaded {})",
        store.source(),
        store.loaded_at().to_rfc3339()
    );
    println!("Base dir: {}", manager.base_dir().display());
    println!(
        "Models: {}/{} available",
        manager.available_models().len(),
        store.models().len()
    );
    println!(
        "Dependencies: {}/{} available",
        manager.available_dependencies().len(),
        store.dependencies().len()
    );
    if !manager.tainted_models().is_empty() {
        println!("Tainted: {:?}", manager.tainted_models());
    }
}

fn download(
    manager: &mut ModelManager,
    names: &[String],
    deps: bool,
    all: bool,
    marked: bool,
) -> anyhow::Result<()> {
    let ok = if marked {
        manager.acquire_everything()?
    } else if all && deps {
        manager.acquire_all_dependencies()?
    } else if all {
        manager.acquire_all()?
    } else if names.is_empty() {
        bail!("Nothing to download. Name an entry or pass --all");
    } else {
        let mut ok = true;
        for name in names {
            let done = if deps {
                manager.acquire_dependency(name)?
            } else {
                manager.acquire_model(name)?
            };
            if done {
                let size: u64 = files_size(manager, name, deps);
                println!("✓ {name} ready ({})", format_bytes(size));
            }
            ok &= done;
        }
        ok
    };

    if !ok {
        bail!("Some downloads failed validation. Run with RUST_LOG=debug for details");
    }
    Ok(())
}

fn files_size(manager: &ModelManager, name: &str, deps: bool) -> u64 {
    let files = if deps {
        manager.dependency_files(name)
    } else {
        manager.model_files(name)
    };
    files
        .unwrap_or_default()
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|m| m.len())
        .sum()
}
