//! CoucheStor DDC command line
//!
//! Operates on a cache described by a graph config file:
//!
//! ```text
//! couchestor-ddc --config ddc.ini get  <key> [--output FILE]
//! couchestor-ddc --config ddc.ini put  <key> <FILE>
//! couchestor-ddc --config ddc.ini stats [--prometheus]
//! couchestor-ddc --config ddc.ini maintain [--boost]
//! couchestor-ddc pak-sort <SRC> <DST>
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchestor_ddc::backend::PakFileStore;
use couchestor_ddc::{metrics, Cache, GraphBuilder, GraphConfig, LegacyKey};

/// Graph used when no config file is given
const DEFAULT_GRAPH: &str = "\
Root=(Type=Hierarchical, Inner=Boot, Inner=Local)
Boot=(Type=Boot, Filename=Boot.ddc, MaxCacheSize=256)
Local=(Type=FileSystem, Path=Local)
";

// =============================================================================
// CLI Arguments
// =============================================================================

/// CoucheStor DDC - multi-tier derived data cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend graph config file
    #[arg(long, env = "DDC_CONFIG")]
    config: Option<PathBuf>,

    /// Section of the config file holding the graph
    #[arg(long, env = "DDC_SECTION")]
    section: Option<String>,

    /// Directory relative cache paths are resolved against
    #[arg(long, env = "DDC_ROOT", default_value = ".")]
    root: PathBuf,

    /// Path for nodes with CommandLineOverride=NAME, as NAME=PATH
    #[arg(long = "path-override", value_parser = parse_override)]
    path_overrides: Vec<(String, PathBuf)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a legacy key
    Get {
        key: String,
        /// Write the data here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Store a file under a legacy key
    Put { key: String, file: PathBuf },
    /// Print usage statistics
    Stats {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
    /// Run one maintenance pass over every file system store
    Maintain {
        /// Ignore the scan rate limit
        #[arg(long)]
        boost: bool,
    },
    /// Copy a pak file with its entries in key order
    PakSort { src: PathBuf, dst: PathBuf },
}

fn parse_override(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got '{}'", value)),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if let Command::PakSort { src, dst } = &args.command {
        let count = PakFileStore::sort_and_copy(src, dst)
            .await
            .with_context(|| format!("failed to sort {}", src.display()))?;
        info!("Copied {} entries to {}", count, dst.display());
        return Ok(());
    }

    let cache = open_cache(&args).await?;
    let result = run(&args, &cache).await;
    cache.shutdown().await;
    result
}

async fn open_cache(args: &Args) -> anyhow::Result<Cache> {
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match &args.section {
                Some(section) => GraphConfig::parse_section(&text, section)?,
                None => GraphConfig::parse(&text)?,
            }
        }
        None => GraphConfig::parse(DEFAULT_GRAPH)?,
    };

    // Maintenance is driven explicitly by the maintain command
    let mut builder = GraphBuilder::new(config)
        .base_dir(&args.root)
        .start_maintainers(false);
    for (name, path) in &args.path_overrides {
        builder = builder.path_override(name.clone(), path.clone());
    }
    let graph = builder.build().await?;
    Ok(Cache::new(graph, tokio::runtime::Handle::current()))
}

async fn run(args: &Args, cache: &Cache) -> anyhow::Result<()> {
    match &args.command {
        Command::Get { key, output } => {
            let Some(data) = cache.get_legacy(&LegacyKey::new(key.clone())).await else {
                bail!("'{}' is not cached", key);
            };
            match output {
                Some(path) => tokio::fs::write(path, &data)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Command::Put { key, file } => {
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let status = cache
                .put_legacy(&LegacyKey::new(key.clone()), Bytes::from(data))
                .await;
            if !status.is_cached() {
                bail!("no tier accepted '{}'", key);
            }
            cache.wait_for_quiescence().await;
            info!("Stored '{}'", key);
        }
        Command::Stats { prometheus } => {
            let stats = cache.usage_stats();
            if *prometheus {
                print!("{}", metrics::encode_prometheus(&stats)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Command::Maintain { boost } => {
            let maintainers = cache.graph().maintainers();
            if maintainers.is_empty() {
                info!("No store has maintenance enabled");
            }
            for maintainer in maintainers {
                if *boost {
                    maintainer.boost_priority();
                }
                maintainer.scan_pass().await;
            }
            for (name, stats) in cache.maintenance_stats() {
                println!("{}: {}", name, serde_json::to_string(&stats)?);
            }
        }
        // Handled before the cache is opened
        Command::PakSort { .. } => {}
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so `get` output stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
