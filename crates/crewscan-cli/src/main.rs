use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crewscan_core::OnnxOracle;
use crewscan_engine::{
    report, CoOccurrenceGraph, Config, Enrollment, IdentityRegistry, ScanResult, Scanner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Dump file name used for images at the scan root.
const ROOT_DUMP_NAME: &str = "origin";
const DUMP_SUFFIX: &str = "_result.json";

#[derive(Parser)]
#[command(name = "crewscan", about = "Find enrolled people in photo collections")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "CREWSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll every portrait in a directory
    Train {
        /// Directory of portraits named <first>_[<middle>_]<last>&<country>.jpg
        dir: PathBuf,
    },
    /// Enroll a single portrait
    Enroll {
        image: PathBuf,
    },
    /// Scan a directory for enrolled people
    Scan {
        dir: PathBuf,
        /// Write <dump>/<directory>_result.json per scanned directory
        #[arg(short, long)]
        dump: Option<PathBuf>,
        /// Descend into sub-directories
        #[arg(short, long)]
        recursive: bool,
        /// Maximum images processed at once
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// List enrolled identities
    List,
    /// Co-occurrence report over dumped scan results
    Report {
        /// Directory holding *_result.json dumps
        dump: PathBuf,
        #[arg(long, default_value_t = report::DEFAULT_MIN_SUPPORT)]
        min_support: f64,
        #[arg(long, default_value_t = report::DEFAULT_MIN_CONFIDENCE)]
        min_confidence: f64,
        /// Also write the co-occurrence graph as Graphviz DOT
        #[arg(short, long)]
        graph: Option<PathBuf>,
        /// Limit the graph to identities in frequent pairs
        #[arg(long, requires = "graph")]
        frequent_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Train { dir } => {
            let mut scanner = open_scanner(config)?;
            let report = scanner
                .train_dir(&dir)
                .await
                .with_context(|| format!("training on {}", dir.display()))?;
            println!(
                "Enrolled {}, already known {}, failed {}",
                report.enrolled.len(),
                report.already_known.len(),
                report.failures.len()
            );
            for key in &report.enrolled {
                println!("  + {key}");
            }
        }
        Commands::Enroll { image } => {
            let oracle = load_oracle(&config)?;
            let store = config.open_store().context("failed to open identity store")?;
            let mut registry = IdentityRegistry::hydrate(store).context("failed to load identities")?;
            match registry
                .enroll_from_image(&image, oracle.as_ref())
                .with_context(|| format!("enrolling {}", image.display()))?
            {
                Enrollment::Enrolled => println!("Enrolled {}", image.display()),
                Enrollment::AlreadyKnown => println!("Already enrolled: {}", image.display()),
            }
        }
        Commands::Scan {
            dir,
            dump,
            recursive,
            workers,
        } => {
            config.recursive |= recursive;
            if let Some(workers) = workers {
                config.workers = workers;
            }

            let scanner = open_scanner(config)?;
            let report = scanner
                .scan(&dir)
                .await
                .with_context(|| format!("scanning {}", dir.display()))?;

            println!(
                "Scanned {}: {} images with faces, {} failures",
                dir.display(),
                report.results.len(),
                report.failures.len()
            );
            match dump {
                Some(dump) => write_dumps(&dump, &report.results)?,
                None => println!("{}", serde_json::to_string_pretty(&report.results)?),
            }
        }
        Commands::List => {
            let store = config.open_store().context("failed to open identity store")?;
            let registry = IdentityRegistry::hydrate(store).context("failed to load identities")?;
            if registry.is_empty() {
                println!("No identities enrolled");
            }
            for identity in registry.lookup_all() {
                println!(
                    "{:<32} {:<28} {:<12} {}",
                    identity.key,
                    identity.display_name(),
                    identity.country,
                    if identity.is_trained() { "trained" } else { "untrained" }
                );
            }
        }
        Commands::Report {
            dump,
            min_support,
            min_confidence,
            graph,
            frequent_only,
        } => {
            let results = load_dumps(&dump)?;
            let pairs = report::frequent_pairs(&results, min_support, min_confidence);
            if let Some(path) = graph {
                let mut co_occurrence = CoOccurrenceGraph::new(&results);
                if frequent_only {
                    co_occurrence = co_occurrence.limit_to(&pairs);
                }
                std::fs::write(&path, co_occurrence.to_string())
                    .with_context(|| format!("failed to write {}", path.display()))?;
                tracing::info!(
                    path = %path.display(),
                    nodes = co_occurrence.node_count(),
                    edges = co_occurrence.edge_count(),
                    "graph written"
                );
            }
            let summary = serde_json::json!({
                "images": results.len(),
                "raw_frequencies": report::raw_frequencies(&results),
                "frequent_pairs": pairs,
                "names_by_country": report::names_by_country(&results),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn load_oracle(config: &Config) -> Result<Arc<OnnxOracle>> {
    let oracle = OnnxOracle::load(&config.model_dir, config.similarity_threshold)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    Ok(Arc::new(oracle))
}

fn open_scanner(config: Config) -> Result<Scanner> {
    let oracle = load_oracle(&config)?;
    Scanner::open(config, oracle).context("failed to open identity registry")
}

fn dump_name(dir: &str) -> String {
    if dir.is_empty() {
        format!("{ROOT_DUMP_NAME}{DUMP_SUFFIX}")
    } else {
        format!("{}{DUMP_SUFFIX}", dir.replace('/', "_"))
    }
}

fn write_dumps(dump: &Path, results: &ScanResult) -> Result<()> {
    std::fs::create_dir_all(dump)
        .with_context(|| format!("failed to create {}", dump.display()))?;
    for (dir, group) in results.by_directory() {
        let path = dump.join(dump_name(&dir));
        let json = serde_json::to_vec_pretty(&group)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), images = group.len(), "results written");
    }
    Ok(())
}

fn load_dumps(dump: &Path) -> Result<ScanResult> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dump)
        .with_context(|| format!("failed to read {}", dump.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(DUMP_SUFFIX))
        })
        .collect();
    paths.sort();

    let mut results = ScanResult::default();
    for path in paths {
        let bytes = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let dumped: ScanResult = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        results.merge(dumped);
    }
    Ok(results)
}
