//! Import heuristic packs
//!
//! Usage: cargo run --bin import -- /path/to/packs [more dirs...]
//!
//! A pack is a JSON file `{"domain": "...", "heuristics": [...]}` where each
//! heuristic is either `{"rule", "explanation"}` or a plain string, split on
//! the first `": "` into rule and explanation.

use anyhow::{Context, Result};
use clap::Parser;
use heuristic_engine::{BlockingEngine, EngineConfig, EngineError, NewHeuristic};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "import", about = "Record heuristics from JSON packs")]
struct Args {
    /// Directories searched recursively for *.json packs
    #[arg(required = true)]
    dirs: Vec<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parse and report without recording anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct Pack {
    #[serde(alias = "category")]
    domain: String,
    #[serde(alias = "rules")]
    heuristics: Vec<PackEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PackEntry {
    Object {
        #[serde(alias = "heuristic")]
        rule: String,
        #[serde(default, alias = "why")]
        explanation: String,
    },
    String(String),
}

impl PackEntry {
    fn rule_and_explanation(&self) -> (String, String) {
        match self {
            PackEntry::Object { rule, explanation } => (rule.trim().to_string(), explanation.trim().to_string()),
            PackEntry::String(s) => match s.split_once(": ") {
                Some((rule, why)) => (rule.trim().to_string(), why.trim().to_string()),
                None => (s.trim().to_string(), String::new()),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    packs: usize,
    recorded: usize,
    skipped: usize,
    failed_packs: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref()).context("loading config")?;
    let engine = if args.dry_run {
        None
    } else {
        let engine = BlockingEngine::init(config).context("initialising engine")?;
        println!("Database: {}", engine.engine().config().database_path().display());
        Some(engine)
    };

    let mut totals = Totals::default();
    for dir in &args.dirs {
        if !dir.exists() {
            eprintln!("Warning: {} does not exist, skipping", dir.display());
            continue;
        }
        println!("\nProcessing: {}", dir.display());
        import_directory(engine.as_ref(), dir, &mut totals);
    }

    println!("\n========================================");
    println!("Import complete{}", if args.dry_run { " (dry run)" } else { "" });
    println!("  Packs:    {}", totals.packs);
    println!("  Recorded: {}", totals.recorded);
    println!("  Skipped:  {}", totals.skipped);
    if totals.failed_packs > 0 {
        println!("  Unreadable packs: {}", totals.failed_packs);
    }
    println!("========================================");
    Ok(())
}

fn import_directory(engine: Option<&BlockingEngine>, dir: &Path, totals: &mut Totals) {
    let packs = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|ext| ext == "json"));

    for entry in packs {
        let path = entry.path();
        match read_pack(path) {
            Ok(pack) => {
                totals.packs += 1;
                let (recorded, skipped) = match engine {
                    Some(engine) => record_pack(engine, &pack),
                    None => (pack.heuristics.len(), 0),
                };
                totals.recorded += recorded;
                totals.skipped += skipped;
                println!("  ✓ {} [{}] {} recorded, {} skipped", path.display(), pack.domain, recorded, skipped);
            }
            Err(e) => {
                totals.failed_packs += 1;
                eprintln!("  ✗ {}: {e:#}", path.display());
            }
        }
    }
}

fn read_pack(path: &Path) -> Result<Pack> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_pack(&raw)
}

fn parse_pack(raw: &str) -> Result<Pack> {
    let pack: Pack = serde_json::from_str(raw).context("not a heuristic pack")?;
    anyhow::ensure!(!pack.domain.trim().is_empty(), "pack has an empty domain");
    Ok(pack)
}

/// Duplicates and too-short rules are skipped, not fatal
fn record_pack(engine: &BlockingEngine, pack: &Pack) -> (usize, usize) {
    let mut recorded = 0;
    let mut skipped = 0;
    for entry in &pack.heuristics {
        let (rule, explanation) = entry.rule_and_explanation();
        match engine.record(NewHeuristic::new(&pack.domain, &rule, &explanation)) {
            Ok(h) => {
                info!(heuristic_id = %h.id, domain = %h.domain, "imported");
                recorded += 1;
            }
            Err(EngineError::Validation(reason)) => {
                warn!(domain = %pack.domain, %rule, %reason, "skipped");
                skipped += 1;
            }
            Err(e) => {
                warn!(domain = %pack.domain, %rule, error = %e, "could not record");
                skipped += 1;
            }
        }
    }
    (recorded, skipped)
}
