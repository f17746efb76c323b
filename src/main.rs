//! Heuristic Engine CLI
//!
//! Knowledge and coordination for autonomous task agents.
//!
//! Run with: cargo run -- <command>
//! Logging: RUST_LOG=debug, `--log-json` for machine-readable logs on stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use heuristic_engine::blackboard::{EntryKind, NewFinding};
use heuristic_engine::config::BlackboardBackend;
use heuristic_engine::engine::{Durability, Submission, TaskRequest};
use heuristic_engine::heuristics::{HeuristicFilter, HeuristicView};
use heuristic_engine::migrations::MigrationReport;
use heuristic_engine::outcome::print_knowledge_stats;
use heuristic_engine::retrieval::{Knowledge, RetrievalQuery, RetrievalResult};
use heuristic_engine::types::{FraudReport, LearningKind, Mode, NewHeuristic, NewLearning, Outcome};
use heuristic_engine::workflow::RunDetail;
use heuristic_engine::{Engine, EngineConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "heuristic-engine", version, about = "Heuristic knowledge engine for autonomous agents")]
struct Cli {
    /// JSON config file (defaults, then this file, then HEURISTIC_ENGINE_* env vars)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the data directory and apply schema migrations
    Migrate,
    /// Record a new heuristic
    Record(RecordArgs),
    /// Report an outcome against a heuristic
    Outcome {
        id: String,
        /// validated | violated | contradicted
        outcome: Outcome,
        #[arg(long)]
        note: Option<String>,
    },
    /// Promote a heuristic to golden
    Promote {
        id: String,
        #[arg(long)]
        justification: String,
    },
    /// Retire a heuristic (history is kept)
    Retire {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Show a heuristic with its fraud classification
    Show {
        id: String,
        /// Also list this many past fraud reports
        #[arg(long, default_value_t = 0)]
        history: usize,
        /// Verify the fraud report hash chain
        #[arg(long)]
        verify: bool,
    },
    /// List heuristics, highest confidence first
    List {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        golden: bool,
        /// Include retired heuristics
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Retrieve heuristics relevant to some text
    Query(QueryArgs),
    /// Run a fraud evaluation for one heuristic
    Fraud { id: String },
    /// Run a fraud evaluation for every heuristic with applications
    Sweep,
    /// Episodic learnings
    #[command(subcommand)]
    Learn(LearnCommand),
    /// Knowledge base statistics
    Stats,
    /// Shared blackboard
    #[command(subcommand)]
    Blackboard(BlackboardCommand),
    /// Workflow definitions and runs
    #[command(subcommand)]
    Workflow(WorkflowCommand),
    /// Run background maintenance until Ctrl-C
    Maintain,
}

#[derive(Debug, Args)]
struct RecordArgs {
    #[arg(long)]
    domain: String,
    #[arg(long)]
    rule: String,
    #[arg(long, default_value = "")]
    explanation: String,
    /// Make the heuristic global; requires a justification
    #[arg(long, value_name = "JUSTIFICATION")]
    global: Option<String>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// Text to match, usually the agent's latest reasoning
    #[arg(required = true)]
    text: Vec<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    mode: Option<Mode>,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    top_k: Option<usize>,
    /// Also search learnings
    #[arg(long)]
    learnings: bool,
    /// Show results even if they were shown recently
    #[arg(long)]
    no_dedup: bool,
}

#[derive(Debug, Subcommand)]
enum LearnCommand {
    /// Record a learning
    Add {
        #[arg(long)]
        domain: String,
        /// success | failure | observation
        #[arg(long, default_value = "observation")]
        kind: LearningKind,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        heuristic: Option<String>,
    },
    List {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show { id: String },
    /// Attach the one-time summary
    Summarize { id: String, summary: String },
}

#[derive(Debug, Subcommand)]
enum BlackboardCommand {
    /// Register an agent working on a task
    Register { agent: String, task: String },
    /// Post a finding
    Finding {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        key: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Queue a task, or start it as a workflow run with --workflow
    Enqueue {
        key: String,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Claim the oldest open task
    Dequeue { agent: String },
    /// Newest entries of one kind
    Recent {
        /// agents | findings | tasks | messages
        kind: EntryKind,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Keep a finding as a learning
    Promote {
        entry: String,
        #[arg(long)]
        domain: String,
        #[arg(long, default_value = "observation")]
        kind: LearningKind,
    },
}

#[derive(Debug, Subcommand)]
enum WorkflowCommand {
    /// Registered definitions
    List,
    /// Run a workflow to completion
    Run {
        name: String,
        /// JSON run input
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Show a run with its nodes
    Show { run_id: String },
    /// Recent runs
    Runs {
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = EngineConfig::load(cli.config.as_deref()).context("loading config")?;
    let (engine, report) = Engine::init(config).await.context("initialising engine")?;
    let json = cli.json;

    match cli.command {
        Command::Migrate => emit(json, &report, print_migration_report),
        Command::Record(args) => {
            let mut new = NewHeuristic::new(&args.domain, &args.rule, &args.explanation);
            if let Some(justification) = &args.global {
                new = new.global(justification);
            }
            let h = engine.record_heuristic(new).await?;
            emit(json, &h, |h| {
                println!("Recorded {} [{}] at {:.0}% confidence", h.id, h.domain, h.confidence * 100.0);
            })
        }
        Command::Outcome { id, outcome, note } => {
            let applied = engine.apply_outcome(&id, outcome, note).await?;
            emit(json, &applied, |a| {
                let arrow = if a.heuristic.confidence >= a.previous_confidence { "↑" } else { "↓" };
                println!(
                    "{} {}: {:.0}% {} {:.0}%",
                    a.outcome,
                    a.heuristic.id,
                    a.previous_confidence * 100.0,
                    arrow,
                    a.heuristic.confidence * 100.0
                );
                if a.promoted {
                    println!("   ★ now golden");
                }
                if a.demoted {
                    println!("   demoted from golden");
                }
                if let Some(report) = &a.fraud_report {
                    println!("   fraud check: {} ({:.2})", report.classification, report.composite_score);
                }
            })
        }
        Command::Promote { id, justification } => {
            let h = engine.promote(&id, &justification).await?;
            emit(json, &h, |h| println!("★ {} is golden ({:.0}%)", h.id, h.confidence * 100.0))
        }
        Command::Retire { id, reason } => {
            let h = engine.retire(&id, &reason).await?;
            emit(json, &h, |h| println!("Retired {}", h.id))
        }
        Command::Show { id, history, verify } => {
            let view = engine.show(&id).await?;
            emit(json, &view, print_heuristic)?;
            if history > 0 {
                let reports = engine.fraud_history(&id, history).await?;
                emit(json, &reports, |r| print_reports(r))?;
            }
            if verify {
                let chain = engine.verify_fraud_chain(&id).await?;
                emit(json, &chain, |c| {
                    if c.valid {
                        println!("Report chain intact ({} reports)", c.chain_length);
                    } else {
                        println!("Report chain BROKEN:");
                        for e in &c.errors {
                            println!("   {e}");
                        }
                    }
                })?;
            }
            Ok(())
        }
        Command::List {
            domain,
            golden,
            all,
            limit,
        } => {
            let views = engine
                .list(HeuristicFilter {
                    domain,
                    golden_only: golden,
                    include_retired: all,
                    limit,
                })
                .await?;
            emit(json, &views, |views| {
                if views.is_empty() {
                    println!("No heuristics yet.");
                }
                for v in views {
                    print_heuristic_line(v);
                }
            })
        }
        Command::Query(args) => {
            let mut query = RetrievalQuery::new(args.text.join(" "));
            query.domain = args.domain;
            query.mode = args.mode.unwrap_or_default();
            query.session_id = args.session;
            query.top_k = args.top_k;
            query.include_learnings = args.learnings;
            query.exclude_recently_shown = !args.no_dedup;
            let result = engine.query(&query).await?;
            emit(json, &result, print_retrieval)
        }
        Command::Fraud { id } => {
            let report = engine.evaluate_fraud(&id).await?;
            emit(json, &report, |r| print_reports(std::slice::from_ref(r)))
        }
        Command::Sweep => {
            let summary = engine.fraud_sweep().await?;
            emit(json, &summary, |s| {
                println!(
                    "Evaluated {}: {} clean, {} suspicious, {} fraudulent, {} failed",
                    s.evaluated, s.clean, s.suspicious, s.fraudulent, s.failed
                );
            })
        }
        Command::Learn(cmd) => run_learn(&engine, cmd, json).await,
        Command::Stats => {
            let stats = engine.knowledge_stats().await?;
            emit(json, &stats, print_knowledge_stats)
        }
        Command::Blackboard(cmd) => run_blackboard(&engine, cmd, json).await,
        Command::Workflow(cmd) => run_workflow(&engine, cmd, json).await,
        Command::Maintain => run_maintain(&engine).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// JSON on stdout, or the human rendering
fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON: {raw}"))
}

async fn run_learn(engine: &Engine, cmd: LearnCommand, json: bool) -> Result<()> {
    match cmd {
        LearnCommand::Add {
            domain,
            kind,
            title,
            body,
            heuristic,
        } => {
            let learning = engine
                .record_learning(NewLearning {
                    domain,
                    kind,
                    title,
                    body,
                    heuristic_id: heuristic,
                    source_agent: Some("cli".into()),
                })
                .await?;
            emit(json, &learning, |l| println!("Recorded learning {}", l.id))
        }
        LearnCommand::List { domain, limit } => {
            let learnings = engine.list_learnings(domain, limit).await?;
            emit(json, &learnings, |ls| {
                for l in ls {
                    println!("{} [{}] {:<11} {}", l.id, l.domain, l.kind.as_str(), l.title);
                }
            })
        }
        LearnCommand::Show { id } => {
            let learning = engine.get_learning(&id).await?;
            emit(json, &learning, |l| {
                println!("{} ({}, {})", l.title, l.kind.as_str(), l.domain);
                if !l.body.is_empty() {
                    println!("\n{}", l.body);
                }
                if let Some(summary) = &l.summary {
                    println!("\nSummary: {summary}");
                }
            })
        }
        LearnCommand::Summarize { id, summary } => {
            let learning = engine.summarize_learning(&id, &summary).await?;
            emit(json, &learning, |l| println!("Summarized {}", l.id))
        }
    }
}

async fn run_blackboard(engine: &Engine, cmd: BlackboardCommand, json: bool) -> Result<()> {
    if matches!(engine.config().blackboard.backend, BlackboardBackend::Memory) {
        tracing::warn!("blackboard backend is in-memory; entries vanish when this command exits");
    }
    match cmd {
        BlackboardCommand::Register { agent, task } => {
            let entry = engine.register_agent(&agent, &task).await?;
            emit(json, &entry, |e| println!("Registered {} until {}", e.key, e.expires_at))
        }
        BlackboardCommand::Finding { agent, key, payload } => {
            let entry = engine
                .add_finding(NewFinding {
                    agent_id: agent,
                    key,
                    payload: parse_json(&payload)?,
                    ttl: None,
                })
                .await?;
            emit(json, &entry, |e| println!("Finding {} posted", e.id))
        }
        BlackboardCommand::Enqueue {
            key,
            by,
            payload,
            workflow,
        } => {
            let task = TaskRequest {
                key,
                submitted_by: by,
                payload: parse_json(&payload)?,
                ttl_secs: None,
            };
            let durability = match workflow {
                Some(workflow) => Durability::Durable { workflow },
                None => Durability::Ephemeral,
            };
            let submission = engine.submit_task(task, durability).await?;
            emit(json, &submission, |s| match s {
                Submission::Queued { entry } => println!("Queued task {}", entry.id),
                Submission::Started { run_id } => println!("Started workflow run {run_id}"),
            })
        }
        BlackboardCommand::Dequeue { agent } => {
            let task = engine.dequeue_task(&agent).await?;
            emit(json, &task, |t| match t {
                Some(t) => println!("Claimed {} ({}): {}", t.id, t.key, t.payload),
                None => println!("No open tasks."),
            })
        }
        BlackboardCommand::Recent { kind, limit } => {
            let entries = engine.recent(kind, limit).await?;
            emit(json, &entries, |entries| {
                for e in entries {
                    println!("{} {:<8} {} by {}: {}", e.created_at.format("%H:%M:%S"), e.kind.as_str(), e.key, e.agent_id, e.payload);
                }
            })
        }
        BlackboardCommand::Promote { entry, domain, kind } => {
            let learning = engine.promote_finding(&entry, &domain, kind).await?;
            emit(json, &learning, |l| println!("Finding kept as learning {}", l.id))
        }
    }
}

async fn run_workflow(engine: &Engine, cmd: WorkflowCommand, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::List => {
            let defs = engine.workflow_definitions();
            emit(json, &defs, |defs| {
                for d in defs {
                    println!("{:<24} {} nodes  {}", d.name, d.nodes.len(), d.description);
                }
            })
        }
        WorkflowCommand::Run { name, input } => {
            let detail = engine.run_workflow(&name, parse_json(&input)?).await?;
            emit(json, &detail, print_run)
        }
        WorkflowCommand::Show { run_id } => {
            let detail = engine.workflow_run(&run_id).await?;
            emit(json, &detail, print_run)
        }
        WorkflowCommand::Runs { workflow, limit } => {
            let runs = engine.workflow_runs(workflow, limit).await?;
            emit(json, &runs, |runs| {
                for r in runs {
                    println!("{} {:<24} {:<9} {}", r.id, r.workflow, r.status.to_string(), r.created_at.format("%Y-%m-%d %H:%M"));
                }
            })
        }
    }
}

async fn run_maintain(engine: &Engine) -> Result<()> {
    match engine.warm_embeddings().await {
        Ok(ready) => tracing::info!(ready, "embeddings ready"),
        Err(e) => tracing::warn!(error = %e, "could not warm embeddings"),
    }
    let maintenance = engine.start_maintenance();
    println!("Maintenance running. Ctrl-C to stop.");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    maintenance.shutdown().await;
    println!("Stopped.");
    Ok(())
}

fn print_migration_report(report: &MigrationReport) {
    println!("Schema: {:?}", report.status);
    if !report.applied.is_empty() {
        println!("   applied: {:?}", report.applied);
    }
    if !report.already_applied.is_empty() {
        println!("   already present: {:?}", report.already_applied);
    }
    for f in &report.failed {
        println!("   FAILED {} {}: {}", f.version, f.name, f.error);
    }
}

fn confidence_bar(confidence: f64) -> String {
    let filled = (confidence.clamp(0.0, 1.0) * 10.0).round() as usize;
    format!("{:.<10}", "█".repeat(filled))
}

fn print_heuristic_line(view: &HeuristicView) {
    let h = &view.heuristic;
    let star = if h.is_golden { "★" } else { " " };
    let fraud = view
        .fraud
        .as_ref()
        .map(|f| format!(" [{}]", f.classification))
        .unwrap_or_default();
    println!(
        "{star} [{}] {:.0}% {} {}{fraud}\n     {}",
        confidence_bar(h.confidence),
        h.confidence * 100.0,
        h.domain,
        h.id,
        h.rule
    );
}

fn print_heuristic(view: &HeuristicView) {
    let h = &view.heuristic;
    println!("\n{}{}", if h.is_golden { "★ " } else { "" }, h.rule);
    if !h.explanation.is_empty() {
        println!("   {}", h.explanation);
    }
    println!();
    println!("   id:          {}", h.id);
    println!("   domain:      {} ({} scope)", h.domain, h.scope.as_str());
    println!("   confidence:  [{}] {:.0}%", confidence_bar(h.confidence), h.confidence * 100.0);
    println!(
        "   outcomes:    {} validated, {} violated, {} contradicted",
        h.times_validated, h.times_violated, h.times_contradicted
    );
    match &view.fraud {
        Some(f) => println!(
            "   fraud:       {} (composite {:.2}, p={:.2}, {})",
            f.classification,
            f.composite_score,
            f.fraud_probability,
            f.assessed_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("   fraud:       not assessed"),
    }
    if let Some(reason) = &h.retired_reason {
        println!("   retired:     {reason}");
    }
}

fn print_reports(reports: &[FraudReport]) {
    for r in reports {
        println!(
            "\n{} {} composite {:.2}  LR {:.2}  p(fraud) {:.2}",
            r.created_at.format("%Y-%m-%d %H:%M"),
            r.classification,
            r.composite_score,
            r.likelihood_ratio,
            r.fraud_probability
        );
        for s in &r.signals {
            let detail = s.detail.as_deref().unwrap_or("");
            if s.skipped {
                println!("   {:<20} skipped  {detail}", s.name);
            } else {
                println!("   {:<20} {:.2} x{:.2}  {detail}", s.name, s.score, s.weight);
            }
        }
    }
}

fn print_retrieval(result: &RetrievalResult) {
    if result.items.is_empty() {
        println!("Nothing relevant ({} candidates, {} suppressed).", result.candidates, result.suppressed);
        return;
    }
    for (i, item) in result.items.iter().enumerate() {
        match &item.knowledge {
            Knowledge::Heuristic(v) => {
                let star = if v.heuristic.is_golden { "★" } else { " " };
                println!("{}. {star} {:.2}  {}", i + 1, item.score, v.heuristic.rule);
                println!("         {}", v.heuristic.id);
            }
            Knowledge::Learning(l) => {
                println!("{}.   {:.2}  (learning) {}", i + 1, item.score, l.title);
                println!("         {}", l.id);
            }
        }
    }
    println!(
        "\n{:?} match over {} candidates in {}ms, {} suppressed",
        result.method, result.candidates, result.elapsed_ms, result.suppressed
    );
}

fn print_run(detail: &RunDetail) {
    let run = &detail.run;
    println!("{} {} {}", run.workflow, run.id, run.status);
    if let (Some(node), Some(error)) = (&run.failed_node, &run.error) {
        println!("   failed at {node}: {error}");
    }
    for n in &detail.nodes {
        println!("   {:<20} {:<9} attempts {}", n.node_id, n.status.to_string(), n.attempts);
        for note in &n.notes {
            println!("      - {note}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_outcome_and_global_flags() {
        let cli = Cli::try_parse_from(["heuristic-engine", "outcome", "h1", "violated", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Command::Outcome {
                outcome: Outcome::Violated,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["heuristic-engine", "outcome", "h1", "maybe"]).is_err());
    }

    #[test]
    fn test_confidence_bar_is_fixed_width() {
        assert_eq!(confidence_bar(0.0), "..........");
        assert_eq!(confidence_bar(1.0).chars().count(), 10);
        assert_eq!(confidence_bar(0.5), "█████.....");
    }
}
