//! Engine façade
//!
//! One handle over the knowledge engine and the coordination layer. Callers
//! never pick between the blackboard and the workflow engine themselves:
//! `submit_task` routes ephemeral work to the blackboard queue and durable
//! work to a workflow run.

use crate::blackboard::{add_finding_and_announce, open_blackboard, Blackboard, BlackboardEntry, EntryKind, NewFinding, NewTask};
use crate::config::EngineConfig;
use crate::db::Store;
use crate::dedup::DedupTracker;
use crate::embeddings::{embedder_from_config, EmbedItem, EmbeddingIndex};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventKind, EventReceiver};
use crate::fraud::{report_history, verify_chain, ChainVerification, FraudDetector, SweepSummary};
use crate::heuristics::{AppliedOutcome, HeuristicFilter, HeuristicService, HeuristicView};
use crate::learnings::LearningService;
use crate::maintenance::Maintenance;
use crate::migrations::{run_migrations, MigrationReport};
use crate::outcome::{get_knowledge_stats, KnowledgeStats};
use crate::retrieval::{Knowledge, RetrievalEngine, RetrievalQuery, RetrievalResult};
use crate::types::{FraudReport, Heuristic, IngressRecord, Learning, LearningKind, NewHeuristic, NewLearning, Outcome};
use crate::workflow::{builtin_definitions, HandlerRegistry, HandlerServices, RunDetail, WorkflowDefinition, WorkflowEngine, WorkflowRun};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Where submitted work goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Durability {
    /// Blackboard task queue; lost on restart, expires with its TTL
    Ephemeral,
    /// A run of the named workflow, recorded in the store
    Durable { workflow: String },
}

/// A unit of work submitted through the façade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub key: String,
    pub submitted_by: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    Queued { entry: BlackboardEntry },
    Started { run_id: String },
}

/// Sessions with no retrieval for this long are forgotten by the sweeper
const MIN_SESSION_IDLE_SECS: i64 = 1800;

#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: Store,
    events: EventBus,
    heuristics: HeuristicService,
    learnings: LearningService,
    retrieval: RetrievalEngine,
    blackboard: Arc<dyn Blackboard>,
    workflows: WorkflowEngine,
}

impl Engine {
    /// Create the data directory, open the store, apply migrations and build
    /// every component. Safe to call again on an initialised directory.
    pub async fn init(config: EngineConfig) -> Result<(Self, MigrationReport)> {
        config.validate()?;
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            EngineError::validation(format!("cannot create data dir {}: {e}", data_dir.display()))
        })?;
        let db_path = config.database_path();
        let store = Store::open(&db_path, &config.store)?;
        info!(db = %db_path.display(), "store opened");
        Self::assemble(config, store).await
    }

    /// Same as `init` over an in-memory store; nothing touches the disk
    /// unless the blackboard is configured as a SQLite file
    pub async fn init_in_memory(config: EngineConfig) -> Result<(Self, MigrationReport)> {
        config.validate()?;
        let store = Store::open_in_memory(&config.store)?;
        Self::assemble(config, store).await
    }

    async fn assemble(config: EngineConfig, store: Store) -> Result<(Self, MigrationReport)> {
        let report = store.call(run_migrations).await?;
        if report.failed.is_empty() {
            info!(applied = ?report.applied, "migrations complete");
        } else {
            warn!(applied = ?report.applied, failed = report.failed.len(), "migrations partially applied");
        }

        let events = EventBus::default();
        let heuristics = HeuristicService::new(
            store.clone(),
            config.promotion.clone(),
            FraudDetector::new(config.fraud.clone(), &config.promotion),
            events.clone(),
        );
        let learnings = LearningService::new(store.clone(), events.clone());

        // model loading may download and read large files
        let embed_config = config.clone();
        let embedder = match tokio::task::spawn_blocking(move || embedder_from_config(&embed_config)).await? {
            Ok(embedder) => embedder,
            Err(e) => {
                warn!(error = %e, "embedding backend unavailable, retrieval will use keyword scoring");
                None
            }
        };
        let retrieval = RetrievalEngine::new(
            heuristics.clone(),
            store.clone(),
            EmbeddingIndex::new(store.clone(), embedder),
            DedupTracker::new(config.dedup.clone()),
            config.retrieval.clone(),
        );
        let blackboard = open_blackboard(&config.blackboard).await?;

        let services = Arc::new(HandlerServices {
            heuristics: heuristics.clone(),
            learnings: learnings.clone(),
            retrieval: retrieval.clone(),
            blackboard: Arc::clone(&blackboard),
            events: events.clone(),
        });
        let workflows = WorkflowEngine::new(
            store.clone(),
            config.workflow.clone(),
            HandlerRegistry::with_builtins(),
            services,
            events.clone(),
        );
        let persisted = workflows.load_persisted().await?;
        for def in builtin_definitions() {
            workflows.register(def).await?;
        }
        info!(persisted, "workflow definitions loaded");

        let engine = Self {
            config,
            store,
            events,
            heuristics,
            learnings,
            retrieval,
            blackboard,
            workflows,
        };

        // fill the vector cache without holding up startup
        if engine.retrieval.index().is_enabled() {
            let warming = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = warming.warm_embeddings().await {
                    warn!(error = %e, "could not warm embeddings");
                }
            });
        }
        Ok((engine, report))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn heuristics(&self) -> &HeuristicService {
        &self.heuristics
    }

    pub fn blackboard(&self) -> &Arc<dyn Blackboard> {
        &self.blackboard
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    // Heuristics

    pub async fn record_heuristic(&self, new: NewHeuristic) -> Result<Heuristic> {
        self.heuristics.record(new).await
    }

    pub async fn apply_outcome(&self, id: &str, outcome: Outcome, note: Option<String>) -> Result<AppliedOutcome> {
        self.heuristics.apply_outcome(id, outcome, note).await
    }

    pub async fn promote(&self, id: &str, justification: &str) -> Result<Heuristic> {
        self.heuristics.promote(id, justification).await
    }

    pub async fn retire(&self, id: &str, reason: &str) -> Result<Heuristic> {
        let retired = self.heuristics.retire(id, reason).await?;
        self.retrieval.index().forget(&format!("h:{id}"));
        Ok(retired)
    }

    /// A heuristic with its latest fraud classification
    pub async fn show(&self, id: &str) -> Result<HeuristicView> {
        self.heuristics.show(id).await
    }

    pub async fn list(&self, filter: HeuristicFilter) -> Result<Vec<HeuristicView>> {
        self.heuristics.list(filter).await
    }

    // Fraud

    pub async fn evaluate_fraud(&self, id: &str) -> Result<FraudReport> {
        self.heuristics.evaluate_fraud(id).await
    }

    pub async fn fraud_sweep(&self) -> Result<SweepSummary> {
        self.heuristics.fraud_sweep().await
    }

    /// Newest first
    pub async fn fraud_history(&self, id: &str, limit: usize) -> Result<Vec<FraudReport>> {
        self.heuristics.get(id).await?;
        let id = id.to_string();
        self.store.call(move |conn| report_history(conn, &id, limit)).await
    }

    pub async fn verify_fraud_chain(&self, id: &str) -> Result<ChainVerification> {
        self.heuristics.get(id).await?;
        let id = id.to_string();
        self.store.call(move |conn| verify_chain(conn, &id)).await
    }

    // Retrieval

    pub async fn query(&self, query: &RetrievalQuery) -> Result<RetrievalResult> {
        self.retrieval.query(query).await
    }

    /// Retrieval for an ingress record from the agent host
    pub async fn ingest(&self, record: IngressRecord) -> Result<RetrievalResult> {
        self.retrieval.query(&RetrievalQuery::from(record)).await
    }

    /// Embed every live heuristic ahead of time; returns how many have
    /// vectors afterwards
    pub async fn warm_embeddings(&self) -> Result<usize> {
        if !self.retrieval.index().is_enabled() {
            return Ok(0);
        }
        let items: Vec<EmbedItem> = self
            .heuristics
            .list(HeuristicFilter::default())
            .await?
            .into_iter()
            .map(|view| {
                let knowledge = Knowledge::Heuristic(view);
                EmbedItem {
                    id: knowledge.item_id(),
                    text: knowledge.text(),
                }
            })
            .collect();
        let computed = self.retrieval.index().warm(&items).await?;
        info!(items = items.len(), computed, "embedding cache warmed");
        Ok(computed)
    }

    // Learnings

    pub async fn record_learning(&self, new: NewLearning) -> Result<Learning> {
        self.learnings.record(new).await
    }

    pub async fn get_learning(&self, id: &str) -> Result<Learning> {
        self.learnings.get(id).await
    }

    pub async fn list_learnings(&self, domain: Option<String>, limit: usize) -> Result<Vec<Learning>> {
        self.learnings.list(domain, limit).await
    }

    pub async fn summarize_learning(&self, id: &str, summary: &str) -> Result<Learning> {
        self.learnings.summarize(id, summary).await
    }

    pub async fn knowledge_stats(&self) -> Result<KnowledgeStats> {
        self.store.call(|conn| get_knowledge_stats(conn)).await
    }

    // Coordination

    pub async fn register_agent(&self, agent_id: &str, task: &str) -> Result<BlackboardEntry> {
        self.blackboard.register_agent(agent_id, task).await
    }

    pub async fn add_finding(&self, finding: NewFinding) -> Result<BlackboardEntry> {
        add_finding_and_announce(self.blackboard.as_ref(), &self.events, finding).await
    }

    pub async fn dequeue_task(&self, agent_id: &str) -> Result<Option<BlackboardEntry>> {
        self.blackboard.dequeue_task(agent_id).await
    }

    pub async fn complete_task(&self, task_id: &str, agent_id: &str, result: serde_json::Value) -> Result<BlackboardEntry> {
        self.blackboard.complete_task(task_id, agent_id, result).await
    }

    pub async fn recent(&self, kind: EntryKind, limit: usize) -> Result<Vec<BlackboardEntry>> {
        self.blackboard.get_recent(kind, limit).await
    }

    /// Keep a finding as a learning once the swarm agrees it matters.
    ///
    /// The finding's key becomes the title; a `heuristic_id` field in its
    /// payload links the learning to that heuristic.
    pub async fn promote_finding(&self, entry_id: &str, domain: &str, kind: LearningKind) -> Result<Learning> {
        let entry = self
            .blackboard
            .get(entry_id)
            .await?
            .filter(|e| e.kind == EntryKind::Finding)
            .ok_or_else(|| EngineError::not_found("finding", entry_id))?;

        let body = match &entry.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => serde_json::to_string_pretty(other)?,
        };
        let heuristic_id = match entry.payload.get("heuristic_id").and_then(|v| v.as_str()) {
            Some(id) => match self.heuristics.get(id).await {
                Ok(h) => Some(h.id),
                // agents write free-form payloads; a stale reference is not worth losing the finding
                Err(EngineError::NotFound { .. }) => {
                    warn!(entry_id = %entry.id, heuristic_id = %id, "finding references an unknown heuristic, dropping the reference");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        self.learnings
            .record(NewLearning {
                domain: domain.to_string(),
                kind,
                title: entry.key.clone(),
                body,
                heuristic_id,
                source_agent: Some(entry.agent_id.clone()),
            })
            .await
    }

    /// Route work by durability
    pub async fn submit_task(&self, task: TaskRequest, durability: Durability) -> Result<Submission> {
        match durability {
            Durability::Ephemeral => {
                let entry = self
                    .blackboard
                    .enqueue_task(NewTask {
                        key: task.key,
                        submitted_by: task.submitted_by,
                        payload: task.payload,
                        ttl: task.ttl_secs.map(Duration::from_secs),
                    })
                    .await?;
                Ok(Submission::Queued { entry })
            }
            Durability::Durable { workflow } => {
                let input = serde_json::json!({
                    "task": task.key,
                    "submitted_by": task.submitted_by,
                    "payload": task.payload,
                });
                let fields = task_fields(&input);
                let input = merge_input(input, &fields);
                let run_id = self.workflows.start(&workflow, input).await?;
                info!(run_id = %run_id, workflow = %workflow, "durable task started");
                Ok(Submission::Started { run_id })
            }
        }
    }

    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.workflows.register(definition).await
    }

    pub fn workflow_definitions(&self) -> Vec<WorkflowDefinition> {
        self.workflows.definitions()
    }

    pub async fn run_workflow(&self, name: &str, input: serde_json::Value) -> Result<RunDetail> {
        self.workflows.run(name, input).await
    }

    pub async fn start_workflow(&self, name: &str, input: serde_json::Value) -> Result<String> {
        self.workflows.start(name, input).await
    }

    pub async fn workflow_run(&self, run_id: &str) -> Result<RunDetail> {
        self.workflows.get_run(run_id).await
    }

    pub async fn workflow_runs(&self, workflow: Option<String>, limit: usize) -> Result<Vec<WorkflowRun>> {
        self.workflows.list_runs(workflow, limit).await
    }

    // Events and maintenance

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn subscribe_kinds(&self, kinds: impl IntoIterator<Item = EventKind>) -> EventReceiver {
        self.events.subscribe_kinds(kinds)
    }

    /// Start the background sweepers; they stop when the handle is shut down
    pub fn start_maintenance(&self) -> Maintenance {
        let idle = (self.config.dedup.window_secs * 2).max(MIN_SESSION_IDLE_SECS);
        Maintenance::start(
            &self.config.maintenance,
            self.heuristics.clone(),
            Arc::clone(&self.blackboard),
            self.retrieval.dedup().clone(),
            chrono::Duration::seconds(idle),
        )
    }
}

/// Top-level payload fields the built-in handlers read as settings
fn task_fields(input: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    input
        .get("payload")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default()
}

/// Payload fields are lifted next to `task` unless they would shadow it
fn merge_input(
    mut input: serde_json::Value,
    fields: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    if let Some(map) = input.as_object_mut() {
        for (k, v) in fields {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::workflow::RunStatus;
    use serde_json::json;

    async fn engine() -> Engine {
        Engine::init_in_memory(EngineConfig::default()).await.unwrap().0
    }

    #[tokio::test]
    async fn test_init_creates_data_dir_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: Some(dir.path().join("nested")),
            ..EngineConfig::default()
        };

        let (engine, first) = Engine::init(config.clone()).await.unwrap();
        assert!(first.failed.is_empty());
        assert!(!first.applied.is_empty());
        assert!(config.database_path().exists());
        drop(engine);

        let (engine, second) = Engine::init(config).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.already_applied, first.applied);
        assert_eq!(engine.workflow_definitions().len(), 2);
    }

    #[tokio::test]
    async fn test_outcomes_and_query_through_facade() {
        let engine = engine().await;
        let h = engine
            .record_heuristic(NewHeuristic::new(
                "rust",
                "Run clippy before every commit to catch lint regressions",
                "cheap and catches real bugs",
            ))
            .await
            .unwrap();
        engine.apply_outcome(&h.id, Outcome::Validated, None).await.unwrap();

        let result = engine
            .ingest(IngressRecord {
                text: "should I run clippy before the commit".into(),
                domain: Some("rust".into()),
                mode: None,
                tool_context: None,
                session_id: None,
            })
            .await
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].id, format!("h:{}", h.id));

        let stats = engine.knowledge_stats().await.unwrap();
        assert_eq!(stats.heuristics, 1);
    }

    #[tokio::test]
    async fn test_promote_finding_to_learning() {
        let engine = engine().await;
        let h = engine
            .record_heuristic(NewHeuristic::new("ci", "Give every CI job its own temp dir", ""))
            .await
            .unwrap();
        let mut rx = engine.subscribe_kinds([EventKind::FindingAdded, EventKind::LearningRecorded]);
        engine.register_agent("scout", "flaky CI").await.unwrap();
        let finding = engine
            .add_finding(NewFinding {
                agent_id: "scout".into(),
                key: "CI flakes come from a shared temp dir".into(),
                payload: json!({ "evidence": "3 runs", "heuristic_id": h.id }),
                ttl: None,
            })
            .await
            .unwrap();

        let learning = engine
            .promote_finding(&finding.id, "ci", LearningKind::Observation)
            .await
            .unwrap();
        assert_eq!(learning.title, "CI flakes come from a shared temp dir");
        assert_eq!(learning.heuristic_id.as_deref(), Some(h.id.as_str()));
        assert_eq!(learning.source_agent.as_deref(), Some("scout"));
        assert!(learning.body.contains("3 runs"));

        assert!(matches!(rx.recv().await.unwrap().payload, EventPayload::FindingAdded { .. }));
        assert!(matches!(rx.recv().await.unwrap().payload, EventPayload::LearningRecorded { .. }));

        assert!(matches!(
            engine.promote_finding("missing", "ci", LearningKind::Observation).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_promote_finding_drops_unknown_heuristic_reference() {
        let engine = engine().await;
        let finding = engine
            .add_finding(NewFinding {
                agent_id: "scout".into(),
                key: "Retries hide the real timeout".into(),
                payload: json!({ "heuristic_id": "h-gone" }),
                ttl: None,
            })
            .await
            .unwrap();

        let learning = engine
            .promote_finding(&finding.id, "backend", LearningKind::Failure)
            .await
            .unwrap();
        assert_eq!(learning.heuristic_id, None);
        assert_eq!(learning.title, "Retries hide the real timeout");
        assert!(learning.body.contains("h-gone"));
    }

    #[tokio::test]
    async fn test_submit_task_routes_by_durability() {
        let engine = engine().await;
        let task = TaskRequest {
            key: "triage".into(),
            submitted_by: "lead".into(),
            payload: json!({ "query": "flaky tests", "domain": "ci", "title": "triage" }),
            ttl_secs: None,
        };

        let queued = engine.submit_task(task.clone(), Durability::Ephemeral).await.unwrap();
        let Submission::Queued { entry } = queued else {
            panic!("expected a queued task");
        };
        let claimed = engine.dequeue_task("worker").await.unwrap().unwrap();
        assert_eq!(claimed.id, entry.id);

        let mut rx = engine.subscribe_kinds([EventKind::WorkflowCompleted]);
        let started = engine
            .submit_task(
                task,
                Durability::Durable {
                    workflow: "swarm-investigation".into(),
                },
            )
            .await
            .unwrap();
        let Submission::Started { run_id } = started else {
            panic!("expected a workflow run");
        };
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

        let detail = engine.workflow_run(&run_id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed, "{detail:?}");
        assert_eq!(detail.run.input["query"], "flaky tests");
        // no findings yet, so nothing is recorded
        assert_eq!(detail.node("record").unwrap().status.as_str(), "skipped");
    }

    #[test]
    fn test_merge_input_keeps_reserved_fields() {
        let input = json!({ "task": "t", "payload": { "task": "shadow", "query": "q" } });
        let merged = merge_input(input.clone(), &task_fields(&input));
        assert_eq!(merged["task"], "t");
        assert_eq!(merged["query"], "q");
    }
}
