//! Blocking adapter for synchronous callers
//!
//! Agent hosts without an async runtime hold one `BlockingEngine` for the
//! life of the process. It owns a tokio runtime and blocks on the async core,
//! so it must not be used from inside another runtime.
//!
//! ```rust,ignore
//! let engine = BlockingEngine::init(EngineConfig::load(None)?)?;
//! let hints = engine.suggest("about to bump serde across the workspace", Some("rust"))?;
//! // ... agent works ...
//! engine.apply_outcome(&hints[0].heuristic_id, Outcome::Validated, None)?;
//! ```

use crate::blackboard::{BlackboardEntry, NewFinding};
use crate::config::EngineConfig;
use crate::engine::{Durability, Engine, Submission, TaskRequest};
use crate::error::Result;
use crate::heuristics::{AppliedOutcome, HeuristicFilter, HeuristicView};
use crate::migrations::MigrationReport;
use crate::outcome::KnowledgeStats;
use crate::retrieval::{Knowledge, RetrievalQuery, RetrievalResult};
use crate::types::{Heuristic, IngressRecord, Learning, NewHeuristic, NewLearning, Outcome};
use crate::workflow::RunDetail;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

/// A retrieved heuristic without the ranking details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suggestion {
    pub heuristic_id: String,
    pub rule: String,
    pub explanation: String,
    pub golden: bool,
    pub score: f32,
}

pub struct BlockingEngine {
    runtime: Runtime,
    engine: Engine,
    report: MigrationReport,
}

impl BlockingEngine {
    pub fn init(config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("heuristic-engine")
            .build()
            .map_err(|e| anyhow::anyhow!("cannot start runtime: {e}"))?;
        let (engine, report) = runtime.block_on(Engine::init(config))?;
        Ok(Self {
            runtime,
            engine,
            report,
        })
    }

    /// In-memory store; for tests and throwaway sessions
    pub fn init_in_memory(config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow::anyhow!("cannot start runtime: {e}"))?;
        let (engine, report) = runtime.block_on(Engine::init_in_memory(config))?;
        Ok(Self {
            runtime,
            engine,
            report,
        })
    }

    /// Migration report from startup
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    /// The async core, for callers that also run their own tasks on it
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn record(&self, new: NewHeuristic) -> Result<Heuristic> {
        self.runtime.block_on(self.engine.record_heuristic(new))
    }

    pub fn apply_outcome(&self, id: &str, outcome: Outcome, note: Option<String>) -> Result<AppliedOutcome> {
        self.runtime.block_on(self.engine.apply_outcome(id, outcome, note))
    }

    pub fn promote(&self, id: &str, justification: &str) -> Result<Heuristic> {
        self.runtime.block_on(self.engine.promote(id, justification))
    }

    pub fn retire(&self, id: &str, reason: &str) -> Result<Heuristic> {
        self.runtime.block_on(self.engine.retire(id, reason))
    }

    pub fn show(&self, id: &str) -> Result<HeuristicView> {
        self.runtime.block_on(self.engine.show(id))
    }

    pub fn list(&self, filter: HeuristicFilter) -> Result<Vec<HeuristicView>> {
        self.runtime.block_on(self.engine.list(filter))
    }

    pub fn query(&self, query: &RetrievalQuery) -> Result<RetrievalResult> {
        self.runtime.block_on(self.engine.query(query))
    }

    pub fn ingest(&self, record: IngressRecord) -> Result<RetrievalResult> {
        self.runtime.block_on(self.engine.ingest(record))
    }

    /// Heuristics only, flattened for quick prompts
    pub fn suggest(&self, text: &str, domain: Option<&str>) -> Result<Vec<Suggestion>> {
        let mut query = RetrievalQuery::new(text);
        query.domain = domain.map(str::to_string);
        let result = self.query(&query)?;
        Ok(result
            .items
            .into_iter()
            .filter_map(|item| match item.knowledge {
                Knowledge::Heuristic(view) => Some(Suggestion {
                    heuristic_id: view.heuristic.id,
                    rule: view.heuristic.rule,
                    explanation: view.heuristic.explanation,
                    golden: view.heuristic.is_golden,
                    score: item.score,
                }),
                Knowledge::Learning(_) => None,
            })
            .collect())
    }

    pub fn record_learning(&self, new: NewLearning) -> Result<Learning> {
        self.runtime.block_on(self.engine.record_learning(new))
    }

    pub fn knowledge_stats(&self) -> Result<KnowledgeStats> {
        self.runtime.block_on(self.engine.knowledge_stats())
    }

    pub fn add_finding(&self, finding: NewFinding) -> Result<BlackboardEntry> {
        self.runtime.block_on(self.engine.add_finding(finding))
    }

    pub fn submit_task(&self, task: TaskRequest, durability: Durability) -> Result<Submission> {
        self.runtime.block_on(self.engine.submit_task(task, durability))
    }

    pub fn run_workflow(&self, name: &str, input: serde_json::Value) -> Result<RunDetail> {
        self.runtime.block_on(self.engine.run_workflow(name, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::RunStatus;

    #[test]
    fn test_blocking_round_trip() {
        let engine = BlockingEngine::init_in_memory(EngineConfig::default()).unwrap();
        assert!(engine.migration_report().failed.is_empty());

        let h = engine
            .record(NewHeuristic::new(
                "rust",
                "Pin the toolchain in rust-toolchain.toml for reproducible builds",
                "",
            ))
            .unwrap();
        let applied = engine.apply_outcome(&h.id, Outcome::Violated, None).unwrap();
        assert!(applied.heuristic.confidence < h.confidence);

        let hints = engine.suggest("which toolchain builds are reproducible", Some("rust")).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].heuristic_id, h.id);

        let detail = engine
            .run_workflow(
                "heuristic-review",
                serde_json::json!({ "heuristic_id": h.id, "outcome": "validated", "domain": "rust" }),
            )
            .unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(engine.knowledge_stats().unwrap().total_outcomes, 2);
    }
}
