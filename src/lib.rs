//! Heuristic Engine - knowledge and coordination for autonomous task agents
//!
//! Agents report outcomes against heuristics (validated behavioral rules);
//! the engine scores their reliability, watches for gamed or drifting rules,
//! and feeds the most relevant ones back into an agent's working context.
//! Concurrent agents coordinate through an ephemeral blackboard and durable
//! workflow runs.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use heuristic_engine::{Engine, EngineConfig, NewHeuristic, Outcome, RetrievalQuery};
//!
//! let (engine, report) = Engine::init(EngineConfig::load(None)?).await?;
//!
//! let h = engine
//!     .record_heuristic(NewHeuristic::new("rust", "Run clippy before committing", "catches lint regressions"))
//!     .await?;
//!
//! // Mid-task: what do we know that applies here?
//! let hits = engine.query(&RetrievalQuery::new(latest_reasoning).domain("rust")).await?;
//!
//! // After the task (THE FEEDBACK LOOP)
//! engine.apply_outcome(&h.id, Outcome::Validated, None).await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Agents / agent host                       │
//! └──────────────┬──────────────────────────────┬────────────┘
//!                │ ingest, outcomes             │ tasks, findings
//!                ▼                              ▼
//! ┌──────────────────────────────┐  ┌────────────────────────┐
//! │ Heuristic Service            │  │ Blackboard (ephemeral) │
//! │  ├ Fraud/Drift Detector      │  │ Workflows (durable)    │
//! │  └ Retrieval + dedup         │  └───────────┬────────────┘
//! └──────────────┬───────────────┘              │
//!                ▼                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  SQLite store (WAL, migrations, blocking worker pool)     │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod backoff;
pub mod blackboard;
pub mod config;
pub mod convenience;
pub mod db;
pub mod dedup;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod events;
pub mod fraud;
pub mod heuristics;
pub mod learnings;
pub mod maintenance;
pub mod migrations;
pub mod outcome;
pub mod retrieval;
pub mod types;
pub mod workflow;

// Core types
pub use config::EngineConfig;
pub use db::Store;
pub use engine::{Durability, Engine, Submission, TaskRequest};
pub use error::{EngineError, Result};
pub use types::*;

// Knowledge
pub use heuristics::{AppliedOutcome, HeuristicFilter, HeuristicService, HeuristicView};
pub use learnings::LearningService;
pub use outcome::KnowledgeStats;
pub use retrieval::{Knowledge, RetrievalMethod, RetrievalQuery, RetrievalResult, RetrievedItem};

// Coordination
pub use blackboard::{Blackboard, BlackboardEntry, EntryKind, NewFinding, NewTask};
pub use events::{EngineEvent, EventBus, EventKind, EventPayload};
pub use workflow::{RunDetail, RunStatus, WorkflowDefinition, WorkflowEngine};

// Synchronous callers
pub use convenience::{BlockingEngine, Suggestion};
