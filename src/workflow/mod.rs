//! Workflow Orchestrator
//!
//! Durable execution of small named graphs. A run moves
//! `pending -> running -> completed | failed`; each node moves
//! `waiting -> ready -> running -> succeeded | failed | skipped`.
//!
//! - A node runs once every inbound source succeeded and every inbound
//!   condition holds against the run context
//! - Anything downstream of a failed or skipped node, or behind a false
//!   condition, is skipped rather than left waiting
//! - Ready nodes run concurrently, each at most once per run

pub mod builtin;
pub mod condition;
pub mod definition;
mod engine;
mod store;

pub use builtin::{builtin_definitions, HandlerServices};
pub use condition::Condition;
pub use definition::{CompiledWorkflow, EdgeSpec, NodeSpec, WorkflowDefinition};
pub use engine::WorkflowEngine;

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(EngineError::validation(format!("unknown run status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Waiting => "waiting",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(NodeStatus::Waiting),
            "ready" => Ok(NodeStatus::Ready),
            "running" => Ok(NodeStatus::Running),
            "succeeded" => Ok(NodeStatus::Succeeded),
            "failed" => Ok(NodeStatus::Failed),
            "skipped" => Ok(NodeStatus::Skipped),
            other => Err(EngineError::validation(format!("unknown node status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    /// `{"input": ..., "<node id>": <output>, ...}`
    pub context: serde_json::Value,
    pub failed_node: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecution {
    pub run_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub notes: Vec<String>,
}

/// A run with its node records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub nodes: Vec<NodeExecution>,
}

impl RunDetail {
    pub fn node(&self, id: &str) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.node_id == id)
    }
}

/// What a handler gets to work with
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub node_id: String,
    /// The node's `config` from the definition
    pub config: serde_json::Value,
    /// Snapshot of the run context when the node became ready
    pub context: serde_json::Value,
    pub services: Arc<HandlerServices>,
}

impl NodeContext {
    /// Config value at `key`, falling back to the run input
    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.config
            .get(key)
            .or_else(|| self.context.get("input").and_then(|i| i.get(key)))
            .filter(|v| !v.is_null())
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key).and_then(|v| v.as_str())
    }
}

/// One step implementation.
///
/// The returned value becomes the node's output in the run context. An error
/// fails the attempt; its message is appended to the node's notes.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<serde_json::Value>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
