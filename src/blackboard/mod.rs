//! Blackboard: short-lived shared state for agents working one task together
//!
//! | Backend | Scope |
//! |---|---|
//! | `MemoryBlackboard` | one process, map under a mutex |
//! | `SqliteBlackboard` | any process that can open the shared file |
//!
//! Every mutation is one atomic unit. Entries carry an expiry and expired
//! entries are invisible to reads whether or not a sweep has run.

mod memory;
mod sqlite;

pub use memory::MemoryBlackboard;
pub use sqlite::SqliteBlackboard;

use crate::config::{BlackboardBackend, BlackboardConfig};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Agent,
    Finding,
    Task,
    Message,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Agent => "agent",
            EntryKind::Finding => "finding",
            EntryKind::Task => "task",
            EntryKind::Message => "message",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "agent" | "agents" => Ok(EntryKind::Agent),
            "finding" | "findings" => Ok(EntryKind::Finding),
            "task" | "tasks" => Ok(EntryKind::Task),
            "message" | "messages" => Ok(EntryKind::Message),
            other => Err(EngineError::validation(format!("unknown entry kind: {other}"))),
        }
    }
}

/// Task progress; other kinds stay `Open`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Open,
    Claimed,
    Done,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Open => "open",
            EntryState::Claimed => "claimed",
            EntryState::Done => "done",
        }
    }
}

impl FromStr for EntryState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(EntryState::Open),
            "claimed" => Ok(EntryState::Claimed),
            "done" => Ok(EntryState::Done),
            other => Err(EngineError::validation(format!("unknown entry state: {other}"))),
        }
    }
}

/// One namespaced record.
///
/// `key` is the agent id for agents, the topic for findings, the task name
/// for tasks and the recipient for messages. `agent_id` is the author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlackboardEntry {
    pub id: String,
    pub kind: EntryKind,
    pub key: String,
    pub agent_id: String,
    pub payload: serde_json::Value,
    pub state: EntryState,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlackboardEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFinding {
    pub agent_id: String,
    pub key: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub key: String,
    pub submitted_by: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<Duration>,
}

pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| EngineError::validation(format!("ttl out of range: {e}")))?;
    Ok(now + ttl)
}

/// Shared key space contract
#[async_trait]
pub trait Blackboard: Send + Sync {
    fn config(&self) -> &BlackboardConfig;

    /// Register or re-register an agent working on `task`
    async fn register_agent(&self, agent_id: &str, task: &str) -> Result<BlackboardEntry>;

    /// Extend an active agent's registration
    async fn heartbeat(&self, agent_id: &str) -> Result<BlackboardEntry>;

    async fn unregister_agent(&self, agent_id: &str) -> Result<bool>;

    async fn add_finding(&self, finding: NewFinding) -> Result<BlackboardEntry>;

    async fn post_message(&self, from: &str, to: &str, payload: serde_json::Value) -> Result<BlackboardEntry>;

    async fn enqueue_task(&self, task: NewTask) -> Result<BlackboardEntry>;

    /// Claim the oldest open task; two callers never claim the same one
    async fn dequeue_task(&self, agent_id: &str) -> Result<Option<BlackboardEntry>>;

    /// Mark a task claimed by `agent_id` as done, storing `result` in its payload
    async fn complete_task(&self, task_id: &str, agent_id: &str, result: serde_json::Value) -> Result<BlackboardEntry>;

    /// Unexpired entry by id
    async fn get(&self, id: &str) -> Result<Option<BlackboardEntry>>;

    /// Newest first
    async fn get_recent(&self, kind: EntryKind, limit: usize) -> Result<Vec<BlackboardEntry>>;

    async fn active_agents(&self) -> Result<Vec<BlackboardEntry>>;

    /// Physically remove expired entries; reads never depend on it
    async fn sweep_expired(&self) -> Result<usize>;

    /// Messages addressed to `agent_id`, newest first
    async fn messages_for(&self, agent_id: &str, limit: usize) -> Result<Vec<BlackboardEntry>> {
        Ok(self
            .get_recent(EntryKind::Message, usize::MAX)
            .await?
            .into_iter()
            .filter(|m| m.key == agent_id)
            .take(limit)
            .collect())
    }

    /// One message per active agent other than the sender.
    ///
    /// Recipients come from a snapshot taken before any message is posted.
    async fn broadcast(&self, from: &str, payload: serde_json::Value) -> Result<Vec<BlackboardEntry>> {
        let recipients: Vec<String> = self
            .active_agents()
            .await?
            .into_iter()
            .map(|a| a.key)
            .filter(|id| id != from)
            .collect();
        let mut sent = Vec::with_capacity(recipients.len());
        for to in &recipients {
            sent.push(self.post_message(from, to, payload.clone()).await?);
        }
        debug!(from, recipients = sent.len(), "broadcast sent");
        Ok(sent)
    }
}

/// Open the configured backend
pub async fn open_blackboard(config: &BlackboardConfig) -> Result<Arc<dyn Blackboard>> {
    match &config.backend {
        BlackboardBackend::Memory => Ok(Arc::new(MemoryBlackboard::new(config.clone()))),
        BlackboardBackend::Sqlite { path } => {
            Ok(Arc::new(SqliteBlackboard::open(path, config.clone()).await?))
        }
    }
}

/// Add a finding and publish `FindingAdded`
pub async fn add_finding_and_announce(
    board: &dyn Blackboard,
    events: &EventBus,
    finding: NewFinding,
) -> Result<BlackboardEntry> {
    let entry = board.add_finding(finding).await?;
    events.publish(EventPayload::FindingAdded {
        entry_id: entry.id.clone(),
        agent_id: entry.agent_id.clone(),
        key: entry.key.clone(),
    });
    Ok(entry)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("findings".parse::<EntryKind>().unwrap(), EntryKind::Finding);
        assert!("nope".parse::<EntryKind>().is_err());
    }

    #[tokio::test]
    async fn test_finding_announcement() {
        let board = MemoryBlackboard::new(BlackboardConfig::default());
        let events = EventBus::new(8);
        let mut rx = events.subscribe_kinds([EventKind::FindingAdded]);

        let entry = add_finding_and_announce(
            &board,
            &events,
            NewFinding {
                agent_id: "a1".into(),
                key: "root-cause".into(),
                payload: serde_json::json!("stale DNS"),
                ttl: None,
            },
        )
        .await
        .unwrap();

        match rx.try_recv().unwrap().payload {
            EventPayload::FindingAdded { entry_id, .. } => assert_eq!(entry_id, entry.id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
