use super::{
    expiry, require, Blackboard, BlackboardEntry, EntryKind, EntryState, NewFinding, NewTask,
};
use crate::config::BlackboardConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Process-local blackboard.
///
/// Entries are kept in insertion order; every operation, including
/// read-then-write ones like dequeue, runs under one lock.
pub struct MemoryBlackboard {
    config: BlackboardConfig,
    entries: Mutex<Vec<BlackboardEntry>>,
}

impl MemoryBlackboard {
    pub fn new(config: BlackboardConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs.max(0) as u64)
    }

    fn agent_ttl(&self) -> Duration {
        Duration::from_secs(self.config.agent_ttl_secs.max(0) as u64)
    }

    fn insert(&self, kind: EntryKind, key: &str, agent_id: &str, payload: serde_json::Value, ttl: Duration) -> Result<BlackboardEntry> {
        let now = Utc::now();
        let entry = BlackboardEntry {
            id: Uuid::new_v4().to_string(),
            kind,
            key: key.to_string(),
            agent_id: agent_id.to_string(),
            payload,
            state: EntryState::Open,
            claimed_by: None,
            created_at: now,
            expires_at: expiry(now, ttl)?,
        };
        self.entries.lock().push(entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl Blackboard for MemoryBlackboard {
    fn config(&self) -> &BlackboardConfig {
        &self.config
    }

    async fn register_agent(&self, agent_id: &str, task: &str) -> Result<BlackboardEntry> {
        require("agent id", agent_id)?;
        let now = Utc::now();
        let expires_at = expiry(now, self.agent_ttl())?;
        let mut entries = self.entries.lock();
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.kind == EntryKind::Agent && e.key == agent_id && !e.is_expired(now))
        {
            existing.payload = json!({ "task": task });
            existing.expires_at = expires_at;
            return Ok(existing.clone());
        }
        let entry = BlackboardEntry {
            id: Uuid::new_v4().to_string(),
            kind: EntryKind::Agent,
            key: agent_id.to_string(),
            agent_id: agent_id.to_string(),
            payload: json!({ "task": task }),
            state: EntryState::Open,
            claimed_by: None,
            created_at: now,
            expires_at,
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn heartbeat(&self, agent_id: &str) -> Result<BlackboardEntry> {
        let now = Utc::now();
        let expires_at = expiry(now, self.agent_ttl())?;
        let mut entries = self.entries.lock();
        let agent = entries
            .iter_mut()
            .find(|e| e.kind == EntryKind::Agent && e.key == agent_id && !e.is_expired(now))
            .ok_or_else(|| EngineError::not_found("agent", agent_id))?;
        agent.expires_at = expires_at;
        Ok(agent.clone())
    }

    async fn unregister_agent(&self, agent_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !(e.kind == EntryKind::Agent && e.key == agent_id && !e.is_expired(now)));
        Ok(entries.len() < before)
    }

    async fn add_finding(&self, finding: NewFinding) -> Result<BlackboardEntry> {
        require("agent id", &finding.agent_id)?;
        require("finding key", &finding.key)?;
        let ttl = finding.ttl.unwrap_or_else(|| self.default_ttl());
        self.insert(EntryKind::Finding, &finding.key, &finding.agent_id, finding.payload, ttl)
    }

    async fn post_message(&self, from: &str, to: &str, payload: serde_json::Value) -> Result<BlackboardEntry> {
        require("sender", from)?;
        require("recipient", to)?;
        self.insert(EntryKind::Message, to, from, payload, self.default_ttl())
    }

    async fn enqueue_task(&self, task: NewTask) -> Result<BlackboardEntry> {
        require("task key", &task.key)?;
        let ttl = task.ttl.unwrap_or_else(|| self.default_ttl());
        self.insert(EntryKind::Task, &task.key, &task.submitted_by, task.payload, ttl)
    }

    async fn dequeue_task(&self, agent_id: &str) -> Result<Option<BlackboardEntry>> {
        require("agent id", agent_id)?;
        let now = Utc::now();
        let mut entries = self.entries.lock();
        Ok(entries
            .iter_mut()
            .find(|e| e.kind == EntryKind::Task && e.state == EntryState::Open && !e.is_expired(now))
            .map(|task| {
                task.state = EntryState::Claimed;
                task.claimed_by = Some(agent_id.to_string());
                task.clone()
            }))
    }

    async fn complete_task(&self, task_id: &str, agent_id: &str, result: serde_json::Value) -> Result<BlackboardEntry> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let task = entries
            .iter_mut()
            .find(|e| e.kind == EntryKind::Task && e.id == task_id && !e.is_expired(now))
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        if task.state != EntryState::Claimed || task.claimed_by.as_deref() != Some(agent_id) {
            return Err(EngineError::validation(format!(
                "task {task_id} is not claimed by {agent_id}"
            )));
        }
        task.state = EntryState::Done;
        task.payload = json!({ "input": task.payload.take(), "result": result });
        Ok(task.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<BlackboardEntry>> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|e| e.id == id && !e.is_expired(now))
            .cloned())
    }

    async fn get_recent(&self, kind: EntryKind, limit: usize) -> Result<Vec<BlackboardEntry>> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .iter()
            .rev()
            .filter(|e| e.kind == kind && !e.is_expired(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn active_agents(&self) -> Result<Vec<BlackboardEntry>> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.kind == EntryKind::Agent && !e.is_expired(now))
            .cloned()
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::contract;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn board() -> MemoryBlackboard {
        MemoryBlackboard::new(BlackboardConfig::default())
    }

    #[tokio::test]
    async fn test_contract() {
        contract::agents_and_broadcast(&board()).await;
        contract::task_queue(&board()).await;
        contract::lazy_expiry(&board()).await;
        contract::validation(&board()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_claims_each_task_once() {
        let board = Arc::new(board());
        for i in 0..50 {
            board
                .enqueue_task(NewTask {
                    key: format!("t{i}"),
                    submitted_by: "lead".into(),
                    payload: json!(i),
                    ttl: None,
                })
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let board = Arc::clone(&board);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = board.dequeue_task(&format!("w{w}")).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }
}
