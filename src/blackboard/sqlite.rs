use super::{
    expiry, require, Blackboard, BlackboardEntry, EntryKind, EntryState, NewFinding, NewTask,
};
use crate::config::{BlackboardConfig, StoreConfig};
use crate::db::Store;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blackboard_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'open',
    claimed_by TEXT,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blackboard_kind ON blackboard_entries(kind, expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_blackboard_key ON blackboard_entries(kind, key);
";

const ENTRY_COLUMNS: &str =
    "id, kind, key, agent_id, payload, state, claimed_by, created_at_ms, expires_at_ms";

fn millis_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(BlackboardEntry, String, String, String)> {
    Ok((
        BlackboardEntry {
            id: row.get(0)?,
            kind: EntryKind::Agent,
            key: row.get(2)?,
            agent_id: row.get(3)?,
            payload: serde_json::Value::Null,
            state: EntryState::Open,
            claimed_by: row.get(6)?,
            created_at: millis_col(row, 7)?,
            expires_at: millis_col(row, 8)?,
        },
        row.get(1)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish((mut entry, kind, payload, state): (BlackboardEntry, String, String, String)) -> Result<BlackboardEntry> {
    entry.kind = kind.parse()?;
    entry.payload = serde_json::from_str(&payload)?;
    entry.state = state.parse()?;
    Ok(entry)
}

fn fetch_by_id(conn: &Connection, id: &str, now_ms: i64) -> Result<Option<BlackboardEntry>> {
    conn.query_row(
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM blackboard_entries WHERE id = ?1 AND expires_at_ms > ?2"
        ),
        params![id, now_ms],
        entry_from_row,
    )
    .optional()?
    .map(finish)
    .transpose()
}

fn fetch_agent(conn: &Connection, agent_id: &str, now_ms: i64) -> Result<Option<BlackboardEntry>> {
    conn.query_row(
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM blackboard_entries
             WHERE kind = 'agent' AND key = ?1 AND expires_at_ms > ?2
             ORDER BY seq DESC LIMIT 1"
        ),
        params![agent_id, now_ms],
        entry_from_row,
    )
    .optional()?
    .map(finish)
    .transpose()
}

fn insert_entry(conn: &Connection, entry: &BlackboardEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO blackboard_entries
         (id, kind, key, agent_id, payload, state, claimed_by, created_at_ms, expires_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.id,
            entry.kind.as_str(),
            entry.key,
            entry.agent_id,
            serde_json::to_string(&entry.payload)?,
            entry.state.as_str(),
            entry.claimed_by,
            entry.created_at.timestamp_millis(),
            entry.expires_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Blackboard in a SQLite file shared by every process that opens it.
///
/// Runs on its own store handle, apart from the knowledge store. Read-then-write
/// operations run in IMMEDIATE transactions.
pub struct SqliteBlackboard {
    store: Store,
    config: BlackboardConfig,
}

impl SqliteBlackboard {
    pub async fn open(path: &Path, config: BlackboardConfig) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::validation(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let store = Store::open(path, &StoreConfig::default())?;
        let board = Self::with_store(store, config).await?;
        info!(path = %path.display(), "sqlite blackboard opened");
        Ok(board)
    }

    pub async fn open_in_memory(config: BlackboardConfig) -> Result<Self> {
        Self::with_store(Store::open_in_memory(&StoreConfig::default())?, config).await
    }

    async fn with_store(store: Store, config: BlackboardConfig) -> Result<Self> {
        store
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(Self { store, config })
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs.max(0) as u64)
    }

    fn agent_ttl(&self) -> Duration {
        Duration::from_secs(self.config.agent_ttl_secs.max(0) as u64)
    }

    async fn insert(&self, kind: EntryKind, key: &str, agent_id: &str, payload: serde_json::Value, ttl: Duration) -> Result<BlackboardEntry> {
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
        let row = entry.clone();
        self.store
            .transaction("blackboard.insert", move |tx| insert_entry(tx, &row))
            .await?;
        Ok(entry)
    }

    async fn list(&self, kind: EntryKind, limit: usize, newest_first: bool) -> Result<Vec<BlackboardEntry>> {
        let now_ms = Utc::now().timestamp_millis();
        let order = if newest_first { "DESC" } else { "ASC" };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM blackboard_entries
                     WHERE kind = ?1 AND expires_at_ms > ?2
                     ORDER BY seq {order} LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![kind.as_str(), now_ms, limit], entry_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(finish).collect()
            })
            .await
    }
}

#[async_trait]
impl Blackboard for SqliteBlackboard {
    fn config(&self) -> &BlackboardConfig {
        &self.config
    }

    async fn register_agent(&self, agent_id: &str, task: &str) -> Result<BlackboardEntry> {
        require("agent id", agent_id)?;
        let agent_id = agent_id.to_string();
        let task = task.to_string();
        let ttl = self.agent_ttl();
        self.store
            .transaction("blackboard.register_agent", move |tx| {
                let now = Utc::now();
                let expires_at = expiry(now, ttl)?;
                let payload = json!({ "task": task });
                if let Some(existing) = fetch_agent(tx, &agent_id, now.timestamp_millis())? {
                    tx.execute(
                        "UPDATE blackboard_entries SET payload = ?2, expires_at_ms = ?3 WHERE id = ?1",
                        params![existing.id, payload.to_string(), expires_at.timestamp_millis()],
                    )?;
                    return Ok(BlackboardEntry {
                        payload,
                        expires_at,
                        ..existing
                    });
                }
                let entry = BlackboardEntry {
                    id: Uuid::new_v4().to_string(),
                    kind: EntryKind::Agent,
                    key: agent_id.clone(),
                    agent_id: agent_id.clone(),
                    payload,
                    state: EntryState::Open,
                    claimed_by: None,
                    created_at: now,
                    expires_at,
                };
                insert_entry(tx, &entry)?;
                Ok(entry)
            })
            .await
    }

    async fn heartbeat(&self, agent_id: &str) -> Result<BlackboardEntry> {
        let agent_id = agent_id.to_string();
        let ttl = self.agent_ttl();
        self.store
            .transaction("blackboard.heartbeat", move |tx| {
                let now = Utc::now();
                let agent = fetch_agent(tx, &agent_id, now.timestamp_millis())?
                    .ok_or_else(|| EngineError::not_found("agent", agent_id.clone()))?;
                let expires_at = expiry(now, ttl)?;
                tx.execute(
                    "UPDATE blackboard_entries SET expires_at_ms = ?2 WHERE id = ?1",
                    params![agent.id, expires_at.timestamp_millis()],
                )?;
                Ok(BlackboardEntry { expires_at, ..agent })
            })
            .await
    }

    async fn unregister_agent(&self, agent_id: &str) -> Result<bool> {
        let agent_id = agent_id.to_string();
        self.store
            .transaction("blackboard.unregister_agent", move |tx| {
                let removed = tx.execute(
                    "DELETE FROM blackboard_entries
                     WHERE kind = 'agent' AND key = ?1 AND expires_at_ms > ?2",
                    params![agent_id, Utc::now().timestamp_millis()],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    async fn add_finding(&self, finding: NewFinding) -> Result<BlackboardEntry> {
        require("agent id", &finding.agent_id)?;
        require("finding key", &finding.key)?;
        let ttl = finding.ttl.unwrap_or_else(|| self.default_ttl());
        self.insert(EntryKind::Finding, &finding.key, &finding.agent_id, finding.payload, ttl)
            .await
    }

    async fn post_message(&self, from: &str, to: &str, payload: serde_json::Value) -> Result<BlackboardEntry> {
        require("sender", from)?;
        require("recipient", to)?;
        self.insert(EntryKind::Message, to, from, payload, self.default_ttl())
            .await
    }

    async fn enqueue_task(&self, task: NewTask) -> Result<BlackboardEntry> {
        require("task key", &task.key)?;
        let ttl = task.ttl.unwrap_or_else(|| self.default_ttl());
        self.insert(EntryKind::Task, &task.key, &task.submitted_by, task.payload, ttl)
            .await
    }

    async fn dequeue_task(&self, agent_id: &str) -> Result<Option<BlackboardEntry>> {
        require("agent id", agent_id)?;
        let agent_id = agent_id.to_string();
        let claimed = self
            .store
            .transaction("blackboard.dequeue_task", move |tx| {
                let now_ms = Utc::now().timestamp_millis();
                let next: Option<String> = tx
                    .query_row(
                        "SELECT id FROM blackboard_entries
                         WHERE kind = 'task' AND state = 'open' AND expires_at_ms > ?1
                         ORDER BY seq ASC LIMIT 1",
                        [now_ms],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(id) = next else {
                    return Ok(None);
                };
                tx.execute(
                    "UPDATE blackboard_entries SET state = 'claimed', claimed_by = ?2 WHERE id = ?1",
                    params![id, agent_id],
                )?;
                fetch_by_id(tx, &id, now_ms)
            })
            .await?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.id, agent_id = ?task.claimed_by, "task claimed");
        }
        Ok(claimed)
    }

    async fn complete_task(&self, task_id: &str, agent_id: &str, result: serde_json::Value) -> Result<BlackboardEntry> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.store
            .transaction("blackboard.complete_task", move |tx| {
                let now_ms = Utc::now().timestamp_millis();
                let task = fetch_by_id(tx, &task_id, now_ms)?
                    .filter(|e| e.kind == EntryKind::Task)
                    .ok_or_else(|| EngineError::not_found("task", task_id.clone()))?;
                if task.state != EntryState::Claimed || task.claimed_by.as_deref() != Some(agent_id.as_str()) {
                    return Err(EngineError::validation(format!(
                        "task {task_id} is not claimed by {agent_id}"
                    )));
                }
                let payload = json!({ "input": task.payload, "result": result });
                tx.execute(
                    "UPDATE blackboard_entries SET state = 'done', payload = ?2 WHERE id = ?1",
                    params![task_id, payload.to_string()],
                )?;
                Ok(BlackboardEntry {
                    state: EntryState::Done,
                    payload,
                    ..task
                })
            })
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<BlackboardEntry>> {
        let id = id.to_string();
        self.store
            .call(move |conn| fetch_by_id(conn, &id, Utc::now().timestamp_millis()))
            .await
    }

    async fn get_recent(&self, kind: EntryKind, limit: usize) -> Result<Vec<BlackboardEntry>> {
        self.list(kind, limit, true).await
    }

    async fn active_agents(&self) -> Result<Vec<BlackboardEntry>> {
        self.list(EntryKind::Agent, usize::MAX, false).await
    }

    async fn sweep_expired(&self) -> Result<usize> {
        self.store
            .transaction("blackboard.sweep", move |tx| {
                let removed = tx.execute(
                    "DELETE FROM blackboard_entries WHERE expires_at_ms <= ?1",
                    [Utc::now().timestamp_millis()],
                )?;
                Ok(removed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::contract;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn board() -> SqliteBlackboard {
        SqliteBlackboard::open_in_memory(BlackboardConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_contract() {
        contract::agents_and_broadcast(&board().await).await;
        contract::task_queue(&board().await).await;
        contract::lazy_expiry(&board().await).await;
        contract::validation(&board().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_handles_on_one_file_never_double_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.db");
        let first = Arc::new(SqliteBlackboard::open(&path, BlackboardConfig::default()).await.unwrap());
        let second = Arc::new(SqliteBlackboard::open(&path, BlackboardConfig::default()).await.unwrap());

        for i in 0..20 {
            first
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
        for (w, board) in [first.clone(), second.clone(), first, second].into_iter().enumerate() {
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
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }
}
