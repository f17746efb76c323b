//! Learnings: episodic observations tied to a domain and optionally a heuristic.
//! Immutable once written, apart from a single downstream summary.

use crate::db::{ts_col, ts_col_opt, Store};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventPayload};
use crate::types::{Learning, LearningKind, NewLearning};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

const LEARNING_COLUMNS: &str =
    "id, domain, kind, title, body, heuristic_id, source_agent, created_at, summary, summarized_at";

fn learning_from_row(row: &Row<'_>) -> rusqlite::Result<(Learning, String)> {
    let kind: String = row.get(2)?;
    Ok((
        Learning {
            id: row.get(0)?,
            domain: row.get(1)?,
            kind: LearningKind::Observation,
            title: row.get(3)?,
            body: row.get(4)?,
            heuristic_id: row.get(5)?,
            source_agent: row.get(6)?,
            created_at: ts_col(row, 7)?,
            summary: row.get(8)?,
            summarized_at: ts_col_opt(row, 9)?,
        },
        kind,
    ))
}

fn with_kind((mut learning, kind): (Learning, String)) -> Result<Learning> {
    learning.kind = kind.parse()?;
    Ok(learning)
}

pub fn get_learning(conn: &Connection, id: &str) -> Result<Learning> {
    let row = conn
        .query_row(
            &format!("SELECT {LEARNING_COLUMNS} FROM learnings WHERE id = ?1"),
            [id],
            learning_from_row,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("learning", id))?;
    with_kind(row)
}

/// Newest first
pub fn list_learnings(conn: &Connection, domain: Option<&str>, limit: usize) -> Result<Vec<Learning>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LEARNING_COLUMNS} FROM learnings
         WHERE (?1 IS NULL OR domain = ?1)
         ORDER BY created_at DESC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![domain, limit as i64], learning_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(with_kind).collect()
}

/// Insert a validated learning; shared by the service and workflow handlers
pub(crate) fn insert_learning(conn: &Connection, new: &NewLearning) -> Result<Learning> {
    if new.domain.trim().is_empty() {
        return Err(EngineError::validation("domain must not be empty"));
    }
    if new.title.trim().is_empty() {
        return Err(EngineError::validation("learning title must not be empty"));
    }
    if let Some(heuristic_id) = &new.heuristic_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM heuristics WHERE id = ?1", [heuristic_id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(EngineError::not_found("heuristic", heuristic_id.clone()));
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO learnings (id, domain, kind, title, body, heuristic_id, source_agent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            new.domain.trim(),
            new.kind.as_str(),
            new.title.trim(),
            new.body,
            new.heuristic_id,
            new.source_agent,
            Utc::now().to_rfc3339(),
        ],
    )?;
    get_learning(conn, &id)
}

#[derive(Clone)]
pub struct LearningService {
    store: Store,
    events: EventBus,
}

impl LearningService {
    pub fn new(store: Store, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn record(&self, new: NewLearning) -> Result<Learning> {
        let learning = self
            .store
            .transaction("learning.record", move |tx| insert_learning(tx, &new))
            .await?;
        self.announce(&learning);
        Ok(learning)
    }

    /// Publish the creation event for a learning written elsewhere
    pub(crate) fn announce(&self, learning: &Learning) {
        info!(learning_id = %learning.id, domain = %learning.domain, kind = learning.kind.as_str(), "learning recorded");
        self.events.publish(EventPayload::LearningRecorded {
            learning_id: learning.id.clone(),
            domain: learning.domain.clone(),
            kind: learning.kind,
        });
    }

    pub async fn get(&self, id: &str) -> Result<Learning> {
        let id = id.to_string();
        self.store.call(move |conn| get_learning(conn, &id)).await
    }

    pub async fn list(&self, domain: Option<String>, limit: usize) -> Result<Vec<Learning>> {
        self.store
            .call(move |conn| list_learnings(conn, domain.as_deref(), limit))
            .await
    }

    /// Attach the downstream summary; allowed exactly once
    pub async fn summarize(&self, id: &str, summary: &str) -> Result<Learning> {
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(EngineError::validation("summary must not be empty"));
        }
        let id = id.to_string();
        self.store
            .transaction("learning.summarize", move |tx| {
                let learning = get_learning(tx, &id)?;
                if learning.summary.is_some() {
                    return Err(EngineError::validation(format!(
                        "learning {id} is already summarized"
                    )));
                }
                tx.execute(
                    "UPDATE learnings SET summary = ?2, summarized_at = ?3 WHERE id = ?1",
                    params![id, summary, Utc::now().to_rfc3339()],
                )?;
                get_learning(tx, &id)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::events::EventKind;
    use crate::migrations::run_migrations;

    async fn service() -> (LearningService, EventBus) {
        let store = Store::open_in_memory(&StoreConfig::default()).unwrap();
        store.call(|conn| run_migrations(conn).map(|_| ())).await.unwrap();
        let bus = EventBus::new(16);
        (LearningService::new(store, bus.clone()), bus)
    }

    fn new_learning(domain: &str, title: &str) -> NewLearning {
        NewLearning {
            domain: domain.into(),
            kind: LearningKind::Failure,
            title: title.into(),
            body: "retry storm after deploy".into(),
            heuristic_id: None,
            source_agent: Some("agent-7".into()),
        }
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let (svc, bus) = service().await;
        let mut rx = bus.subscribe_kinds([EventKind::LearningRecorded]);

        let first = svc.record(new_learning("backend", "Cache stampede")).await.unwrap();
        svc.record(new_learning("frontend", "Layout shift")).await.unwrap();

        assert_eq!(first.kind, LearningKind::Failure);
        assert_eq!(svc.get(&first.id).await.unwrap(), first);
        assert_eq!(svc.list(None, 10).await.unwrap().len(), 2);
        assert_eq!(svc.list(Some("backend".into()), 10).await.unwrap().len(), 1);
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::LearningRecorded);
    }

    #[tokio::test]
    async fn test_validation_and_unknown_heuristic() {
        let (svc, _) = service().await;
        assert!(matches!(
            svc.record(new_learning("", "x")).await,
            Err(EngineError::Validation(_))
        ));

        let mut linked = new_learning("backend", "Linked");
        linked.heuristic_id = Some("nope".into());
        assert!(matches!(
            svc.record(linked).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_summary_is_written_once() {
        let (svc, _) = service().await;
        let learning = svc.record(new_learning("backend", "Cache stampede")).await.unwrap();

        let summarized = svc.summarize(&learning.id, "add jitter to TTLs").await.unwrap();
        assert_eq!(summarized.summary.as_deref(), Some("add jitter to TTLs"));
        assert!(summarized.summarized_at.is_some());
        assert_eq!(summarized.title, learning.title);

        let again = svc.summarize(&learning.id, "something else").await;
        assert!(matches!(again, Err(EngineError::Validation(_))));
    }
}
