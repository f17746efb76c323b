//! Versioned schema migrations
//!
//! Each migration is numbered, idempotent (create-if-absent / add-column-with-default)
//! and recorded in the `schema_version` ledger inside the same transaction that
//! applies it. A failing migration is logged and skipped; startup continues and
//! the report comes back `partial`.

use crate::db::{ensure_column, run_in_transaction};
use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// A single numbered schema change
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&Transaction<'_>) -> Result<()>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Complete,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedMigration {
    pub version: u32,
    pub name: String,
    pub error: String,
}

/// Result of a migration pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    /// Applied during this pass
    pub applied: Vec<u32>,
    pub failed: Vec<FailedMigration>,
    /// Versions already present in the ledger before this pass
    pub already_applied: Vec<u32>,
}

const LEDGER: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
";

/// The full migration set, in ascending order
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "create_heuristics",
            apply: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS heuristics (
                        id TEXT PRIMARY KEY,
                        domain TEXT NOT NULL,
                        rule TEXT NOT NULL,
                        explanation TEXT NOT NULL DEFAULT '',
                        confidence REAL NOT NULL DEFAULT 0.7,
                        times_validated INTEGER NOT NULL DEFAULT 0,
                        times_violated INTEGER NOT NULL DEFAULT 0,
                        times_contradicted INTEGER NOT NULL DEFAULT 0,
                        is_golden INTEGER NOT NULL DEFAULT 0,
                        scope TEXT NOT NULL DEFAULT 'project',
                        source_project TEXT,
                        promoted_from_project INTEGER NOT NULL DEFAULT 0,
                        scope_justification TEXT,
                        created_at TEXT NOT NULL,
                        last_validated_at TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_heuristics_domain ON heuristics(domain);",
                )?;
                Ok(())
            },
        },
        Migration {
            version: 2,
            name: "create_learnings",
            apply: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS learnings (
                        id TEXT PRIMARY KEY,
                        domain TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        title TEXT NOT NULL,
                        body TEXT NOT NULL DEFAULT '',
                        heuristic_id TEXT REFERENCES heuristics(id),
                        source_agent TEXT,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_learnings_domain ON learnings(domain);",
                )?;
                Ok(())
            },
        },
        Migration {
            version: 3,
            name: "create_heuristic_outcomes",
            apply: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS heuristic_outcomes (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        heuristic_id TEXT NOT NULL REFERENCES heuristics(id),
                        outcome TEXT NOT NULL,
                        confidence_before REAL NOT NULL,
                        confidence_after REAL NOT NULL,
                        note TEXT,
                        recorded_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_outcomes_heuristic
                        ON heuristic_outcomes(heuristic_id, recorded_at);",
                )?;
                Ok(())
            },
        },
        Migration {
            version: 4,
            name: "create_fraud_reports",
            apply: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS fraud_reports (
                        id TEXT PRIMARY KEY,
                        heuristic_id TEXT NOT NULL REFERENCES heuristics(id),
                        signals_json TEXT NOT NULL,
                        composite_score REAL NOT NULL,
                        likelihood_ratio REAL NOT NULL,
                        fraud_probability REAL NOT NULL,
                        classification TEXT NOT NULL,
                        total_applications INTEGER NOT NULL,
                        confidence REAL NOT NULL,
                        previous_hash TEXT,
                        content_hash TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        seq INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX IF NOT EXISTS idx_fraud_reports_heuristic
                        ON fraud_reports(heuristic_id, seq);",
                )?;
                Ok(())
            },
        },
        Migration {
            version: 5,
            name: "create_workflows",
            apply: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS workflow_definitions (
                        name TEXT PRIMARY KEY,
                        definition_json TEXT NOT NULL,
                        registered_at TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS workflow_runs (
                        id TEXT PRIMARY KEY,
                        workflow_name TEXT NOT NULL REFERENCES workflow_definitions(name),
                        status TEXT NOT NULL,
                        input_json TEXT NOT NULL,
                        context_json TEXT NOT NULL,
                        failed_node TEXT,
                        error TEXT,
                        created_at TEXT NOT NULL,
                        started_at TEXT,
                        completed_at TEXT
                    );
                    CREATE TABLE IF NOT EXISTS node_executions (
                        run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                        node_id TEXT NOT NULL,
                        status TEXT NOT NULL,
                        attempts INTEGER NOT NULL DEFAULT 0,
                        started_at TEXT,
                        completed_at TEXT,
                        result_json TEXT,
                        notes_json TEXT NOT NULL DEFAULT '[]',
                        PRIMARY KEY (run_id, node_id)
                    );
                    CREATE INDEX IF NOT EXISTS idx_workflow_runs_name ON workflow_runs(workflow_name);",
                )?;
                Ok(())
            },
        },
        Migration {
            version: 6,
            name: "create_embedding_cache",
            apply: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS heuristic_embeddings (
                        item_id TEXT NOT NULL,
                        model TEXT NOT NULL,
                        text_hash TEXT NOT NULL,
                        dims INTEGER NOT NULL,
                        vector BLOB NOT NULL,
                        updated_at TEXT NOT NULL,
                        PRIMARY KEY (item_id, model)
                    );",
                )?;
                Ok(())
            },
        },
        Migration {
            version: 7,
            name: "heuristic_lifecycle_columns",
            apply: |tx| {
                ensure_column(tx, "heuristics", "promoted_at", "TEXT")?;
                ensure_column(tx, "heuristics", "promotion_justification", "TEXT")?;
                ensure_column(tx, "heuristics", "applications_at_promotion", "INTEGER")?;
                ensure_column(tx, "heuristics", "retired_at", "TEXT")?;
                ensure_column(tx, "heuristics", "retired_reason", "TEXT")?;
                Ok(())
            },
        },
        Migration {
            version: 8,
            name: "learning_summary_columns",
            apply: |tx| {
                ensure_column(tx, "learnings", "summary", "TEXT")?;
                ensure_column(tx, "learnings", "summarized_at", "TEXT")?;
                Ok(())
            },
        },
        Migration {
            version: 9,
            name: "outcome_idempotency_key",
            apply: |tx| {
                ensure_column(tx, "heuristic_outcomes", "idempotency_key", "TEXT")?;
                tx.execute_batch(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_outcomes_idempotency_key
                        ON heuristic_outcomes(idempotency_key)
                        WHERE idempotency_key IS NOT NULL;",
                )?;
                Ok(())
            },
        },
    ]
}

/// Versions recorded in the ledger
pub fn applied_versions(conn: &Connection) -> Result<BTreeSet<u32>> {
    conn.execute_batch(LEDGER)?;
    let mut stmt = conn.prepare("SELECT version FROM schema_version ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(versions)
}

/// Apply the built-in migration set
pub fn run_migrations(conn: &mut Connection) -> Result<MigrationReport> {
    run_migration_set(conn, &migrations())
}

/// Apply `set` in ascending version order, skipping versions already in the ledger
pub fn run_migration_set(conn: &mut Connection, set: &[Migration]) -> Result<MigrationReport> {
    let already = applied_versions(conn)?;

    let mut ordered: Vec<&Migration> = set.iter().collect();
    ordered.sort_by_key(|m| m.version);

    let mut applied = Vec::new();
    let mut failed = Vec::new();

    for migration in ordered {
        if already.contains(&migration.version) {
            continue;
        }

        let result = run_in_transaction(conn, |tx| {
            (migration.apply)(tx)?;
            tx.execute(
                "INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        });

        match result {
            Ok(()) => {
                info!(version = migration.version, name = migration.name, "migration applied");
                applied.push(migration.version);
            }
            Err(err) => {
                warn!(
                    version = migration.version,
                    name = migration.name,
                    error = %err,
                    "migration failed, skipping"
                );
                failed.push(FailedMigration {
                    version: migration.version,
                    name: migration.name.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    let status = if failed.is_empty() {
        MigrationStatus::Complete
    } else {
        MigrationStatus::Partial
    };

    Ok(MigrationReport {
        status,
        applied,
        failed,
        already_applied: already.into_iter().collect(),
    })
}
