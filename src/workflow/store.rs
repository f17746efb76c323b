//! Durable run records

use super::{NodeExecution, NodeStatus, RunStatus, WorkflowDefinition, WorkflowRun};
use crate::db::{ts_col, ts_col_opt};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) fn save_definition(conn: &Connection, def: &WorkflowDefinition) -> Result<()> {
    conn.execute(
        "INSERT INTO workflow_definitions (name, definition_json, registered_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET
            definition_json = excluded.definition_json,
            registered_at = excluded.registered_at",
        params![def.name, serde_json::to_string(def)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub(super) fn load_definitions(conn: &Connection) -> Result<Vec<WorkflowDefinition>> {
    let mut stmt = conn.prepare("SELECT definition_json FROM workflow_definitions ORDER BY name")?;
    let raw = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raw.iter()
        .map(|json| serde_json::from_str(json).map_err(Into::into))
        .collect()
}

pub(super) fn insert_run(conn: &Connection, run: &WorkflowRun, node_ids: &[String]) -> Result<()> {
    conn.execute(
        "INSERT INTO workflow_runs (id, workflow_name, status, input_json, context_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run.id,
            run.workflow,
            run.status.as_str(),
            run.input.to_string(),
            run.context.to_string(),
            run.created_at.to_rfc3339(),
        ],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO node_executions (run_id, node_id, status) VALUES (?1, ?2, 'waiting')",
    )?;
    for node_id in node_ids {
        stmt.execute(params![run.id, node_id])?;
    }
    Ok(())
}

pub(super) fn mark_run_started(conn: &Connection, run_id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE workflow_runs SET status = 'running', started_at = ?2 WHERE id = ?1",
        params![run_id, at.to_rfc3339()],
    )?;
    Ok(())
}

pub(super) fn finish_run(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
    context: &serde_json::Value,
    failed_node: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE workflow_runs
         SET status = ?2, context_json = ?3, failed_node = ?4, error = ?5, completed_at = ?6
         WHERE id = ?1",
        params![
            run_id,
            status.as_str(),
            context.to_string(),
            failed_node,
            error,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub(super) fn set_node_status(conn: &Connection, run_id: &str, node_id: &str, status: NodeStatus) -> Result<()> {
    let started = (status == NodeStatus::Running).then(|| Utc::now().to_rfc3339());
    conn.execute(
        "UPDATE node_executions
         SET status = ?3, started_at = COALESCE(?4, started_at)
         WHERE run_id = ?1 AND node_id = ?2",
        params![run_id, node_id, status.as_str(), started],
    )?;
    Ok(())
}

fn notes(conn: &Connection, run_id: &str, node_id: &str) -> Result<Vec<String>> {
    let raw: String = conn.query_row(
        "SELECT notes_json FROM node_executions WHERE run_id = ?1 AND node_id = ?2",
        params![run_id, node_id],
        |row| row.get(0),
    )?;
    Ok(serde_json::from_str(&raw)?)
}

/// Append notes, leaving everything else as it was
pub(super) fn append_notes(conn: &Connection, run_id: &str, node_id: &str, extra: &[String]) -> Result<()> {
    if extra.is_empty() {
        return Ok(());
    }
    let mut all = notes(conn, run_id, node_id)?;
    all.extend(extra.iter().cloned());
    conn.execute(
        "UPDATE node_executions SET notes_json = ?3 WHERE run_id = ?1 AND node_id = ?2",
        params![run_id, node_id, serde_json::to_string(&all)?],
    )?;
    Ok(())
}

/// Output, status, attempts and notes of a successful node, in one statement set
pub(super) fn complete_node(
    conn: &Connection,
    run_id: &str,
    node_id: &str,
    output: &serde_json::Value,
    attempts: u32,
    extra_notes: &[String],
) -> Result<()> {
    conn.execute(
        "UPDATE node_executions
         SET status = 'succeeded', attempts = ?3, result_json = ?4, completed_at = ?5
         WHERE run_id = ?1 AND node_id = ?2",
        params![run_id, node_id, attempts, output.to_string(), Utc::now().to_rfc3339()],
    )?;
    append_notes(conn, run_id, node_id, extra_notes)
}

pub(super) fn fail_node(conn: &Connection, run_id: &str, node_id: &str, attempts: u32, extra_notes: &[String]) -> Result<()> {
    conn.execute(
        "UPDATE node_executions
         SET status = 'failed', attempts = ?3, completed_at = ?4
         WHERE run_id = ?1 AND node_id = ?2",
        params![run_id, node_id, attempts, Utc::now().to_rfc3339()],
    )?;
    append_notes(conn, run_id, node_id, extra_notes)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<(WorkflowRun, String, String, String)> {
    Ok((
        WorkflowRun {
            id: row.get(0)?,
            workflow: row.get(1)?,
            status: RunStatus::Pending,
            input: serde_json::Value::Null,
            context: serde_json::Value::Null,
            failed_node: row.get(5)?,
            error: row.get(6)?,
            created_at: ts_col(row, 7)?,
            started_at: ts_col_opt(row, 8)?,
            completed_at: ts_col_opt(row, 9)?,
        },
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

const RUN_COLUMNS: &str = "id, workflow_name, status, input_json, context_json, failed_node, error,
    created_at, started_at, completed_at";

fn finish_run_row((mut run, status, input, context): (WorkflowRun, String, String, String)) -> Result<WorkflowRun> {
    run.status = status.parse()?;
    run.input = serde_json::from_str(&input)?;
    run.context = serde_json::from_str(&context)?;
    Ok(run)
}

pub(super) fn get_run(conn: &Connection, run_id: &str) -> Result<Option<WorkflowRun>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?1"),
        [run_id],
        run_from_row,
    )
    .optional()?
    .map(finish_run_row)
    .transpose()
}

/// Newest first, optionally for one workflow
pub(super) fn list_runs(conn: &Connection, workflow: Option<&str>, limit: usize) -> Result<Vec<WorkflowRun>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM workflow_runs
         WHERE (?1 IS NULL OR workflow_name = ?1)
         ORDER BY created_at DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![workflow, limit as i64], run_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(finish_run_row).collect()
}

pub(super) fn list_nodes(conn: &Connection, run_id: &str) -> Result<Vec<NodeExecution>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, status, attempts, started_at, completed_at, result_json, notes_json
         FROM node_executions WHERE run_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                ts_col_opt(row, 3)?,
                ts_col_opt(row, 4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(node_id, status, attempts, started_at, completed_at, result, notes)| {
            Ok(NodeExecution {
                run_id: run_id.to_string(),
                node_id,
                status: status.parse()?,
                attempts,
                started_at,
                completed_at,
                result: result.map(|r| serde_json::from_str(&r)).transpose()?,
                notes: serde_json::from_str(&notes)?,
            })
        })
        .collect()
}
