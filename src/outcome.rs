//! Outcome Recording - the confidence flywheel
//!
//! Applies the asymmetric confidence rule, appends the validation history that
//! fraud signals read, and summarizes how the knowledge base is learning.
//! Failures hurt more than successes help: bad advice is penalized heavily.

use crate::config::PromotionConfig;
use crate::db::ts_col;
use crate::error::Result;
use crate::types::Outcome;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// New confidence after one outcome, clamped to [0, 1]
pub fn next_confidence(current: f64, outcome: Outcome, config: &PromotionConfig) -> f64 {
    let delta = match outcome {
        Outcome::Validated => config.validation_increment,
        Outcome::Violated => -config.violation_decrement,
        Outcome::Contradicted => -config.contradiction_decrement,
    };
    (current + delta).clamp(0.0, 1.0)
}

/// One row of a heuristic's validation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub heuristic_id: String,
    pub outcome: Outcome,
    pub confidence_before: f64,
    pub confidence_after: f64,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Append to the history; callers run this inside the outcome transaction.
/// A keyed row can exist only once.
pub fn insert_outcome(conn: &Connection, record: &OutcomeRecord, key: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO heuristic_outcomes
         (heuristic_id, outcome, confidence_before, confidence_after, note, recorded_at, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.heuristic_id,
            record.outcome.as_str(),
            record.confidence_before,
            record.confidence_after,
            record.note,
            record.recorded_at.to_rfc3339(),
            key,
        ],
    )?;
    Ok(())
}

/// Heuristic id and confidence before an application already recorded under `key`
pub fn keyed_outcome(conn: &Connection, key: &str) -> Result<Option<(String, f64)>> {
    Ok(conn
        .query_row(
            "SELECT heuristic_id, confidence_before FROM heuristic_outcomes WHERE idempotency_key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Most recent outcomes first
pub fn outcome_history(conn: &Connection, heuristic_id: &str, limit: usize) -> Result<Vec<OutcomeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT heuristic_id, outcome, confidence_before, confidence_after, note, recorded_at
         FROM heuristic_outcomes
         WHERE heuristic_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![heuristic_id, limit as i64], |row| {
            let outcome: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                outcome,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, Option<String>>(4)?,
                ts_col(row, 5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(heuristic_id, outcome, before, after, note, recorded_at)| {
            Ok(OutcomeRecord {
                heuristic_id,
                outcome: outcome.parse()?,
                confidence_before: before,
                confidence_after: after,
                note,
                recorded_at,
            })
        })
        .collect()
}

/// Timestamps of every `validated` outcome, oldest first
pub fn validation_times(conn: &Connection, heuristic_id: &str) -> Result<Vec<DateTime<Utc>>> {
    let mut stmt = conn.prepare(
        "SELECT recorded_at FROM heuristic_outcomes
         WHERE heuristic_id = ?1 AND outcome = 'validated'
         ORDER BY recorded_at ASC, id ASC",
    )?;
    let times = stmt
        .query_map([heuristic_id], |row| ts_col(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(times)
}

/// Confidence movement of one heuristic since its first recorded outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceMovement {
    pub heuristic_id: String,
    pub rule: String,
    pub delta: f64,
    pub outcomes: i64,
}

/// Knowledge base summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub heuristics: i64,
    pub golden: i64,
    pub retired: i64,
    pub learnings: i64,
    pub total_outcomes: i64,
    pub validated_outcomes: i64,
    pub success_rate: f64,
    pub top_improved: Vec<ConfidenceMovement>,
    pub top_declined: Vec<ConfidenceMovement>,
}

pub fn get_knowledge_stats(conn: &Connection) -> Result<KnowledgeStats> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

    let heuristics = count("SELECT COUNT(*) FROM heuristics")?;
    let golden = count("SELECT COUNT(*) FROM heuristics WHERE is_golden = 1")?;
    let retired = count("SELECT COUNT(*) FROM heuristics WHERE retired_at IS NOT NULL")?;
    let learnings = count("SELECT COUNT(*) FROM learnings")?;
    let total_outcomes = count("SELECT COUNT(*) FROM heuristic_outcomes")?;
    let validated_outcomes =
        count("SELECT COUNT(*) FROM heuristic_outcomes WHERE outcome = 'validated'")?;

    let movements = |order: &str| -> Result<Vec<ConfidenceMovement>> {
        let sql = format!(
            "SELECT h.id, h.rule,
                    h.confidence - (SELECT o.confidence_before FROM heuristic_outcomes o
                                    WHERE o.heuristic_id = h.id ORDER BY o.id ASC LIMIT 1) AS delta,
                    (SELECT COUNT(*) FROM heuristic_outcomes o WHERE o.heuristic_id = h.id) AS n
             FROM heuristics h
             WHERE n > 0
             ORDER BY delta {order}
             LIMIT 5"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConfidenceMovement {
                    heuristic_id: row.get(0)?,
                    rule: row.get(1)?,
                    delta: row.get(2)?,
                    outcomes: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    };

    Ok(KnowledgeStats {
        heuristics,
        golden,
        retired,
        learnings,
        total_outcomes,
        validated_outcomes,
        success_rate: if total_outcomes > 0 {
            validated_outcomes as f64 / total_outcomes as f64
        } else {
            0.0
        },
        top_improved: movements("DESC")?
            .into_iter()
            .filter(|m| m.delta > 0.0)
            .collect(),
        top_declined: movements("ASC")?
            .into_iter()
            .filter(|m| m.delta < 0.0)
            .collect(),
    })
}

/// Print knowledge statistics in a human-readable format
pub fn print_knowledge_stats(stats: &KnowledgeStats) {
    println!("\nKNOWLEDGE BASE");
    println!("   Heuristics: {} ({} golden, {} retired)", stats.heuristics, stats.golden, stats.retired);
    println!("   Learnings: {}", stats.learnings);
    println!();

    if stats.total_outcomes == 0 {
        println!("No outcomes recorded yet. Report outcomes to start learning:");
        println!("   heuristic-engine outcome <heuristic-id> validated");
        return;
    }

    println!("OUTCOMES:");
    println!("   Total: {}", stats.total_outcomes);
    println!(
        "   Validated: {} ({:.1}%)",
        stats.validated_outcomes,
        stats.success_rate * 100.0
    );
    println!();

    if !stats.top_improved.is_empty() {
        println!("MOST IMPROVED:");
        for m in &stats.top_improved {
            println!("   +{:.2} ({} outcomes) - {}", m.delta, m.outcomes, m.rule);
        }
        println!();
    }

    if !stats.top_declined.is_empty() {
        println!("NEEDING REVIEW:");
        for m in &stats.top_declined {
            println!("   {:.2} ({} outcomes) - {}", m.delta, m.outcomes, m.rule);
        }
        println!();
    }
}
