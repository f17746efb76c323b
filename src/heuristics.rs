//! Heuristic Service
//!
//! Owns every write to heuristic rows: creation, outcome application,
//! promotion to golden and retirement. Each operation is one store
//! transaction; events are published only after it commits.

use crate::config::PromotionConfig;
use crate::db::{bool_to_sql, sql_to_bool, ts_col, ts_col_opt, Store};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventPayload};
use crate::fraud::{latest_report, FraudDetector, SweepSummary};
use crate::outcome::{insert_outcome, keyed_outcome, next_confidence, OutcomeRecord};
use crate::types::{
    Classification, FraudReport, Heuristic, NewHeuristic, Outcome, Scope, ScopeRequest,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) const HEURISTIC_COLUMNS: &str = "id, domain, rule, explanation, confidence,
    times_validated, times_violated, times_contradicted, is_golden, scope, source_project,
    promoted_from_project, scope_justification, created_at, last_validated_at, promoted_at,
    applications_at_promotion, retired_at, retired_reason";

pub(crate) fn heuristic_from_row(row: &Row<'_>) -> rusqlite::Result<Heuristic> {
    let scope: String = row.get(9)?;
    Ok(Heuristic {
        id: row.get(0)?,
        domain: row.get(1)?,
        rule: row.get(2)?,
        explanation: row.get(3)?,
        confidence: row.get(4)?,
        times_validated: row.get(5)?,
        times_violated: row.get(6)?,
        times_contradicted: row.get(7)?,
        is_golden: sql_to_bool(row.get(8)?),
        scope: Scope::parse(&scope),
        source_project: row.get(10)?,
        promoted_from_project: sql_to_bool(row.get(11)?),
        scope_justification: row.get(12)?,
        created_at: ts_col(row, 13)?,
        last_validated_at: ts_col_opt(row, 14)?,
        promoted_at: ts_col_opt(row, 15)?,
        applications_at_promotion: row.get(16)?,
        retired_at: ts_col_opt(row, 17)?,
        retired_reason: row.get(18)?,
    })
}

pub fn get_heuristic(conn: &Connection, id: &str) -> Result<Heuristic> {
    conn.query_row(
        &format!("SELECT {HEURISTIC_COLUMNS} FROM heuristics WHERE id = ?1"),
        [id],
        heuristic_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("heuristic", id))
}

/// Listing filter; the default lists every active heuristic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeuristicFilter {
    pub domain: Option<String>,
    pub golden_only: bool,
    pub include_retired: bool,
    pub limit: Option<usize>,
}

/// Highest confidence first
pub fn list_heuristics(conn: &Connection, filter: &HeuristicFilter) -> Result<Vec<Heuristic>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HEURISTIC_COLUMNS} FROM heuristics
         WHERE (?1 IS NULL OR domain = ?1)
           AND (?2 = 0 OR is_golden = 1)
           AND (?3 = 1 OR retired_at IS NULL)
         ORDER BY is_golden DESC, confidence DESC, created_at ASC
         LIMIT ?4"
    ))?;
    let limit = filter.limit.map_or(-1, |l| l as i64);
    let rows = stmt
        .query_map(
            params![
                filter.domain,
                bool_to_sql(filter.golden_only),
                bool_to_sql(filter.include_retired),
                limit
            ],
            heuristic_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Latest fraud verdict shown next to a heuristic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FraudSummary {
    pub report_id: String,
    pub classification: Classification,
    pub composite_score: f64,
    pub fraud_probability: f64,
    pub assessed_at: DateTime<Utc>,
}

impl From<&FraudReport> for FraudSummary {
    fn from(report: &FraudReport) -> Self {
        Self {
            report_id: report.id.clone(),
            classification: report.classification,
            composite_score: report.composite_score,
            fraud_probability: report.fraud_probability,
            assessed_at: report.created_at,
        }
    }
}

/// A heuristic with its fraud classification alongside
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeuristicView {
    #[serde(flatten)]
    pub heuristic: Heuristic,
    pub fraud: Option<FraudSummary>,
}

fn view(conn: &Connection, heuristic: Heuristic) -> Result<HeuristicView> {
    let fraud = latest_report(conn, &heuristic.id)?.as_ref().map(FraudSummary::from);
    Ok(HeuristicView { heuristic, fraud })
}

/// Result of `apply_outcome`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOutcome {
    pub heuristic: Heuristic,
    pub outcome: Outcome,
    pub previous_confidence: f64,
    /// Present when this application triggered a fraud evaluation
    pub fraud_report: Option<FraudReport>,
    pub demoted: bool,
    pub promoted: bool,
    /// The key was already used; nothing changed
    #[serde(default)]
    pub replayed: bool,
}

/// Points inside `apply_outcome` where a test can inject a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Counters written, confidence not yet
    AfterCounters,
}

pub type FaultHook = Arc<dyn Fn(FaultPoint) -> Result<()> + Send + Sync>;

enum PromotionAttempt {
    Promoted(Heuristic, FraudReport),
    Refused(String, FraudReport),
}

#[derive(Clone)]
pub struct HeuristicService {
    store: Store,
    config: PromotionConfig,
    detector: FraudDetector,
    events: EventBus,
    fault_hook: Option<FaultHook>,
}

impl HeuristicService {
    pub fn new(store: Store, config: PromotionConfig, detector: FraudDetector, events: EventBus) -> Self {
        Self {
            store,
            config,
            detector,
            events,
            fault_hook: None,
        }
    }

    /// Install a fault hook; used to prove outcome application is atomic
    pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    pub fn detector(&self) -> &FraudDetector {
        &self.detector
    }

    fn validate_new(&self, new: &NewHeuristic) -> Result<()> {
        if new.domain.trim().is_empty() {
            return Err(EngineError::validation("domain must not be empty"));
        }
        let len = new.rule.trim().chars().count();
        if len < self.config.min_rule_len {
            return Err(EngineError::validation(format!(
                "rule is too short ({len} chars, minimum {})",
                self.config.min_rule_len
            )));
        }
        if len > self.config.max_rule_len {
            return Err(EngineError::validation(format!(
                "rule is too long ({len} chars, maximum {})",
                self.config.max_rule_len
            )));
        }
        if let ScopeRequest::Global { justification, .. } = &new.scope {
            if justification.trim().is_empty() {
                return Err(EngineError::validation(
                    "global scope requires a non-empty justification",
                ));
            }
        }
        Ok(())
    }

    /// Record a new project- or globally-scoped heuristic
    pub async fn record(&self, new: NewHeuristic) -> Result<Heuristic> {
        self.validate_new(&new)?;

        let initial = self.config.initial_confidence;
        let heuristic = self
            .store
            .transaction("heuristic.record", move |tx| {
                let domain = new.domain.trim();
                let rule = new.rule.trim();
                let duplicate: Option<String> = tx
                    .query_row(
                        "SELECT id FROM heuristics
                         WHERE domain = ?1 AND rule = ?2 AND retired_at IS NULL",
                        params![domain, rule],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing) = duplicate {
                    return Err(EngineError::validation(format!(
                        "an active heuristic with this rule already exists: {existing}"
                    )));
                }

                let (scope, source_project, justification) = match &new.scope {
                    ScopeRequest::Project { source_project } => {
                        (Scope::Project, source_project.clone(), None)
                    }
                    ScopeRequest::Global {
                        justification,
                        source_project,
                    } => (
                        Scope::Global,
                        source_project.clone(),
                        Some(justification.trim().to_string()),
                    ),
                };
                let promoted_from_project = scope == Scope::Global && source_project.is_some();

                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO heuristics
                     (id, domain, rule, explanation, confidence, scope, source_project,
                      promoted_from_project, scope_justification, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id,
                        domain,
                        rule,
                        new.explanation.trim(),
                        initial,
                        scope.as_str(),
                        source_project,
                        bool_to_sql(promoted_from_project),
                        justification,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                get_heuristic(tx, &id)
            })
            .await?;

        info!(heuristic_id = %heuristic.id, domain = %heuristic.domain, "heuristic recorded");
        self.events.publish(EventPayload::HeuristicCreated {
            heuristic_id: heuristic.id.clone(),
            domain: heuristic.domain.clone(),
            rule: heuristic.rule.clone(),
        });
        Ok(heuristic)
    }

    pub async fn get(&self, id: &str) -> Result<Heuristic> {
        let id = id.to_string();
        self.store.call(move |conn| get_heuristic(conn, &id)).await
    }

    /// Heuristic plus its latest fraud classification
    pub async fn show(&self, id: &str) -> Result<HeuristicView> {
        let id = id.to_string();
        self.store
            .call(move |conn| {
                let heuristic = get_heuristic(conn, &id)?;
                view(conn, heuristic)
            })
            .await
    }

    pub async fn list(&self, filter: HeuristicFilter) -> Result<Vec<HeuristicView>> {
        self.store
            .call(move |conn| {
                let conn: &Connection = conn;
                list_heuristics(conn, &filter)?
                    .into_iter()
                    .map(|h| view(conn, h))
                    .collect()
            })
            .await
    }

    /// Apply one outcome report.
    ///
    /// Counters, confidence, the history row, any fraud report and any
    /// golden-state change commit together or not at all.
    pub async fn apply_outcome(&self, id: &str, outcome: Outcome, note: Option<String>) -> Result<AppliedOutcome> {
        self.apply(id, outcome, note, None).await
    }

    /// Like `apply_outcome`, but a repeat with the same `key` is a no-op
    /// that reports the state left by the first application. For callers
    /// that may retry after losing track of an attempt.
    pub async fn apply_outcome_once(
        &self,
        id: &str,
        outcome: Outcome,
        note: Option<String>,
        key: &str,
    ) -> Result<AppliedOutcome> {
        self.apply(id, outcome, note, Some(key.to_string())).await
    }

    async fn apply(&self, id: &str, outcome: Outcome, note: Option<String>, key: Option<String>) -> Result<AppliedOutcome> {
        let id = id.to_string();
        let config = self.config.clone();
        let detector = self.detector.clone();
        let hook = self.fault_hook.clone();

        let applied = self
            .store
            .transaction("heuristic.apply_outcome", move |tx| {
                if let Some(key) = &key {
                    if let Some((applied_to, before)) = keyed_outcome(tx, key)? {
                        if applied_to != id {
                            return Err(EngineError::validation(format!(
                                "outcome key {key} was already used for heuristic {applied_to}"
                            )));
                        }
                        return Ok(AppliedOutcome {
                            heuristic: get_heuristic(tx, &id)?,
                            outcome,
                            previous_confidence: before,
                            fraud_report: None,
                            demoted: false,
                            promoted: false,
                            replayed: true,
                        });
                    }
                }

                let current = get_heuristic(tx, &id)?;
                if current.is_retired() {
                    return Err(EngineError::validation(format!("heuristic {id} is retired")));
                }
                let now = Utc::now();

                let counter = match outcome {
                    Outcome::Validated => "times_validated",
                    Outcome::Violated => "times_violated",
                    Outcome::Contradicted => "times_contradicted",
                };
                tx.execute(
                    &format!("UPDATE heuristics SET {counter} = {counter} + 1 WHERE id = ?1"),
                    [&id],
                )?;
                if outcome.is_success() {
                    tx.execute(
                        "UPDATE heuristics SET last_validated_at = ?2 WHERE id = ?1",
                        params![id, now.to_rfc3339()],
                    )?;
                }

                if let Some(hook) = &hook {
                    hook(FaultPoint::AfterCounters)?;
                }

                let before = current.confidence;
                let after = next_confidence(before, outcome, &config);
                tx.execute(
                    "UPDATE heuristics SET confidence = ?2 WHERE id = ?1",
                    params![id, after],
                )?;
                insert_outcome(
                    tx,
                    &OutcomeRecord {
                        heuristic_id: id.clone(),
                        outcome,
                        confidence_before: before,
                        confidence_after: after,
                        note: note.clone(),
                        recorded_at: now,
                    },
                    key.as_deref(),
                )?;

                let mut demoted = false;
                if current.is_golden && after < config.confidence_threshold {
                    tx.execute("UPDATE heuristics SET is_golden = 0 WHERE id = ?1", [&id])?;
                    demoted = true;
                }

                let mut heuristic = get_heuristic(tx, &id)?;
                let threshold = config.confidence_threshold;
                let crossed = (before >= threshold) != (after >= threshold);
                let periodic = config.fraud_check_interval > 0
                    && heuristic.total_applications() % config.fraud_check_interval == 0;

                let mut fraud_report = None;
                if crossed || periodic {
                    fraud_report = Some(detector.evaluate(tx, &heuristic)?);
                }

                let mut promoted = false;
                if config.auto_promote
                    && !heuristic.is_golden
                    && promotion_gate(&heuristic, &config).is_ok()
                {
                    let report = match fraud_report.take() {
                        Some(report) => report,
                        None => detector.evaluate(tx, &heuristic)?,
                    };
                    if report.classification == Classification::Clean {
                        mark_golden(tx, &heuristic, "automatic: every promotion gate passed")?;
                        heuristic = get_heuristic(tx, &id)?;
                        promoted = true;
                    }
                    fraud_report = Some(report);
                }

                Ok(AppliedOutcome {
                    heuristic,
                    outcome,
                    previous_confidence: before,
                    fraud_report,
                    demoted,
                    promoted,
                    replayed: false,
                })
            })
            .await?;

        let h = &applied.heuristic;
        if applied.replayed {
            debug!(heuristic_id = %h.id, outcome = %outcome, "outcome already applied under this key");
            return Ok(applied);
        }
        debug!(
            heuristic_id = %h.id,
            outcome = %outcome,
            confidence = h.confidence,
            "outcome applied"
        );
        self.events.publish(EventPayload::OutcomeApplied {
            heuristic_id: h.id.clone(),
            outcome,
            confidence_before: applied.previous_confidence,
            confidence_after: h.confidence,
        });
        if let Some(report) = &applied.fraud_report {
            self.publish_report(report);
        }
        if applied.demoted {
            info!(heuristic_id = %h.id, confidence = h.confidence, "golden heuristic demoted");
            self.events.publish(EventPayload::HeuristicDemoted {
                heuristic_id: h.id.clone(),
                confidence: h.confidence,
            });
        }
        if applied.promoted {
            info!(heuristic_id = %h.id, confidence = h.confidence, "heuristic auto-promoted");
            self.events.publish(EventPayload::HeuristicPromoted {
                heuristic_id: h.id.clone(),
                confidence: h.confidence,
            });
        }
        Ok(applied)
    }

    /// Promote to golden after a fresh, clean fraud evaluation.
    ///
    /// A refused promotion still keeps the report it produced.
    pub async fn promote(&self, id: &str, justification: &str) -> Result<Heuristic> {
        let justification = justification.trim().to_string();
        if justification.is_empty() {
            return Err(EngineError::validation("promotion requires a justification"));
        }
        let id = id.to_string();
        let config = self.config.clone();
        let detector = self.detector.clone();

        let attempt = self
            .store
            .transaction("heuristic.promote", move |tx| {
                let heuristic = get_heuristic(tx, &id)?;
                if heuristic.is_retired() {
                    return Err(EngineError::promotion(format!("heuristic {id} is retired")));
                }
                if heuristic.is_golden {
                    return Err(EngineError::promotion(format!("heuristic {id} is already golden")));
                }
                promotion_gate(&heuristic, &config)?;

                let report = detector.evaluate(tx, &heuristic)?;
                if report.classification != Classification::Clean {
                    return Ok(PromotionAttempt::Refused(
                        format!(
                            "latest fraud classification is {} (composite {:.2})",
                            report.classification, report.composite_score
                        ),
                        report,
                    ));
                }
                mark_golden(tx, &heuristic, &justification)?;
                Ok(PromotionAttempt::Promoted(get_heuristic(tx, &id)?, report))
            })
            .await?;

        match attempt {
            PromotionAttempt::Promoted(heuristic, report) => {
                self.publish_report(&report);
                info!(heuristic_id = %heuristic.id, confidence = heuristic.confidence, "heuristic promoted to golden");
                self.events.publish(EventPayload::HeuristicPromoted {
                    heuristic_id: heuristic.id.clone(),
                    confidence: heuristic.confidence,
                });
                Ok(heuristic)
            }
            PromotionAttempt::Refused(reason, report) => {
                self.publish_report(&report);
                info!(heuristic_id = %report.heuristic_id, %reason, "promotion refused");
                Err(EngineError::Promotion(reason))
            }
        }
    }

    /// Mark retired; history and reports stay
    pub async fn retire(&self, id: &str, reason: &str) -> Result<Heuristic> {
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(EngineError::validation("retirement requires a reason"));
        }
        let id = id.to_string();
        let stored_reason = reason.clone();
        let heuristic = self
            .store
            .transaction("heuristic.retire", move |tx| {
                let heuristic = get_heuristic(tx, &id)?;
                if heuristic.is_retired() {
                    return Err(EngineError::validation(format!("heuristic {id} is already retired")));
                }
                tx.execute(
                    "UPDATE heuristics SET retired_at = ?2, retired_reason = ?3, is_golden = 0
                     WHERE id = ?1",
                    params![id, Utc::now().to_rfc3339(), stored_reason],
                )?;
                get_heuristic(tx, &id)
            })
            .await?;

        info!(heuristic_id = %heuristic.id, %reason, "heuristic retired");
        self.events.publish(EventPayload::HeuristicRetired {
            heuristic_id: heuristic.id.clone(),
            reason,
        });
        Ok(heuristic)
    }

    /// Run a fresh fraud evaluation outside of promotion
    pub async fn evaluate_fraud(&self, id: &str) -> Result<FraudReport> {
        let id = id.to_string();
        let detector = self.detector.clone();
        let report = self
            .store
            .transaction("fraud.evaluate", move |tx| {
                let heuristic = get_heuristic(tx, &id)?;
                detector.evaluate(tx, &heuristic)
            })
            .await?;
        self.publish_report(&report);
        Ok(report)
    }

    /// Batch evaluation of every applied, active heuristic.
    /// Each heuristic gets its own short transaction; failures are counted, not fatal.
    pub async fn fraud_sweep(&self) -> Result<SweepSummary> {
        let detector = self.detector.clone();
        let ids = self.store.call(move |conn| detector.sweep_candidates(conn)).await?;

        let mut summary = SweepSummary::default();
        for id in ids {
            match self.evaluate_fraud(&id).await {
                Ok(report) => summary.record(report.classification),
                Err(err) => {
                    warn!(heuristic_id = %id, error = %err, "fraud sweep failed for heuristic");
                    summary.failed += 1;
                }
            }
        }

        info!(
            evaluated = summary.evaluated,
            suspicious = summary.suspicious,
            fraudulent = summary.fraudulent,
            failed = summary.failed,
            "fraud sweep complete"
        );
        Ok(summary)
    }

    fn publish_report(&self, report: &FraudReport) {
        self.events.publish(EventPayload::FraudReportGenerated {
            heuristic_id: report.heuristic_id.clone(),
            report_id: report.id.clone(),
            classification: report.classification,
            composite_score: report.composite_score,
        });
    }
}

/// Confidence and validation-count gates
fn promotion_gate(heuristic: &Heuristic, config: &PromotionConfig) -> Result<()> {
    if heuristic.confidence < config.confidence_threshold {
        return Err(EngineError::promotion(format!(
            "confidence {:.2} is below {:.2}",
            heuristic.confidence, config.confidence_threshold
        )));
    }
    if heuristic.times_validated < config.min_validations {
        return Err(EngineError::promotion(format!(
            "{} validations, {} required",
            heuristic.times_validated, config.min_validations
        )));
    }
    Ok(())
}

fn mark_golden(conn: &Connection, heuristic: &Heuristic, justification: &str) -> Result<()> {
    conn.execute(
        "UPDATE heuristics
         SET is_golden = 1, promoted_at = ?2, applications_at_promotion = ?3,
             promotion_justification = ?4
         WHERE id = ?1",
        params![
            heuristic.id,
            Utc::now().to_rfc3339(),
            heuristic.total_applications(),
            justification
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FraudConfig, StoreConfig};
    use crate::events::EventKind;
    use crate::migrations::run_migrations;

    async fn service_with(config: PromotionConfig) -> HeuristicService {
        let store = Store::open_in_memory(&StoreConfig::default()).unwrap();
        store.call(|conn| run_migrations(conn).map(|_| ())).await.unwrap();
        let detector = FraudDetector::new(FraudConfig::default(), &config);
        HeuristicService::new(store, config, detector, EventBus::new(64))
    }

    async fn service() -> HeuristicService {
        service_with(PromotionConfig::default()).await
    }

    async fn null_check(svc: &HeuristicService) -> Heuristic {
        svc.record(NewHeuristic::new(
            "backend",
            "Always null-check before dereference",
            "Null dereferences were the top crash cause",
        ))
        .await
        .unwrap()
    }

    async fn set_state(svc: &HeuristicService, id: &str, confidence: f64, validated: u32) {
        let id = id.to_string();
        svc.store
            .call(move |conn| {
                conn.execute(
                    "UPDATE heuristics SET confidence = ?2, times_validated = ?3 WHERE id = ?1",
                    params![id, confidence, validated],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_record_defaults() {
        let svc = service().await;
        let h = null_check(&svc).await;
        assert!((h.confidence - 0.7).abs() < 1e-9);
        assert_eq!(h.scope, Scope::Project);
        assert!(!h.is_golden);
        assert_eq!(h.total_applications(), 0);
    }

    #[tokio::test]
    async fn test_record_validation() {
        let svc = service().await;
        let empty_domain = svc.record(NewHeuristic::new("  ", "Prefer explicit timeouts", "")).await;
        assert!(matches!(empty_domain, Err(EngineError::Validation(_))));

        let short = svc.record(NewHeuristic::new("backend", "short", "")).await;
        assert!(matches!(short, Err(EngineError::Validation(_))));

        let unjustified = svc
            .record(NewHeuristic::new("backend", "Prefer explicit timeouts", "").global("  "))
            .await;
        assert!(matches!(unjustified, Err(EngineError::Validation(_))));

        let global = svc
            .record(
                NewHeuristic::new("backend", "Prefer explicit timeouts", "")
                    .global("holds for every networked service"),
            )
            .await
            .unwrap();
        assert_eq!(global.scope, Scope::Global);
        assert_eq!(
            global.scope_justification.as_deref(),
            Some("holds for every networked service")
        );

        let duplicate = svc
            .record(NewHeuristic::new("backend", "Prefer explicit timeouts", ""))
            .await;
        assert!(matches!(duplicate, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_null_check_scenario() {
        let svc = service().await;
        let h = null_check(&svc).await;

        for _ in 0..4 {
            svc.apply_outcome(&h.id, Outcome::Validated, None).await.unwrap();
        }
        let applied = svc.apply_outcome(&h.id, Outcome::Violated, None).await.unwrap();

        let config = PromotionConfig::default();
        let expected = 0.7 + 4.0 * config.validation_increment - config.violation_decrement;
        assert!((applied.heuristic.confidence - expected).abs() < 1e-9);
        assert!((applied.heuristic.confidence - 0.80).abs() < 1e-9);
        assert_eq!(applied.heuristic.times_validated, 4);
        assert_eq!(applied.heuristic.times_violated, 1);

        let refused = svc.promote(&h.id, "looks solid").await;
        assert!(matches!(refused, Err(EngineError::Promotion(_))));
    }

    #[tokio::test]
    async fn test_promotion_gate_at_089() {
        let svc = service().await;
        let h = null_check(&svc).await;
        set_state(&svc, &h.id, 0.89, 20).await;

        let err = svc.promote(&h.id, "reviewed").await.unwrap_err();
        assert!(matches!(err, EngineError::Promotion(_)));
        assert!(err.to_string().contains("0.89"));
        assert!(!svc.get(&h.id).await.unwrap().is_golden);
    }

    #[tokio::test]
    async fn test_promotion_succeeds_at_095_when_clean() {
        let svc = service().await;
        let h = null_check(&svc).await;
        set_state(&svc, &h.id, 0.95, 8).await;

        let promoted = svc.promote(&h.id, "validated across eight services").await.unwrap();
        assert!(promoted.is_golden);
        assert_eq!(promoted.applications_at_promotion, Some(8));
        assert!(promoted.promoted_at.is_some());

        let shown = svc.show(&h.id).await.unwrap();
        assert_eq!(
            shown.fraud.map(|f| f.classification),
            Some(Classification::Clean)
        );

        let again = svc.promote(&h.id, "twice").await;
        assert!(matches!(again, Err(EngineError::Promotion(_))));
    }

    #[tokio::test]
    async fn test_promotion_requires_min_validations() {
        let svc = service().await;
        let h = null_check(&svc).await;
        set_state(&svc, &h.id, 0.95, 2).await;
        let err = svc.promote(&h.id, "reviewed").await.unwrap_err();
        assert!(err.to_string().contains("validations"));

        let empty = svc.promote(&h.id, " ").await;
        assert!(matches!(empty, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_fault_after_counters_rolls_back_everything() {
        let svc = service().await;
        let h = null_check(&svc).await;
        let svc = svc.with_fault_hook(Arc::new(|point: FaultPoint| -> Result<()> {
            match point {
                FaultPoint::AfterCounters => Err(EngineError::Other(anyhow::anyhow!("injected fault"))),
            }
        }));

        let result = svc.apply_outcome(&h.id, Outcome::Validated, None).await;
        assert!(result.is_err());

        let after = svc.get(&h.id).await.unwrap();
        assert_eq!(after.times_validated, 0);
        assert!((after.confidence - 0.7).abs() < 1e-9);
        assert!(after.last_validated_at.is_none());

        let id = h.id.clone();
        let history: i64 = svc
            .store
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM heuristic_outcomes WHERE heuristic_id = ?1",
                    [id],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(history, 0);
    }

    #[tokio::test]
    async fn test_keyed_outcome_applies_once() {
        let svc = service().await;
        let h = null_check(&svc).await;
        let other = svc
            .record(NewHeuristic::new("backend", "Log the request id on every error path", ""))
            .await
            .unwrap();
        let mut rx = svc.events.subscribe_kinds([EventKind::OutcomeApplied]);

        let first = svc
            .apply_outcome_once(&h.id, Outcome::Validated, None, "workflow:r1:apply")
            .await
            .unwrap();
        assert!(!first.replayed);
        rx.try_recv().unwrap();

        let again = svc
            .apply_outcome_once(&h.id, Outcome::Validated, None, "workflow:r1:apply")
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.heuristic.times_validated, 1);
        assert_eq!(again.heuristic.confidence, first.heuristic.confidence);
        assert!((again.previous_confidence - 0.7).abs() < 1e-9);
        assert!(rx.try_recv().is_err());

        let reused = svc
            .apply_outcome_once(&other.id, Outcome::Validated, None, "workflow:r1:apply")
            .await;
        assert!(matches!(reused, Err(EngineError::Validation(_))));
        assert_eq!(svc.get(&other.id).await.unwrap().times_validated, 0);

        svc.apply_outcome_once(&h.id, Outcome::Validated, None, "workflow:r2:apply")
            .await
            .unwrap();
        assert_eq!(svc.get(&h.id).await.unwrap().times_validated, 2);
    }

    #[tokio::test]
    async fn test_golden_drops_out_when_confidence_falls() {
        let svc = service().await;
        let h = null_check(&svc).await;
        set_state(&svc, &h.id, 0.95, 8).await;
        svc.promote(&h.id, "reviewed").await.unwrap();

        let mut rx = svc.events.subscribe_kinds([EventKind::HeuristicDemoted]);
        let applied = svc.apply_outcome(&h.id, Outcome::Violated, None).await.unwrap();
        assert!(applied.demoted);
        assert!(!applied.heuristic.is_golden);
        assert!(applied.fraud_report.is_some(), "crossing the threshold re-runs fraud checks");
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::HeuristicDemoted);
    }

    #[tokio::test]
    async fn test_auto_promote_when_enabled() {
        let config = PromotionConfig {
            auto_promote: true,
            ..PromotionConfig::default()
        };
        let svc = service_with(config).await;
        let h = null_check(&svc).await;

        let mut last = None;
        for _ in 0..5 {
            last = Some(svc.apply_outcome(&h.id, Outcome::Validated, None).await.unwrap());
        }
        let last = last.unwrap();
        assert!(last.promoted);
        assert!(last.heuristic.is_golden);
        assert_eq!(last.heuristic.applications_at_promotion, Some(5));
    }

    #[tokio::test]
    async fn test_retire_keeps_history() {
        let svc = service().await;
        let h = null_check(&svc).await;
        svc.apply_outcome(&h.id, Outcome::Validated, Some("ok".into()))
            .await
            .unwrap();

        let retired = svc.retire(&h.id, "superseded by linting").await.unwrap();
        assert!(retired.is_retired());
        assert_eq!(retired.times_validated, 1);

        let active = svc.list(HeuristicFilter::default()).await.unwrap();
        assert!(active.is_empty());
        let all = svc
            .list(HeuristicFilter {
                include_retired: true,
                ..HeuristicFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        let applied = svc.apply_outcome(&h.id, Outcome::Validated, None).await;
        assert!(matches!(applied, Err(EngineError::Validation(_))));
        assert!(matches!(
            svc.retire(&h.id, "again").await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_announces_every_report() {
        let svc = service().await;
        let applied = null_check(&svc).await;
        svc.record(NewHeuristic::new("backend", "Set a timeout on every retry loop", ""))
            .await
            .unwrap();
        svc.apply_outcome(&applied.id, Outcome::Validated, None).await.unwrap();

        let mut rx = svc.events.subscribe_kinds([EventKind::FraudReportGenerated]);
        let summary = svc.fraud_sweep().await.unwrap();
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.clean, 1);

        match rx.try_recv().unwrap().payload {
            EventPayload::FraudReportGenerated { heuristic_id, .. } => assert_eq!(heuristic_id, applied.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_interleaves_with_outcomes() {
        let svc = service().await;
        let mut ids = Vec::new();
        for n in 0..20 {
            let h = svc
                .record(NewHeuristic::new("backend", &format!("Guard shared state number {n} with a lock"), ""))
                .await
                .unwrap();
            svc.apply_outcome(&h.id, Outcome::Validated, None).await.unwrap();
            ids.push(h.id);
        }

        let sweeping = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.fraud_sweep().await })
        };
        for id in &ids {
            svc.apply_outcome(id, Outcome::Validated, None).await.unwrap();
        }
        let summary = sweeping.await.unwrap().unwrap();

        assert_eq!(summary.evaluated, 20);
        assert_eq!(summary.failed, 0);
        for id in &ids {
            assert_eq!(svc.get(id).await.unwrap().times_validated, 2);
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let svc = service().await;
        let err = svc.apply_outcome("missing", Outcome::Validated, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "heuristic", .. }));
    }

    #[tokio::test]
    async fn test_confidence_bounds_through_service() {
        let svc = service().await;
        let h = null_check(&svc).await;
        let pattern = [
            Outcome::Violated,
            Outcome::Violated,
            Outcome::Contradicted,
            Outcome::Violated,
            Outcome::Violated,
            Outcome::Violated,
            Outcome::Violated,
            Outcome::Violated,
            Outcome::Validated,
        ];
        for outcome in pattern {
            let applied = svc.apply_outcome(&h.id, outcome, None).await.unwrap();
            assert!((0.0..=1.0).contains(&applied.heuristic.confidence));
        }
        for _ in 0..30 {
            let applied = svc.apply_outcome(&h.id, Outcome::Validated, None).await.unwrap();
            assert!((0.0..=1.0).contains(&applied.heuristic.confidence));
        }
    }
}
