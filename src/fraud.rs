//! Fraud/Drift Detector
//!
//! Runs a fixed battery of independent signals against a heuristic's history
//! and its domain's population baseline, folds them into one composite score
//! and likelihood ratio, and persists an immutable, hash-chained report.
//!
//! Every signal treats "no applications" as its own first branch, before any
//! minimum-applications guard, so a configured minimum of zero can never lead
//! to a division by zero. A signal that cannot be computed is degraded to a
//! neutral score; it never aborts the evaluation.

use crate::config::{FraudConfig, PromotionConfig};
use crate::error::{EngineError, Result};
use crate::heuristics::{get_heuristic, list_heuristics, HeuristicFilter};
use crate::outcome::{outcome_history, validation_times};
use crate::types::{Classification, FraudReport, Heuristic, SignalScore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use statrs::distribution::{Beta, ContinuousCDF};
use tracing::{debug, warn};
use uuid::Uuid;

pub const BASELINE_DRIFT: &str = "baseline_drift";
pub const OUTCOME_RATIO: &str = "outcome_ratio";
pub const PROMOTION_VELOCITY: &str = "promotion_velocity";
pub const TEMPORAL_BURST: &str = "temporal_burst";

/// Outcomes considered for the rolling success rate
const ROLLING_WINDOW: usize = 20;

/// Smoothing term for the likelihood ratio
const LR_EPSILON: f64 = 0.01;

/// Population statistics of a heuristic's domain, excluding the heuristic itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainBaseline {
    /// Mean success rate of peers with enough applications
    pub success_rate: Option<f64>,
    pub peers: usize,
    /// Median applications peers needed to reach golden
    pub median_applications_at_promotion: Option<f64>,
}

/// Everything the signals look at
#[derive(Debug, Clone)]
pub struct SignalInputs<'a> {
    pub heuristic: &'a Heuristic,
    /// Success rate over the most recent outcomes
    pub rolling_success_rate: Option<f64>,
    pub baseline: &'a DomainBaseline,
    /// Validation timestamps, oldest first
    pub validation_times: &'a [DateTime<Utc>],
}

/// Scored result before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub signals: Vec<SignalScore>,
    pub composite_score: f64,
    pub likelihood_ratio: f64,
    pub fraud_probability: f64,
    pub classification: Classification,
}

enum Signal {
    Scored { score: f64, detail: String },
    Neutral(String),
}

/// Batch sweep summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub evaluated: usize,
    pub clean: usize,
    pub suspicious: usize,
    pub fraudulent: usize,
    pub failed: usize,
}

impl SweepSummary {
    pub fn record(&mut self, classification: Classification) {
        self.evaluated += 1;
        match classification {
            Classification::Clean => self.clean += 1,
            Classification::Suspicious => self.suspicious += 1,
            Classification::Fraudulent => self.fraudulent += 1,
        }
    }
}

/// Result of re-hashing a heuristic's report chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub errors: Vec<String>,
    pub chain_length: usize,
}

#[derive(Debug, Clone)]
pub struct FraudDetector {
    config: FraudConfig,
    golden_threshold: f64,
}

impl FraudDetector {
    pub fn new(config: FraudConfig, promotion: &PromotionConfig) -> Self {
        Self {
            config,
            golden_threshold: promotion.confidence_threshold,
        }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    /// Score, persist and return a new report. Runs on the caller's connection
    /// so it can share the caller's transaction.
    pub fn evaluate(&self, conn: &Connection, heuristic: &Heuristic) -> Result<FraudReport> {
        let assessment = self.assess(conn, heuristic)?;
        persist_report(conn, heuristic, assessment)
    }

    /// Gather inputs from the store and score them without writing
    pub fn assess(&self, conn: &Connection, heuristic: &Heuristic) -> Result<Assessment> {
        let baseline = domain_baseline(conn, heuristic, self.config.min_applications)?;
        let recent = outcome_history(conn, &heuristic.id, ROLLING_WINDOW)?;
        let rolling_success_rate = if recent.is_empty() {
            heuristic.success_rate()
        } else {
            let validated = recent.iter().filter(|r| r.outcome.is_success()).count();
            Some(validated as f64 / recent.len() as f64)
        };
        let times = validation_times(conn, &heuristic.id)?;

        Ok(self.score(&SignalInputs {
            heuristic,
            rolling_success_rate,
            baseline: &baseline,
            validation_times: &times,
        }))
    }

    /// Pure scoring over prepared inputs
    pub fn score(&self, inputs: &SignalInputs<'_>) -> Assessment {
        let w = &self.config.weights;
        let signals = vec![
            finish(BASELINE_DRIFT, w.baseline_drift, self.baseline_drift(inputs)),
            finish(OUTCOME_RATIO, w.outcome_ratio, self.outcome_ratio(inputs)),
            finish(
                PROMOTION_VELOCITY,
                w.promotion_velocity,
                self.promotion_velocity(inputs),
            ),
            finish(TEMPORAL_BURST, w.temporal_burst, self.temporal_burst(inputs)),
        ];

        let total_weight: f64 = signals.iter().map(|s| s.weight).sum();
        let composite_score = if total_weight > 0.0 {
            (signals.iter().map(|s| s.weight * s.score).sum::<f64>() / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let likelihood_ratio = (LR_EPSILON + composite_score) / (LR_EPSILON + 1.0 - composite_score);
        let prior = self.config.prior_fraud_rate;
        let fraud_probability = (prior * likelihood_ratio) / (prior * likelihood_ratio + 1.0 - prior);

        Assessment {
            signals,
            composite_score,
            likelihood_ratio,
            fraud_probability,
            classification: self.classify(composite_score),
        }
    }

    pub fn classify(&self, composite: f64) -> Classification {
        if composite < self.config.suspicious_threshold {
            Classification::Clean
        } else if composite < self.config.fraudulent_threshold {
            Classification::Suspicious
        } else {
            Classification::Fraudulent
        }
    }

    /// Relative change of the rolling success rate against the domain mean
    fn baseline_drift(&self, inputs: &SignalInputs<'_>) -> Result<Signal> {
        let total = inputs.heuristic.total_applications();
        if total == 0 {
            return Ok(Signal::Neutral("no applications".into()));
        }
        if total < self.config.min_applications {
            return Ok(Signal::Neutral(format!(
                "{total} applications, below minimum {}",
                self.config.min_applications
            )));
        }
        let baseline = match inputs.baseline.success_rate {
            Some(b) if b > 0.0 => b,
            _ => {
                return Err(EngineError::FraudDetection {
                    signal: BASELINE_DRIFT,
                    reason: "domain baseline absent or zero".into(),
                })
            }
        };
        let rate = inputs
            .rolling_success_rate
            .unwrap_or(inputs.heuristic.times_validated as f64 / total as f64);
        let drift = (rate - baseline) / baseline;
        let saturation = self.config.drift_saturation.max(f64::EPSILON);
        Ok(Signal::Scored {
            score: (drift.abs() / saturation).clamp(0.0, 1.0),
            detail: format!("rolling rate {rate:.2} vs domain {baseline:.2} ({:+.0}%)", drift * 100.0),
        })
    }

    /// Posterior probability that the true success rate sits well above peers
    fn outcome_ratio(&self, inputs: &SignalInputs<'_>) -> Result<Signal> {
        let h = inputs.heuristic;
        let total = h.total_applications();
        if total == 0 {
            return Ok(Signal::Neutral("no applications".into()));
        }
        if total < self.config.min_applications {
            return Ok(Signal::Neutral(format!(
                "{total} applications, below minimum {}",
                self.config.min_applications
            )));
        }
        let baseline = inputs.baseline.success_rate.ok_or_else(|| EngineError::FraudDetection {
            signal: OUTCOME_RATIO,
            reason: "domain baseline absent".into(),
        })?;
        let bar = baseline + self.config.ratio_margin;
        if bar >= 1.0 {
            return Ok(Signal::Scored {
                score: 0.0,
                detail: format!("bar {bar:.2} unreachable"),
            });
        }
        let posterior = Beta::new(h.times_validated as f64 + 1.0, h.failures() as f64 + 1.0)
            .map_err(|e| EngineError::FraudDetection {
                signal: OUTCOME_RATIO,
                reason: e.to_string(),
            })?;
        let p_above = 1.0 - posterior.cdf(bar);
        Ok(Signal::Scored {
            score: p_above.clamp(0.0, 1.0),
            detail: format!(
                "P(rate > {bar:.2}) = {p_above:.2} with {}/{} validated",
                h.times_validated, total
            ),
        })
    }

    /// Golden-eligible in implausibly few applications relative to the domain
    fn promotion_velocity(&self, inputs: &SignalInputs<'_>) -> Result<Signal> {
        let h = inputs.heuristic;
        let total = h.total_applications();
        if total == 0 {
            return Ok(Signal::Neutral("no applications".into()));
        }
        if !h.is_golden && h.confidence < self.golden_threshold {
            return Ok(Signal::Neutral("not golden-eligible".into()));
        }
        let median = inputs
            .baseline
            .median_applications_at_promotion
            .filter(|m| *m > 0.0)
            .ok_or_else(|| EngineError::FraudDetection {
                signal: PROMOTION_VELOCITY,
                reason: "no promotion history in domain".into(),
            })?;
        let n = h.applications_at_promotion.unwrap_or(total) as f64;
        let limit = median * self.config.velocity_factor;
        let score = if limit > 0.0 && n < limit {
            1.0 - n / limit
        } else {
            0.0
        };
        Ok(Signal::Scored {
            score: score.clamp(0.0, 1.0),
            detail: format!("{n} applications vs domain median {median:.1}"),
        })
    }

    /// Share of validations that landed right after the previous one
    fn temporal_burst(&self, inputs: &SignalInputs<'_>) -> Result<Signal> {
        let total = inputs.heuristic.total_applications();
        if total == 0 {
            return Ok(Signal::Neutral("no applications".into()));
        }
        let times = inputs.validation_times;
        if times.len() < 2 || (times.len() as u32) < self.config.min_applications {
            return Ok(Signal::Neutral(format!("{} validations recorded", times.len())));
        }
        let window = chrono::Duration::seconds(self.config.burst_window_secs);
        let bursts = times
            .windows(2)
            .filter(|pair| pair[1] - pair[0] <= window)
            .count();
        let gaps = times.len() - 1;
        Ok(Signal::Scored {
            score: bursts as f64 / gaps as f64,
            detail: format!(
                "{bursts}/{gaps} validations within {}s of the previous",
                self.config.burst_window_secs
            ),
        })
    }

    /// Ids of every active heuristic with at least one application, in one
    /// short read. Callers evaluate each in its own transaction.
    pub fn sweep_candidates(&self, conn: &Connection) -> Result<Vec<String>> {
        Ok(list_heuristics(conn, &HeuristicFilter::default())?
            .into_iter()
            .filter(|h| h.total_applications() > 0)
            .map(|h| h.id)
            .collect())
    }
}

fn finish(name: &'static str, weight: f64, result: Result<Signal>) -> SignalScore {
    match result {
        Ok(Signal::Scored { score, detail }) => SignalScore {
            name: name.to_string(),
            score,
            weight,
            skipped: false,
            detail: Some(detail),
        },
        Ok(Signal::Neutral(reason)) => SignalScore {
            name: name.to_string(),
            score: 0.0,
            weight,
            skipped: true,
            detail: Some(reason),
        },
        Err(err) => {
            warn!(signal = name, error = %err, "fraud signal degraded to neutral");
            SignalScore {
                name: name.to_string(),
                score: 0.0,
                weight,
                skipped: true,
                detail: Some(err.to_string()),
            }
        }
    }
}

/// Domain statistics, excluding `heuristic` itself
pub fn domain_baseline(
    conn: &Connection,
    heuristic: &Heuristic,
    min_applications: u32,
) -> Result<DomainBaseline> {
    let mut stmt = conn.prepare(
        "SELECT times_validated, times_validated + times_violated + times_contradicted AS total
         FROM heuristics
         WHERE domain = ?1 AND id != ?2 AND retired_at IS NULL
           AND times_validated + times_violated + times_contradicted > 0
           AND times_validated + times_violated + times_contradicted >= ?3",
    )?;
    let rates = stmt
        .query_map(params![heuristic.domain, heuristic.id, min_applications], |row| {
            let validated: i64 = row.get(0)?;
            let total: i64 = row.get(1)?;
            Ok(validated as f64 / total as f64)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let success_rate = if rates.is_empty() {
        None
    } else {
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    };

    let mut stmt = conn.prepare(
        "SELECT applications_at_promotion FROM heuristics
         WHERE domain = ?1 AND id != ?2 AND applications_at_promotion IS NOT NULL",
    )?;
    let mut promotions = stmt
        .query_map(params![heuristic.domain, heuristic.id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    promotions.sort_unstable();

    Ok(DomainBaseline {
        success_rate,
        peers: rates.len(),
        median_applications_at_promotion: median(&promotions),
    })
}

fn median(sorted: &[i64]) -> Option<f64> {
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[n / 2] as f64),
        n => Some((sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0),
    }
}

/// Canonical text hashed for the audit chain
struct ReportDigest<'a> {
    heuristic_id: &'a str,
    signals_json: &'a str,
    composite_score: f64,
    likelihood_ratio: f64,
    fraud_probability: f64,
    classification: &'a str,
    total_applications: u32,
    confidence: f64,
    previous_hash: Option<&'a str>,
    created_at: &'a str,
}

impl ReportDigest<'_> {
    fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.unwrap_or("genesis").as_bytes());
        hasher.update(b"|");
        hasher.update(self.heuristic_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.signals_json.as_bytes());
        hasher.update(
            format!(
                "|{}|{}|{}|{}|{}|{}|{}",
                self.composite_score,
                self.likelihood_ratio,
                self.fraud_probability,
                self.classification,
                self.total_applications,
                self.confidence,
                self.created_at
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

fn persist_report(conn: &Connection, heuristic: &Heuristic, assessment: Assessment) -> Result<FraudReport> {
    let previous: Option<(String, i64)> = conn
        .query_row(
            "SELECT content_hash, seq FROM fraud_reports
             WHERE heuristic_id = ?1 ORDER BY seq DESC LIMIT 1",
            [&heuristic.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (previous_hash, seq) = match previous {
        Some((hash, seq)) => (Some(hash), seq + 1),
        None => (None, 1),
    };

    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now();
    let created_at_raw = created_at.to_rfc3339();
    let signals_json = serde_json::to_string(&assessment.signals)?;
    let total_applications = heuristic.total_applications();

    let content_hash = ReportDigest {
        heuristic_id: &heuristic.id,
        signals_json: &signals_json,
        composite_score: assessment.composite_score,
        likelihood_ratio: assessment.likelihood_ratio,
        fraud_probability: assessment.fraud_probability,
        classification: assessment.classification.as_str(),
        total_applications,
        confidence: heuristic.confidence,
        previous_hash: previous_hash.as_deref(),
        created_at: &created_at_raw,
    }
    .hash();

    conn.execute(
        "INSERT INTO fraud_reports
         (id, heuristic_id, signals_json, composite_score, likelihood_ratio, fraud_probability,
          classification, total_applications, confidence, previous_hash, content_hash, created_at, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            heuristic.id,
            signals_json,
            assessment.composite_score,
            assessment.likelihood_ratio,
            assessment.fraud_probability,
            assessment.classification.as_str(),
            total_applications,
            heuristic.confidence,
            previous_hash,
            content_hash,
            created_at_raw,
            seq,
        ],
    )?;

    debug!(
        heuristic_id = %heuristic.id,
        classification = %assessment.classification,
        composite = assessment.composite_score,
        "fraud report persisted"
    );

    Ok(FraudReport {
        id,
        heuristic_id: heuristic.id.clone(),
        signals: assessment.signals,
        composite_score: assessment.composite_score,
        likelihood_ratio: assessment.likelihood_ratio,
        fraud_probability: assessment.fraud_probability,
        classification: assessment.classification,
        total_applications,
        confidence: heuristic.confidence,
        previous_hash,
        content_hash,
        created_at,
    })
}

const REPORT_COLUMNS: &str = "id, heuristic_id, signals_json, composite_score, likelihood_ratio,
    fraud_probability, classification, total_applications, confidence, previous_hash,
    content_hash, created_at";

struct RawReport {
    id: String,
    heuristic_id: String,
    signals_json: String,
    composite_score: f64,
    likelihood_ratio: f64,
    fraud_probability: f64,
    classification: String,
    total_applications: u32,
    confidence: f64,
    previous_hash: Option<String>,
    content_hash: String,
    created_at: String,
}

impl RawReport {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            heuristic_id: row.get(1)?,
            signals_json: row.get(2)?,
            composite_score: row.get(3)?,
            likelihood_ratio: row.get(4)?,
            fraud_probability: row.get(5)?,
            classification: row.get(6)?,
            total_applications: row.get(7)?,
            confidence: row.get(8)?,
            previous_hash: row.get(9)?,
            content_hash: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn digest(&self) -> ReportDigest<'_> {
        ReportDigest {
            heuristic_id: &self.heuristic_id,
            signals_json: &self.signals_json,
            composite_score: self.composite_score,
            likelihood_ratio: self.likelihood_ratio,
            fraud_probability: self.fraud_probability,
            classification: &self.classification,
            total_applications: self.total_applications,
            confidence: self.confidence,
            previous_hash: self.previous_hash.as_deref(),
            created_at: &self.created_at,
        }
    }

    fn into_report(self) -> Result<FraudReport> {
        Ok(FraudReport {
            signals: serde_json::from_str(&self.signals_json)?,
            classification: Classification::parse(&self.classification)?,
            created_at: crate::types::parse_ts(&self.created_at)?,
            id: self.id,
            heuristic_id: self.heuristic_id,
            composite_score: self.composite_score,
            likelihood_ratio: self.likelihood_ratio,
            fraud_probability: self.fraud_probability,
            total_applications: self.total_applications,
            confidence: self.confidence,
            previous_hash: self.previous_hash,
            content_hash: self.content_hash,
        })
    }
}

/// Most recent report for a heuristic, if any
pub fn latest_report(conn: &Connection, heuristic_id: &str) -> Result<Option<FraudReport>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {REPORT_COLUMNS} FROM fraud_reports
                 WHERE heuristic_id = ?1 ORDER BY seq DESC LIMIT 1"
            ),
            [heuristic_id],
            RawReport::from_row,
        )
        .optional()?;
    raw.map(RawReport::into_report).transpose()
}

/// Reports for a heuristic, newest first
pub fn report_history(conn: &Connection, heuristic_id: &str, limit: usize) -> Result<Vec<FraudReport>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REPORT_COLUMNS} FROM fraud_reports
         WHERE heuristic_id = ?1 ORDER BY seq DESC LIMIT ?2"
    ))?;
    let raws = stmt
        .query_map(params![heuristic_id, limit as i64], RawReport::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawReport::into_report).collect()
}

/// Re-hash every report of a heuristic and check chain continuity
pub fn verify_chain(conn: &Connection, heuristic_id: &str) -> Result<ChainVerification> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REPORT_COLUMNS} FROM fraud_reports WHERE heuristic_id = ?1 ORDER BY seq ASC"
    ))?;
    let chain = stmt
        .query_map([heuristic_id], RawReport::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut errors = Vec::new();
    let mut prev_hash: Option<&str> = None;
    for (i, link) in chain.iter().enumerate() {
        if link.previous_hash.as_deref() != prev_hash {
            errors.push(format!(
                "chain break at position {i}: expected previous hash {prev_hash:?}, got {:?}",
                link.previous_hash
            ));
        }
        let computed = link.digest().hash();
        if computed != link.content_hash {
            errors.push(format!(
                "hash mismatch at position {i}: computed {computed}, stored {}",
                link.content_hash
            ));
        }
        prev_hash = Some(&link.content_hash);
    }

    Ok(ChainVerification {
        valid: errors.is_empty(),
        errors,
        chain_length: chain.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_in_transaction;
    use crate::migrations::run_migrations;
    use crate::types::Scope;

    fn heuristic(validated: u32, violated: u32, confidence: f64) -> Heuristic {
        Heuristic {
            id: "h1".into(),
            domain: "backend".into(),
            rule: "Always null-check before dereference".into(),
            explanation: String::new(),
            confidence,
            times_validated: validated,
            times_violated: violated,
            times_contradicted: 0,
            is_golden: false,
            scope: Scope::Project,
            source_project: None,
            promoted_from_project: false,
            scope_justification: None,
            created_at: Utc::now(),
            last_validated_at: None,
            promoted_at: None,
            applications_at_promotion: None,
            retired_at: None,
            retired_reason: None,
        }
    }

    fn detector(min_applications: u32) -> FraudDetector {
        let config = FraudConfig {
            min_applications,
            ..FraudConfig::default()
        };
        FraudDetector::new(config, &PromotionConfig::default())
    }

    fn insert(conn: &Connection, h: &Heuristic) {
        conn.execute(
            "INSERT INTO heuristics (id, domain, rule, confidence, times_validated, times_violated,
                                     times_contradicted, created_at, applications_at_promotion)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                h.id,
                h.domain,
                h.rule,
                h.confidence,
                h.times_validated,
                h.times_violated,
                h.times_contradicted,
                h.created_at.to_rfc3339(),
                h.applications_at_promotion,
            ],
        )
        .unwrap();
    }

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_zero_applications_is_neutral_for_any_minimum() {
        for min in [0, 1, 5] {
            let h = heuristic(0, 0, 0.7);
            let baseline = DomainBaseline {
                success_rate: Some(0.6),
                peers: 3,
                median_applications_at_promotion: Some(12.0),
            };
            let assessment = detector(min).score(&SignalInputs {
                heuristic: &h,
                rolling_success_rate: None,
                baseline: &baseline,
                validation_times: &[],
            });
            assert_eq!(assessment.composite_score, 0.0, "min = {min}");
            assert_eq!(assessment.classification, Classification::Clean);
            assert!(assessment.signals.iter().all(|s| s.skipped));
            assert!(assessment.likelihood_ratio.is_finite());
            assert!(assessment.fraud_probability.is_finite());
        }
    }

    #[test]
    fn test_zero_baseline_degrades_drift_only() {
        let h = heuristic(8, 2, 0.8);
        let baseline = DomainBaseline {
            success_rate: Some(0.0),
            peers: 2,
            median_applications_at_promotion: None,
        };
        let assessment = detector(0).score(&SignalInputs {
            heuristic: &h,
            rolling_success_rate: Some(0.8),
            baseline: &baseline,
            validation_times: &[],
        });
        let drift = &assessment.signals[0];
        assert_eq!(drift.name, BASELINE_DRIFT);
        assert!(drift.skipped);
        assert_eq!(drift.score, 0.0);

        let ratio = &assessment.signals[1];
        assert!(!ratio.skipped);
    }

    #[test]
    fn test_gamed_heuristic_scores_high() {
        let mut h = heuristic(20, 0, 0.95);
        h.times_validated = 20;
        let start = Utc::now();
        let times: Vec<_> = (0..20)
            .map(|i| start + chrono::Duration::seconds(i * 2))
            .collect();
        let baseline = DomainBaseline {
            success_rate: Some(0.5),
            peers: 6,
            median_applications_at_promotion: Some(60.0),
        };
        let assessment = detector(5).score(&SignalInputs {
            heuristic: &h,
            rolling_success_rate: Some(1.0),
            baseline: &baseline,
            validation_times: &times,
        });
        assert_eq!(assessment.classification, Classification::Fraudulent);
        assert!(assessment.likelihood_ratio > 1.0);
        assert!(assessment.fraud_probability > FraudConfig::default().prior_fraud_rate);
    }

    #[test]
    fn test_ordinary_heuristic_is_clean() {
        let h = heuristic(6, 3, 0.75);
        let start = Utc::now();
        let times: Vec<_> = (0..6)
            .map(|i| start + chrono::Duration::hours(i * 5))
            .collect();
        let baseline = DomainBaseline {
            success_rate: Some(0.65),
            peers: 4,
            median_applications_at_promotion: Some(20.0),
        };
        let assessment = detector(5).score(&SignalInputs {
            heuristic: &h,
            rolling_success_rate: Some(6.0 / 9.0),
            baseline: &baseline,
            validation_times: &times,
        });
        assert_eq!(assessment.classification, Classification::Clean);
    }

    #[test]
    fn test_classification_cutoffs() {
        let d = detector(5);
        assert_eq!(d.classify(0.0), Classification::Clean);
        assert_eq!(d.classify(0.29), Classification::Clean);
        assert_eq!(d.classify(0.30), Classification::Suspicious);
        assert_eq!(d.classify(0.59), Classification::Suspicious);
        assert_eq!(d.classify(0.60), Classification::Fraudulent);
    }

    #[test]
    fn test_baseline_excludes_self_and_thin_peers() {
        let conn = db();
        let target = heuristic(9, 1, 0.9);
        insert(&conn, &target);

        let mut peer = heuristic(3, 3, 0.7);
        peer.id = "p1".into();
        peer.applications_at_promotion = Some(10);
        insert(&conn, &peer);

        let mut thin = heuristic(1, 0, 0.7);
        thin.id = "p2".into();
        thin.applications_at_promotion = Some(30);
        insert(&conn, &thin);

        let baseline = domain_baseline(&conn, &target, 5).unwrap();
        assert_eq!(baseline.peers, 1);
        assert!((baseline.success_rate.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(baseline.median_applications_at_promotion, Some(20.0));
    }

    #[test]
    fn test_reports_form_a_verifiable_chain() {
        let conn = db();
        let h = heuristic(4, 1, 0.8);
        insert(&conn, &h);
        let d = detector(5);

        let first = d.evaluate(&conn, &h).unwrap();
        let second = d.evaluate(&conn, &h).unwrap();
        assert!(first.previous_hash.is_none());
        assert_eq!(second.previous_hash.as_deref(), Some(first.content_hash.as_str()));

        let latest = latest_report(&conn, "h1").unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(report_history(&conn, "h1", 10).unwrap().len(), 2);

        let verification = verify_chain(&conn, "h1").unwrap();
        assert!(verification.valid, "{:?}", verification.errors);
        assert_eq!(verification.chain_length, 2);

        conn.execute(
            "UPDATE fraud_reports SET composite_score = 0.99 WHERE id = ?1",
            [&first.id],
        )
        .unwrap();
        assert!(!verify_chain(&conn, "h1").unwrap().valid);
    }

    #[test]
    fn test_sweep_skips_unapplied() {
        let mut conn = db();
        insert(&conn, &heuristic(4, 1, 0.8));
        let mut fresh = heuristic(0, 0, 0.7);
        fresh.id = "h2".into();
        insert(&conn, &fresh);

        let detector = detector(5);
        assert_eq!(detector.sweep_candidates(&conn).unwrap(), vec!["h1".to_string()]);
        let h1 = get_heuristic(&conn, "h1").unwrap();
        let report = run_in_transaction(&mut conn, |tx| detector.evaluate(tx, &h1)).unwrap();

        let mut summary = SweepSummary::default();
        summary.record(report.classification);
        assert_eq!(summary.evaluated, 1);
        assert!(latest_report(&conn, "h2").unwrap().is_none());
        assert!(latest_report(&conn, "h1").unwrap().is_some());
    }
}
