//! Core types for the heuristic knowledge engine
//!
//! Heuristics are scored, generalized rules; learnings are episodic observations.
//! Fraud reports are immutable point-in-time risk assessments of one heuristic.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome reported by an agent after applying a heuristic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Validated,
    Violated,
    /// Evidence that the rule itself is wrong, not just that it was broken
    Contradicted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Validated => "validated",
            Outcome::Violated => "violated",
            Outcome::Contradicted => "contradicted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Validated)
    }
}

impl FromStr for Outcome {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "validated" | "success" => Ok(Outcome::Validated),
            "violated" | "failure" => Ok(Outcome::Violated),
            "contradicted" => Ok(Outcome::Contradicted),
            other => Err(EngineError::validation(format!("unknown outcome: {other}"))),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility of a heuristic across projects
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Project,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("global") {
            Scope::Global
        } else {
            Scope::Project
        }
    }
}

/// Requested scope for a new heuristic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ScopeRequest {
    Project { source_project: Option<String> },
    /// Global scope must be justified
    Global {
        justification: String,
        source_project: Option<String>,
    },
}

impl Default for ScopeRequest {
    fn default() -> Self {
        ScopeRequest::Project {
            source_project: None,
        }
    }
}

/// A candidate behavioral rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heuristic {
    pub id: String,
    pub domain: String,
    pub rule: String,
    pub explanation: String,
    pub confidence: f64,
    pub times_validated: u32,
    pub times_violated: u32,
    pub times_contradicted: u32,
    pub is_golden: bool,
    pub scope: Scope,
    pub source_project: Option<String>,
    pub promoted_from_project: bool,
    pub scope_justification: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub promoted_at: Option<DateTime<Utc>>,
    /// Applications it took to reach golden
    pub applications_at_promotion: Option<u32>,
    pub retired_at: Option<DateTime<Utc>>,
    pub retired_reason: Option<String>,
}

impl Heuristic {
    /// validated + violated + contradicted
    pub fn total_applications(&self) -> u32 {
        self.times_validated + self.times_violated + self.times_contradicted
    }

    pub fn failures(&self) -> u32 {
        self.times_violated + self.times_contradicted
    }

    /// Observed success rate; `None` until the heuristic has been applied
    pub fn success_rate(&self) -> Option<f64> {
        match self.total_applications() {
            0 => None,
            total => Some(self.times_validated as f64 / total as f64),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// Input for recording a new heuristic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewHeuristic {
    pub domain: String,
    pub rule: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub scope: ScopeRequest,
}

impl NewHeuristic {
    pub fn new(domain: &str, rule: &str, explanation: &str) -> Self {
        Self {
            domain: domain.to_string(),
            rule: rule.to_string(),
            explanation: explanation.to_string(),
            scope: ScopeRequest::default(),
        }
    }

    pub fn global(mut self, justification: &str) -> Self {
        let source_project = match self.scope {
            ScopeRequest::Project { source_project } => source_project,
            ScopeRequest::Global { source_project, .. } => source_project,
        };
        self.scope = ScopeRequest::Global {
            justification: justification.to_string(),
            source_project,
        };
        self
    }
}

/// Kind of an episodic learning
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LearningKind {
    Success,
    Failure,
    Observation,
}

impl LearningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningKind::Success => "success",
            LearningKind::Failure => "failure",
            LearningKind::Observation => "observation",
        }
    }
}

impl FromStr for LearningKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "success" => Ok(LearningKind::Success),
            "failure" => Ok(LearningKind::Failure),
            "observation" | "note" => Ok(LearningKind::Observation),
            other => Err(EngineError::validation(format!("unknown learning kind: {other}"))),
        }
    }
}

/// An episodic, non-generalized observation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Learning {
    pub id: String,
    pub domain: String,
    pub kind: LearningKind,
    pub title: String,
    pub body: String,
    pub heuristic_id: Option<String>,
    pub source_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Downstream summarization, written at most once
    pub summary: Option<String>,
    pub summarized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLearning {
    pub domain: String,
    pub kind: LearningKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub heuristic_id: Option<String>,
    #[serde(default)]
    pub source_agent: Option<String>,
}

/// What the agent is currently doing; drives category boosts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    General,
    Planning,
    Implementation,
    Review,
    Debugging,
}

impl FromStr for Mode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "general" => Ok(Mode::General),
            "planning" | "plan" => Ok(Mode::Planning),
            "implementation" | "coding" => Ok(Mode::Implementation),
            "review" => Ok(Mode::Review),
            "debugging" | "debug" => Ok(Mode::Debugging),
            other => Err(EngineError::validation(format!("unknown mode: {other}"))),
        }
    }
}

/// Plain record arriving from the external agent host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressRecord {
    pub text: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Tool-invocation metadata; carried through, never interpreted
    #[serde(default)]
    pub tool_context: Option<serde_json::Value>,
    /// Caller-scoped dedup session
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Discrete fraud classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Clean,
    Suspicious,
    Fraudulent,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Clean => "clean",
            Classification::Suspicious => "suspicious",
            Classification::Fraudulent => "fraudulent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "clean" => Ok(Classification::Clean),
            "suspicious" => Ok(Classification::Suspicious),
            "fraudulent" => Ok(Classification::Fraudulent),
            other => Err(EngineError::validation(format!("unknown classification: {other}"))),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independent fraud signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalScore {
    pub name: String,
    /// 0 = no evidence, 1 = strong evidence
    pub score: f64,
    pub weight: f64,
    /// Not computed (insufficient data); contributes zero
    pub skipped: bool,
    pub detail: Option<String>,
}

/// Point-in-time risk assessment for one heuristic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FraudReport {
    pub id: String,
    pub heuristic_id: String,
    pub signals: Vec<SignalScore>,
    pub composite_score: f64,
    pub likelihood_ratio: f64,
    pub fraud_probability: f64,
    pub classification: Classification,
    pub total_applications: u32,
    pub confidence: f64,
    pub previous_hash: Option<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Parse an RFC 3339 column value
pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::validation(format!("invalid timestamp {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Heuristic {
        Heuristic {
            id: "h1".into(),
            domain: "backend".into(),
            rule: "Always null-check before dereference".into(),
            explanation: String::new(),
            confidence: 0.7,
            times_validated: 0,
            times_violated: 0,
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

    #[test]
    fn test_success_rate_undefined_without_applications() {
        let mut h = sample();
        assert_eq!(h.total_applications(), 0);
        assert!(h.success_rate().is_none());

        h.times_validated = 3;
        h.times_violated = 1;
        assert_eq!(h.total_applications(), 4);
        assert!((h.success_rate().unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!("validated".parse::<Outcome>().unwrap(), Outcome::Validated);
        assert_eq!("Violated".parse::<Outcome>().unwrap(), Outcome::Violated);
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn test_global_scope_builder_keeps_project() {
        let mut new = NewHeuristic::new("backend", "Prefer explicit timeouts", "");
        new.scope = ScopeRequest::Project {
            source_project: Some("api".into()),
        };
        let new = new.global("applies to every service");
        assert_eq!(
            new.scope,
            ScopeRequest::Global {
                justification: "applies to every service".into(),
                source_project: Some("api".into()),
            }
        );
    }

    #[test]
    fn test_classification_ordering() {
        assert!(Classification::Clean < Classification::Suspicious);
        assert!(Classification::Suspicious < Classification::Fraudulent);
    }
}
