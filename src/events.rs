//! Event Bus - pub/sub for engine events
//!
//! In-memory streaming over a tokio broadcast channel. Dashboards and other
//! observers subscribe, optionally filtered to a set of event kinds. Events are
//! lost on restart; the durable record lives in the store.

use crate::types::{Classification, LearningKind, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Flat event record: type tag, timestamp and payload fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    HeuristicCreated {
        heuristic_id: String,
        domain: String,
        rule: String,
    },
    HeuristicPromoted {
        heuristic_id: String,
        confidence: f64,
    },
    HeuristicDemoted {
        heuristic_id: String,
        confidence: f64,
    },
    HeuristicRetired {
        heuristic_id: String,
        reason: String,
    },
    OutcomeApplied {
        heuristic_id: String,
        outcome: Outcome,
        confidence_before: f64,
        confidence_after: f64,
    },
    FraudReportGenerated {
        heuristic_id: String,
        report_id: String,
        classification: Classification,
        composite_score: f64,
    },
    LearningRecorded {
        learning_id: String,
        domain: String,
        kind: LearningKind,
    },
    WorkflowStarted {
        run_id: String,
        workflow: String,
    },
    WorkflowCompleted {
        run_id: String,
        workflow: String,
        status: String,
        failed_node: Option<String>,
    },
    FindingAdded {
        entry_id: String,
        agent_id: String,
        key: String,
    },
}

/// Discriminant used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HeuristicCreated,
    HeuristicPromoted,
    HeuristicDemoted,
    HeuristicRetired,
    OutcomeApplied,
    FraudReportGenerated,
    LearningRecorded,
    WorkflowStarted,
    WorkflowCompleted,
    FindingAdded,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::HeuristicCreated,
        EventKind::HeuristicPromoted,
        EventKind::HeuristicDemoted,
        EventKind::HeuristicRetired,
        EventKind::OutcomeApplied,
        EventKind::FraudReportGenerated,
        EventKind::LearningRecorded,
        EventKind::WorkflowStarted,
        EventKind::WorkflowCompleted,
        EventKind::FindingAdded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::HeuristicCreated => "heuristic_created",
            EventKind::HeuristicPromoted => "heuristic_promoted",
            EventKind::HeuristicDemoted => "heuristic_demoted",
            EventKind::HeuristicRetired => "heuristic_retired",
            EventKind::OutcomeApplied => "outcome_applied",
            EventKind::FraudReportGenerated => "fraud_report_generated",
            EventKind::LearningRecorded => "learning_recorded",
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::FindingAdded => "finding_added",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| crate::error::EngineError::validation(format!("unknown event kind: {s}")))
    }
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::HeuristicCreated { .. } => EventKind::HeuristicCreated,
            EventPayload::HeuristicPromoted { .. } => EventKind::HeuristicPromoted,
            EventPayload::HeuristicDemoted { .. } => EventKind::HeuristicDemoted,
            EventPayload::HeuristicRetired { .. } => EventKind::HeuristicRetired,
            EventPayload::OutcomeApplied { .. } => EventKind::OutcomeApplied,
            EventPayload::FraudReportGenerated { .. } => EventKind::FraudReportGenerated,
            EventPayload::LearningRecorded { .. } => EventKind::LearningRecorded,
            EventPayload::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            EventPayload::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            EventPayload::FindingAdded { .. } => EventKind::FindingAdded,
        }
    }
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Event bus for publishing and subscribing to engine events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before slow receivers lag
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Stamp and publish; having no subscribers is not an error
    pub fn publish(&self, payload: EventPayload) {
        let event = EngineEvent {
            timestamp: Utc::now(),
            payload,
        };
        let kind = event.kind();
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(%kind, receivers, "event published");
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            kinds: None,
        }
    }

    /// Subscribe to the given kinds only
    pub fn subscribe_kinds(&self, kinds: impl IntoIterator<Item = EventKind>) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
    kinds: Option<HashSet<EventKind>>,
}

impl EventReceiver {
    fn wanted(&self, event: &EngineEvent) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.kind()))
    }

    /// Wait for the next matching event
    pub async fn recv(&mut self) -> Result<EngineEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!(skipped = n, "event receiver lagged");
                    EventBusError::Lagged(n)
                }
            })?;
            if self.wanted(&event) {
                return Ok(event);
            }
        }
    }

    /// Next matching event without waiting
    pub fn try_recv(&mut self) -> Result<EngineEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!(skipped = n, "event receiver lagged");
                    EventBusError::Lagged(n)
                }
            })?;
            if self.wanted(&event) {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,

    #[error("no events available")]
    Empty,

    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(EventPayload::WorkflowStarted {
            run_id: "r1".into(),
            workflow: "swarm-investigation".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::WorkflowStarted);
    }

    #[tokio::test]
    async fn test_kind_filter_skips_other_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_kinds([EventKind::HeuristicPromoted]);

        bus.publish(EventPayload::HeuristicCreated {
            heuristic_id: "h1".into(),
            domain: "backend".into(),
            rule: "Prefer explicit timeouts".into(),
        });
        bus.publish(EventPayload::HeuristicPromoted {
            heuristic_id: "h1".into(),
            confidence: 0.95,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.payload,
            EventPayload::HeuristicPromoted {
                heuristic_id: "h1".into(),
                confidence: 0.95
            }
        );
        assert!(matches!(rx.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_slow_receiver_reports_lag_then_resumes() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..3 {
            bus.publish(EventPayload::WorkflowStarted {
                run_id: format!("r{n}"),
                workflow: "heuristic-review".into(),
            });
        }

        tokio_test::block_on(async {
            assert!(matches!(rx.recv().await, Err(EventBusError::Lagged(1))));
            let event = rx.recv().await.unwrap();
            assert_eq!(
                event.payload,
                EventPayload::WorkflowStarted {
                    run_id: "r1".into(),
                    workflow: "heuristic-review".into()
                }
            );
        });
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EventPayload::FindingAdded {
            entry_id: "e1".into(),
            agent_id: "a1".into(),
            key: "k".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_shape_is_flat() {
        let event = EngineEvent {
            timestamp: Utc::now(),
            payload: EventPayload::HeuristicRetired {
                heuristic_id: "h1".into(),
                reason: "superseded".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "heuristic_retired");
        assert_eq!(json["heuristic_id"], "h1");
        assert!(json.get("timestamp").is_some());
        assert_eq!("finding_added".parse::<EventKind>().unwrap(), EventKind::FindingAdded);
    }
}
