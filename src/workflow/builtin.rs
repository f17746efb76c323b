//! Built-in node handlers and workflow definitions
//!
//! Handlers read their settings from the node `config` first, then the run
//! input, so one definition serves many runs.

use super::{EdgeSpec, HandlerRegistry, NodeContext, NodeHandler, NodeSpec, WorkflowDefinition};
use crate::blackboard::{add_finding_and_announce, Blackboard, EntryKind, NewFinding};
use crate::events::EventBus;
use crate::heuristics::HeuristicService;
use crate::learnings::LearningService;
use crate::retrieval::{Knowledge, RetrievalEngine, RetrievalQuery};
use crate::types::{LearningKind, Mode, NewLearning, Outcome};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Services a handler may consult
pub struct HandlerServices {
    pub heuristics: HeuristicService,
    pub learnings: LearningService,
    pub retrieval: RetrievalEngine,
    pub blackboard: Arc<dyn Blackboard>,
    pub events: EventBus,
}

fn required<'a>(ctx: &'a NodeContext, key: &str) -> anyhow::Result<&'a str> {
    ctx.setting_str(key)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("node `{}` needs a `{key}` setting", ctx.node_id))
}

struct Noop;

#[async_trait]
impl NodeHandler for Noop {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        Ok(ctx.config.get("output").cloned().unwrap_or_else(|| json!({})))
    }
}

struct QueryHeuristics;

#[async_trait]
impl NodeHandler for QueryHeuristics {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let text = required(&ctx, "query")?.to_string();
        let mut query = RetrievalQuery::new(text).session(format!("workflow:{}", ctx.run_id));
        query.exclude_recently_shown = false;
        query.domain = ctx.setting_str("domain").map(str::to_string);
        if let Some(mode) = ctx.setting_str("mode") {
            query.mode = mode.parse::<Mode>()?;
        }
        query.top_k = ctx.setting("top_k").and_then(Value::as_u64).map(|k| k as usize);

        let result = ctx
            .services
            .retrieval
            .query(&query)
            .await
            .context("heuristic lookup failed")?;
        let items: Vec<Value> = result
            .items
            .iter()
            .filter_map(|item| match &item.knowledge {
                Knowledge::Heuristic(view) => Some(json!({
                    "heuristic_id": view.heuristic.id,
                    "rule": view.heuristic.rule,
                    "golden": view.heuristic.is_golden,
                    "score": item.score,
                })),
                Knowledge::Learning(_) => None,
            })
            .collect();
        Ok(json!({
            "count": items.len(),
            "method": result.method,
            "items": items,
        }))
    }
}

struct ApplyOutcome;

#[async_trait]
impl NodeHandler for ApplyOutcome {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let id = required(&ctx, "heuristic_id")?.to_string();
        let outcome: Outcome = required(&ctx, "outcome")?.parse()?;
        let note = ctx.setting_str("note").map(str::to_string);
        // A timed-out attempt may still commit; retries must not count it twice
        let key = format!("workflow:{}:{}", ctx.run_id, ctx.node_id);

        let applied = ctx
            .services
            .heuristics
            .apply_outcome_once(&id, outcome, note, &key)
            .await
            .with_context(|| format!("applying {outcome} to {id}"))?;
        Ok(json!({
            "heuristic_id": applied.heuristic.id,
            "confidence": applied.heuristic.confidence,
            "previous_confidence": applied.previous_confidence,
            "demoted": applied.demoted,
            "promoted": applied.promoted,
            "replayed": applied.replayed,
            "classification": applied.fraud_report.as_ref().map(|r| r.classification),
        }))
    }
}

struct RecordFinding;

#[async_trait]
impl NodeHandler for RecordFinding {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let agent_id = ctx
            .setting_str("agent_id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("workflow:{}", ctx.run_id));
        let key = ctx.setting_str("key").unwrap_or(&ctx.node_id).to_string();
        let payload = match ctx.setting_str("source") {
            Some(node) => ctx.context.get(node).cloned().unwrap_or(Value::Null),
            None => ctx.setting("payload").cloned().unwrap_or(Value::Null),
        };

        let entry = add_finding_and_announce(
            ctx.services.blackboard.as_ref(),
            &ctx.services.events,
            NewFinding {
                agent_id,
                key,
                payload,
                ttl: None,
            },
        )
        .await
        .context("posting finding")?;
        Ok(json!({ "entry_id": entry.id, "key": entry.key }))
    }
}

struct CollectFindings;

#[async_trait]
impl NodeHandler for CollectFindings {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let limit = ctx.setting("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
        let key = ctx.setting_str("key").map(str::to_string);

        let findings: Vec<Value> = ctx
            .services
            .blackboard
            .get_recent(EntryKind::Finding, limit)
            .await
            .context("reading findings")?
            .into_iter()
            .filter(|e| key.as_deref().map_or(true, |k| e.key == k))
            .map(|e| json!({ "entry_id": e.id, "key": e.key, "agent_id": e.agent_id, "payload": e.payload }))
            .collect();
        Ok(json!({ "count": findings.len(), "findings": findings }))
    }
}

struct RecordLearning;

#[async_trait]
impl NodeHandler for RecordLearning {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<Value> {
        let domain = required(&ctx, "domain")?.to_string();
        let title = required(&ctx, "title")?.to_string();
        let kind: LearningKind = ctx.setting_str("kind").unwrap_or("observation").parse()?;
        let body = match ctx.setting_str("source") {
            Some(node) => ctx
                .context
                .get(node)
                .map(|v| serde_json::to_string_pretty(v))
                .transpose()?
                .unwrap_or_default(),
            None => ctx.setting_str("body").unwrap_or_default().to_string(),
        };

        let learning = ctx
            .services
            .learnings
            .record(NewLearning {
                domain,
                kind,
                title,
                body,
                heuristic_id: ctx.setting_str("heuristic_id").map(str::to_string),
                source_agent: Some(format!("workflow:{}", ctx.run_id)),
            })
            .await
            .context("recording learning")?;
        Ok(json!({ "learning_id": learning.id }))
    }
}

impl HandlerRegistry {
    /// Registry holding every built-in handler
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", Arc::new(Noop));
        registry.register("query_heuristics", Arc::new(QueryHeuristics));
        registry.register("apply_outcome", Arc::new(ApplyOutcome));
        registry.register("record_finding", Arc::new(RecordFinding));
        registry.register("collect_findings", Arc::new(CollectFindings));
        registry.register("record_learning", Arc::new(RecordLearning));
        registry
    }
}

/// Definitions registered at startup
pub fn builtin_definitions() -> Vec<WorkflowDefinition> {
    vec![
        // input: {query, domain, title}
        WorkflowDefinition::new(
            "swarm-investigation",
            "Look up relevant heuristics, gather the swarm's findings and keep them as a learning",
        )
        .node(NodeSpec::new("lookup", "query_heuristics").retries(1))
        .node(NodeSpec::new("collect", "collect_findings").config(json!({ "limit": 50 })))
        .node(
            NodeSpec::new("record", "record_learning")
                .optional()
                .config(json!({ "kind": "observation", "source": "collect" })),
        )
        .edge(EdgeSpec::new("lookup", "record"))
        .edge(EdgeSpec::new("collect", "record").when("collect.count > 0")),
        // input: {heuristic_id, outcome, domain}
        WorkflowDefinition::new(
            "heuristic-review",
            "Apply an outcome and note a demotion as a failure learning",
        )
        .node(NodeSpec::new("apply", "apply_outcome"))
        .node(NodeSpec::new("note_demotion", "record_learning").config(json!({
            "kind": "failure",
            "title": "Golden heuristic demoted after outcome review",
            "source": "apply",
        })))
        .node(NodeSpec::new("share", "record_finding").optional().config(json!({
            "key": "heuristic-review",
            "source": "apply",
        })))
        .edge(EdgeSpec::new("apply", "note_demotion").when("apply.demoted"))
        .edge(EdgeSpec::new("apply", "share")),
    ]
}
