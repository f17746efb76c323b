use super::definition::CompiledWorkflow;
use super::store::{
    complete_node, fail_node, finish_run, get_run, insert_run, list_nodes, list_runs, load_definitions,
    mark_run_started, save_definition, set_node_status,
};
use super::{
    HandlerRegistry, HandlerServices, NodeContext, NodeHandler, NodeSpec, NodeStatus, RunDetail, RunStatus,
    WorkflowDefinition, WorkflowRun,
};
use crate::backoff::backoff_delay;
use crate::config::WorkflowConfig;
use crate::db::Store;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventPayload};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Registers definitions and drives runs to a terminal status
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    config: WorkflowConfig,
    registry: HandlerRegistry,
    services: Arc<HandlerServices>,
    events: EventBus,
    definitions: RwLock<HashMap<String, Arc<CompiledWorkflow>>>,
}

/// What one node's attempts came to
struct NodeResult {
    node_id: String,
    output: Option<Value>,
    attempts: u32,
    notes: Vec<String>,
}

impl WorkflowEngine {
    pub fn new(
        store: Store,
        config: WorkflowConfig,
        registry: HandlerRegistry,
        services: Arc<HandlerServices>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                registry,
                services,
                events,
                definitions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Validate, persist and cache a definition, replacing any of the same name
    pub async fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        let compiled = definition.compile(|h| self.inner.registry.contains(h))?;
        let def = compiled.definition.clone();
        self.inner
            .store
            .transaction("workflow.register", move |tx| save_definition(tx, &def))
            .await?;
        info!(workflow = compiled.name(), nodes = compiled.order.len(), "workflow registered");
        self.inner
            .definitions
            .write()
            .insert(compiled.name().to_string(), Arc::new(compiled));
        Ok(())
    }

    /// Load persisted definitions; ones that no longer compile are skipped
    pub async fn load_persisted(&self) -> Result<usize> {
        let defs = self.inner.store.call(|conn| load_definitions(conn)).await?;
        let mut loaded = 0;
        for def in defs {
            let name = def.name.clone();
            match def.compile(|h| self.inner.registry.contains(h)) {
                Ok(compiled) => {
                    self.inner.definitions.write().insert(name, Arc::new(compiled));
                    loaded += 1;
                }
                Err(e) => warn!(workflow = %name, error = %e, "skipping stored workflow definition"),
            }
        }
        Ok(loaded)
    }

    pub fn definitions(&self) -> Vec<WorkflowDefinition> {
        let mut defs: Vec<WorkflowDefinition> = self
            .inner
            .definitions
            .read()
            .values()
            .map(|c| c.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn definition(&self, name: &str) -> Result<WorkflowDefinition> {
        self.compiled(name).map(|c| c.definition.clone())
    }

    fn compiled(&self, name: &str) -> Result<Arc<CompiledWorkflow>> {
        self.inner
            .definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow", name))
    }

    /// Create the run record and execute it in the background
    pub async fn start(&self, name: &str, input: Value) -> Result<String> {
        let compiled = self.compiled(name)?;
        let run_id = self.inner.create_run(&compiled, input).await?;
        let inner = Arc::clone(&self.inner);
        let id = run_id.clone();
        tokio::spawn(async move { inner.execute(compiled, id).await });
        Ok(run_id)
    }

    /// Execute a run to completion and return its final record
    pub async fn run(&self, name: &str, input: Value) -> Result<RunDetail> {
        let compiled = self.compiled(name)?;
        let run_id = self.inner.create_run(&compiled, input).await?;
        Arc::clone(&self.inner).execute(compiled, run_id.clone()).await;
        self.get_run(&run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunDetail> {
        let id = run_id.to_string();
        self.inner
            .store
            .call(move |conn| {
                let run = get_run(conn, &id)?.ok_or_else(|| EngineError::not_found("workflow run", &id))?;
                let nodes = list_nodes(conn, &id)?;
                Ok(RunDetail { run, nodes })
            })
            .await
    }

    pub async fn list_runs(&self, workflow: Option<String>, limit: usize) -> Result<Vec<WorkflowRun>> {
        self.inner
            .store
            .call(move |conn| list_runs(conn, workflow.as_deref(), limit))
            .await
    }
}

impl Inner {
    async fn create_run(&self, compiled: &CompiledWorkflow, input: Value) -> Result<String> {
        let run = WorkflowRun {
            id: Uuid::new_v4().to_string(),
            workflow: compiled.name().to_string(),
            status: RunStatus::Pending,
            context: json!({ "input": input.clone() }),
            input,
            failed_node: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let node_ids = compiled.order.clone();
        let run_id = run.id.clone();
        self.store
            .transaction("workflow.create_run", move |tx| insert_run(tx, &run, &node_ids))
            .await?;
        Ok(run_id)
    }

    /// Drive a run to a terminal status. Errors end the run as failed.
    async fn execute(self: Arc<Self>, compiled: Arc<CompiledWorkflow>, run_id: String) {
        self.events.publish(EventPayload::WorkflowStarted {
            run_id: run_id.clone(),
            workflow: compiled.name().to_string(),
        });

        let (status, failed_node) = match self.drive(&compiled, &run_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "workflow run aborted");
                let id = run_id.clone();
                let message = e.to_string();
                let recorded = self
                    .store
                    .call(move |conn| {
                        let context = get_run(conn, &id)?.map(|r| r.context).unwrap_or(Value::Null);
                        finish_run(conn, &id, RunStatus::Failed, &context, None, Some(&message))
                    })
                    .await;
                if let Err(e) = recorded {
                    warn!(run_id = %run_id, error = %e, "could not record aborted run");
                }
                (RunStatus::Failed, None)
            }
        };

        info!(run_id = %run_id, workflow = compiled.name(), status = %status, "workflow run finished");
        self.events.publish(EventPayload::WorkflowCompleted {
            run_id,
            workflow: compiled.name().to_string(),
            status: status.as_str().to_string(),
            failed_node,
        });
    }

    async fn drive(&self, compiled: &CompiledWorkflow, run_id: &str) -> Result<(RunStatus, Option<String>)> {
        let id = run_id.to_string();
        let input = self
            .store
            .call(move |conn| {
                let run = get_run(conn, &id)?.ok_or_else(|| EngineError::not_found("workflow run", &id))?;
                mark_run_started(conn, &id, Utc::now())?;
                Ok(run.input)
            })
            .await?;

        let mut statuses: HashMap<String, NodeStatus> = compiled
            .order
            .iter()
            .map(|id| (id.clone(), NodeStatus::Waiting))
            .collect();
        let mut context = json!({ "input": input });
        let mut first_failure: Option<(String, String)> = None;
        let mut running: JoinSet<NodeResult> = JoinSet::new();

        loop {
            for node_id in &compiled.order {
                if statuses[node_id] != NodeStatus::Waiting {
                    continue;
                }
                let Some(next) = resolve(compiled, node_id, &statuses, &context) else {
                    continue;
                };
                statuses.insert(node_id.clone(), next);
                if next == NodeStatus::Skipped {
                    debug!(run_id, node = %node_id, "node skipped");
                    self.record_status(run_id, node_id, NodeStatus::Skipped).await?;
                    continue;
                }

                let spec = compiled
                    .node(node_id)
                    .ok_or_else(|| EngineError::Workflow(format!("node `{node_id}` vanished")))?
                    .clone();
                let handler = self.registry.get(&spec.handler).ok_or_else(|| {
                    EngineError::Workflow(format!("handler `{}` is not registered", spec.handler))
                })?;
                self.record_status(run_id, node_id, NodeStatus::Running).await?;
                statuses.insert(node_id.clone(), NodeStatus::Running);

                let ctx = NodeContext {
                    run_id: run_id.to_string(),
                    node_id: node_id.clone(),
                    config: spec.config.clone(),
                    context: context.clone(),
                    services: Arc::clone(&self.services),
                };
                let timeout = Duration::from_secs(spec.timeout_secs.unwrap_or(self.config.default_node_timeout_secs));
                let base = Duration::from_millis(self.config.retry_backoff_ms);
                running.spawn(run_node(handler, spec, ctx, timeout, base));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let result = joined?;
            let spec = compiled
                .node(&result.node_id)
                .ok_or_else(|| EngineError::Workflow(format!("node `{}` vanished", result.node_id)))?;

            match result.output {
                Some(output) => {
                    let (rid, nid, out, notes) = (
                        run_id.to_string(),
                        result.node_id.clone(),
                        output.clone(),
                        result.notes.clone(),
                    );
                    let attempts = result.attempts;
                    self.store
                        .transaction("workflow.complete_node", move |tx| {
                            complete_node(tx, &rid, &nid, &out, attempts, &notes)
                        })
                        .await?;
                    if let Some(map) = context.as_object_mut() {
                        map.insert(result.node_id.clone(), output);
                    }
                    statuses.insert(result.node_id, NodeStatus::Succeeded);
                }
                None => {
                    let (rid, nid, notes) = (run_id.to_string(), result.node_id.clone(), result.notes.clone());
                    let attempts = result.attempts;
                    self.store
                        .transaction("workflow.fail_node", move |tx| fail_node(tx, &rid, &nid, attempts, &notes))
                        .await?;
                    let message = result.notes.last().cloned().unwrap_or_else(|| "failed".to_string());
                    if spec.optional {
                        warn!(run_id, node = %result.node_id, error = %message, "optional node failed");
                    } else {
                        warn!(run_id, node = %result.node_id, error = %message, "node failed");
                        if first_failure.is_none() {
                            first_failure = Some((result.node_id.clone(), message));
                        }
                    }
                    statuses.insert(result.node_id, NodeStatus::Failed);
                }
            }
        }

        let status = if first_failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let (failed_node, error) = first_failure.unzip();
        let (rid, ctx, fnode, err) = (run_id.to_string(), context, failed_node.clone(), error);
        self.store
            .transaction("workflow.finish_run", move |tx| {
                finish_run(tx, &rid, status, &ctx, fnode.as_deref(), err.as_deref())
            })
            .await?;
        Ok((status, failed_node))
    }

    async fn record_status(&self, run_id: &str, node_id: &str, status: NodeStatus) -> Result<()> {
        let (rid, nid) = (run_id.to_string(), node_id.to_string());
        self.store
            .call(move |conn| set_node_status(conn, &rid, &nid, status))
            .await
    }
}

/// Next status of a waiting node, or `None` while it must keep waiting.
///
/// Skips as soon as any source failed or was skipped, or any condition on a
/// finished source is false. Ready once every source succeeded.
fn resolve(
    compiled: &CompiledWorkflow,
    node_id: &str,
    statuses: &HashMap<String, NodeStatus>,
    context: &Value,
) -> Option<NodeStatus> {
    let mut all_done = true;
    for edge in compiled.inbound(node_id) {
        match statuses.get(&edge.from).copied() {
            Some(NodeStatus::Failed | NodeStatus::Skipped) => return Some(NodeStatus::Skipped),
            Some(NodeStatus::Succeeded) => {
                if let Some(condition) = &edge.condition {
                    if !condition.evaluate(context) {
                        return Some(NodeStatus::Skipped);
                    }
                }
            }
            _ => all_done = false,
        }
    }
    all_done.then_some(NodeStatus::Ready)
}

/// All attempts of one node. Each attempt runs in its own task so a
/// panicking handler fails the attempt instead of the run.
async fn run_node(
    handler: Arc<dyn NodeHandler>,
    spec: NodeSpec,
    ctx: NodeContext,
    timeout: Duration,
    base: Duration,
) -> NodeResult {
    let mut notes = Vec::new();
    let max_attempts = spec.max_retries.saturating_add(1);

    for attempt in 1..=max_attempts {
        let mut task = tokio::spawn({
            let handler = Arc::clone(&handler);
            let ctx = ctx.clone();
            async move { handler.run(ctx).await }
        });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(output))) => {
                return NodeResult {
                    node_id: spec.id,
                    output: Some(output),
                    attempts: attempt,
                    notes,
                };
            }
            Ok(Ok(Err(e))) => notes.push(format!("attempt {attempt} failed: {e:#}")),
            Ok(Err(join)) => notes.push(format!("attempt {attempt} panicked: {join}")),
            Err(_) => {
                task.abort();
                notes.push(format!("attempt {attempt} timed out after {}s", timeout.as_secs()));
            }
        }

        if attempt < max_attempts {
            let delay = backoff_delay(base, attempt, MAX_RETRY_DELAY);
            debug!(node = %spec.id, attempt, ?delay, "retrying node");
            tokio::time::sleep(delay).await;
        }
    }

    NodeResult {
        node_id: spec.id,
        output: None,
        attempts: max_attempts,
        notes,
    }
}
