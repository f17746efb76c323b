//! Workflow definitions and their validation

use super::condition::Condition;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    /// Name of a registered handler
    pub handler: String,
    /// A failed optional node does not fail the run
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Extra attempts after the first failure
    #[serde(default)]
    pub max_retries: u32,
    /// Handler-specific settings
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NodeSpec {
    pub fn new(id: &str, handler: &str) -> Self {
        Self {
            id: id.to_string(),
            handler: handler.to_string(),
            optional: false,
            timeout_secs: None,
            max_retries: 0,
            config: serde_json::Value::Null,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
}

impl EdgeSpec {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Inbound edge with its parsed condition
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: String,
    pub condition: Option<Condition>,
}

/// A validated definition, ready to execute
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub definition: WorkflowDefinition,
    /// Node ids in topological order
    pub order: Vec<String>,
    inbound: HashMap<String, Vec<Inbound>>,
}

impl CompiledWorkflow {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.definition.nodes.iter().find(|n| n.id == id)
    }

    pub fn inbound(&self, id: &str) -> &[Inbound] {
        self.inbound.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl WorkflowDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    /// Validate against the known handler names and parse every condition
    pub fn compile(self, handler_exists: impl Fn(&str) -> bool) -> Result<CompiledWorkflow> {
        let invalid = |msg: String| EngineError::validation(format!("workflow `{}`: {msg}", self.name));

        if self.name.trim().is_empty() {
            return Err(EngineError::validation("workflow name must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(invalid("has no nodes".into()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(invalid("node id must not be empty".into()));
            }
            // "input" is reserved in the run context
            if node.id == "input" {
                return Err(invalid("node id `input` is reserved".into()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id `{}`", node.id)));
            }
            if !handler_exists(&node.handler) {
                return Err(invalid(format!(
                    "node `{}` uses unknown handler `{}`",
                    node.id, node.handler
                )));
            }
        }

        let mut inbound: HashMap<String, Vec<Inbound>> = HashMap::new();
        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    return Err(invalid(format!("edge references unknown node `{end}`")));
                }
            }
            if !seen_edges.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(invalid(format!("duplicate edge {} -> {}", edge.from, edge.to)));
            }
            let condition = edge.condition.as_deref().map(Condition::parse).transpose()?;
            inbound.entry(edge.to.clone()).or_default().push(Inbound {
                from: edge.from.clone(),
                condition,
            });
        }

        let order = topological_order(&self)
            .ok_or_else(|| invalid("contains a cycle".into()))?;

        Ok(CompiledWorkflow {
            definition: self,
            order,
            inbound,
        })
    }
}

/// Kahn's algorithm; `None` when the graph has a cycle
fn topological_order(def: &WorkflowDefinition) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = def.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        *in_degree.entry(edge.to.as_str()).or_default() += 1;
        outgoing.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    // declaration order among roots keeps the result stable
    let mut queue: VecDeque<&str> = def
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(def.nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for &next in outgoing.get(id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
    }
    (order.len() == def.nodes.len()).then_some(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(name: &str) -> bool {
        matches!(name, "noop" | "query_heuristics")
    }

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("chain", "A -> B -> C")
            .node(NodeSpec::new("a", "noop"))
            .node(NodeSpec::new("b", "noop"))
            .node(NodeSpec::new("c", "noop"))
            .edge(EdgeSpec::new("a", "b"))
            .edge(EdgeSpec::new("b", "c").when("b.proceed == true"))
    }

    #[test]
    fn test_compile_orders_and_indexes() {
        let compiled = chain().compile(known).unwrap();
        assert_eq!(compiled.order, vec!["a", "b", "c"]);
        assert!(compiled.inbound("a").is_empty());
        assert_eq!(compiled.inbound("c")[0].from, "b");
        assert!(compiled.inbound("c")[0].condition.is_some());
    }

    #[test]
    fn test_rejects_malformed_definitions() {
        let cases = vec![
            WorkflowDefinition::new("", "").node(NodeSpec::new("a", "noop")),
            WorkflowDefinition::new("empty", ""),
            chain().node(NodeSpec::new("a", "noop")),
            chain().node(NodeSpec::new("d", "unknown")),
            chain().edge(EdgeSpec::new("c", "zzz")),
            chain().edge(EdgeSpec::new("c", "a")),
            chain().edge(EdgeSpec::new("a", "b")),
            chain().edge(EdgeSpec::new("a", "c").when("a ==")),
            chain().node(NodeSpec::new("input", "noop")),
        ];
        for def in cases {
            let name = format!("{def:?}");
            assert!(
                matches!(def.compile(known), Err(EngineError::Validation(_))),
                "accepted {name}"
            );
        }
    }

    #[test]
    fn test_definition_json_shape() {
        let json = r#"{
            "name": "triage",
            "nodes": [
                {"id": "lookup", "handler": "query_heuristics", "max_retries": 2},
                {"id": "review", "handler": "noop", "optional": true}
            ],
            "edges": [{"from": "lookup", "to": "review", "condition": "lookup.count > 0"}]
        }"#;
        let def: WorkflowDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.nodes[0].max_retries, 2);
        assert!(def.nodes[1].optional);
        let compiled = def.compile(known).unwrap();
        assert_eq!(compiled.order, vec!["lookup", "review"]);
    }
}
