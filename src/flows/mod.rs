pub mod condition;
pub mod envelope;
pub mod executor;
pub mod graph;
pub mod guards;
pub mod linter;
pub mod render;
pub mod runner;

use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::flows::envelope::EnvelopeV2;

/// Default location of the flow registry, relative to the working directory.
pub const DEFAULT_REGISTRY_PATH: &str = "flow/flow_registry.yaml";

/// The flow registry document: a version tag plus a map of flow definitions.
///
/// The runner works on this typed model; the linter works on the raw YAML
/// value so that shape errors can be reported instead of failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRegistry {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub flows: IndexMap<String, Flow>,
}

impl FlowRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read flow registry: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("failed to parse flow registry: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("invalid registry document")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub guards: Vec<String>,
    #[serde(default)]
    pub config: FlowConfig,
    /// Node map keeps YAML document order so execution order is stable.
    pub nodes: IndexMap<String, Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    /// Opaque command line; `{{param}}` placeholders are substituted at
    /// execution time from the run parameters.
    pub command: String,
    /// Per-attempt timeout in seconds (1..=3600, enforced by the linter).
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Extra attempts after the first failure (0..=10).
    #[serde(default)]
    pub retries: u32,
    /// Delay between attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    /// Model label, metrics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_timeout() -> u64 {
    300
}

fn default_retry_delay() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Command,
    Condition,
    Gateway,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Command => "command",
            NodeType::Condition => "condition",
            NodeType::Gateway => "gateway",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_execution_time: None,
            max_iterations: None,
            fail_fast: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-node lifecycle state.
///
/// `pending → running → (success | failed | timeout | retrying → running |
/// skipped)`. `retrying` is transient between attempts; `skipped` is entered
/// only from `pending` when a predecessor did not succeed or the incoming
/// edge condition evaluated false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
    Skipped,
    Timeout,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Retrying => "retrying",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Timeout => "timeout",
        }
    }
}

/// Outcome of executing (or skipping) a single node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<EnvelopeV2>,
}

impl NodeResult {
    pub fn skipped(node_id: &str, reason: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_seconds: 0.0,
            attempts: 0,
            error_message: Some(reason.to_string()),
            envelope: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "2.0"
flows:
  flow_sample:
    id: flow_sample
    name: "Sample"
    guards: [branch_not_main]
    config: { max_execution_time: 3600, fail_fast: true }
    nodes:
      build:
        type: command
        name: "Build"
        command: "echo build"
        timeout: 60
        retries: 2
        retry_delay: 5
        success_condition: "exit_code == 0"
        model: "local-13b"
      test:
        type: command
        name: "Test"
        command: "echo test"
    edges:
      - { from: build, to: test, when: "build.success" }
"#;

    #[test]
    fn test_registry_from_yaml() {
        let registry = FlowRegistry::from_yaml(SAMPLE).unwrap();
        assert_eq!(registry.version, "2.0");
        assert_eq!(registry.flows.len(), 1);

        let flow = &registry.flows["flow_sample"];
        assert_eq!(flow.id, "flow_sample");
        assert_eq!(flow.guards, vec!["branch_not_main"]);
        assert_eq!(flow.config.max_execution_time, Some(3600));
        assert!(flow.config.fail_fast);
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.edges.len(), 1);
        assert_eq!(flow.edges[0].when.as_deref(), Some("build.success"));
    }

    #[test]
    fn test_node_defaults() {
        let registry = FlowRegistry::from_yaml(SAMPLE).unwrap();
        let node = &registry.flows["flow_sample"].nodes["test"];
        assert_eq!(node.timeout, 300);
        assert_eq!(node.retries, 0);
        assert_eq!(node.retry_delay, 30);
        assert!(node.success_condition.is_none());
        assert!(node.model.is_none());
    }

    #[test]
    fn test_node_order_preserved() {
        let registry = FlowRegistry::from_yaml(SAMPLE).unwrap();
        let ids: Vec<&String> = registry.flows["flow_sample"].nodes.keys().collect();
        assert_eq!(ids, ["build", "test"]);
    }

    #[test]
    fn test_fail_fast_defaults_true() {
        let registry = FlowRegistry::from_yaml(
            r#"
flows:
  flow_x:
    id: flow_x
    name: "X"
    nodes:
      n1: { type: command, name: "n1", command: "true" }
    edges: []
"#,
        )
        .unwrap();
        assert!(registry.flows["flow_x"].config.fail_fast);
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let registry = FlowRegistry::load(&path).unwrap();
        assert_eq!(registry.flows.len(), 1);

        let err = FlowRegistry::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read flow registry"));
    }

    #[test]
    fn test_node_type_serialization() {
        assert_eq!(
            serde_json::to_string(&NodeType::Command).unwrap(),
            "\"command\""
        );
        assert_eq!(
            serde_json::to_string(&NodeType::Gateway).unwrap(),
            "\"gateway\""
        );
        assert_eq!(
            serde_json::to_string(&NodeStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }
}
