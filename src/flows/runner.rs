//! DAG-ordered flow execution with guards, conditional edges, fail-fast,
//! and run summaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;

use crate::obs;

use super::condition::EdgeCondition;
use super::executor::{CommandRunner, NodeExecution, ShellRunner, execute_node};
use super::{Flow, FlowRegistry, NodeResult, NodeStatus, graph, guards};

/// Reasons a run can abort before or during node execution. The kind string
/// feeds the `flow_fail_total{reason}` label.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("flow '{0}' not found in registry")]
    UnknownFlow(String),

    #[error("flow guards failed - execution blocked ({0})")]
    GuardsFailed(String),

    #[error("flow '{flow_id}' contains a cycle: {cycle:?}")]
    CyclicFlow { flow_id: String, cycle: Vec<String> },

    #[error("flow '{0}' has no nodes to execute")]
    EmptyFlow(String),
}

impl FlowError {
    pub fn reason(&self) -> &'static str {
        match self {
            FlowError::UnknownFlow(_) => "unknown_flow",
            FlowError::GuardsFailed(_) => "guards_failed",
            FlowError::CyclicFlow { .. } => "cyclic_flow",
            FlowError::EmptyFlow(_) => "empty_flow",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub parameters: HashMap<String, String>,
    pub dry_run: bool,
    pub task_id: Option<String>,
}

/// Compact projection of a node result for the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub status: NodeStatus,
    pub duration: f64,
    pub attempts: u32,
    pub exit_code: Option<i32>,
}

/// One append-only log line. Node lines carry `node_id`/`status`/`duration`;
/// error lines carry `level`/`message`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogEntry {
    fn node(node_id: &str, status: NodeStatus, duration: f64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            node_id: Some(node_id.to_string()),
            status: Some(status),
            duration: Some(duration),
            level: None,
            message: None,
        }
    }

    fn error(message: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            node_id: None,
            status: None,
            duration: None,
            level: Some("ERROR".to_string()),
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub flow_id: String,
    pub execution_time: f64,
    pub total_nodes: usize,
    pub successful_nodes: usize,
    pub failed_nodes: usize,
    pub success_rate: f64,
    pub dry_run: bool,
    pub node_results: IndexMap<String, NodeSummary>,
    pub execution_log: Vec<LogEntry>,
}

/// Summary plus the full per-node results (envelopes included).
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub results: IndexMap<String, NodeResult>,
}

pub struct FlowRunner {
    registry: FlowRegistry,
    command_runner: Arc<dyn CommandRunner>,
}

impl FlowRunner {
    pub fn new(registry: FlowRegistry) -> Self {
        Self::with_command_runner(registry, Arc::new(ShellRunner))
    }

    pub fn with_command_runner(
        registry: FlowRegistry,
        command_runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            registry,
            command_runner,
        }
    }

    /// Execute a flow end to end. Nodes run sequentially in topological
    /// order; a failed node marks its dependents skipped, or stops the run
    /// entirely under `fail_fast`.
    pub async fn execute(&self, flow_id: &str, opts: RunOptions) -> Result<RunOutcome, FlowError> {
        let flow = self
            .registry
            .flows
            .get(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        let exec_mode = if opts.dry_run { "dry_run" } else { "live" };
        let persona = opts
            .parameters
            .get("persona")
            .cloned()
            .unwrap_or_else(|| "CODER_AI".to_string());
        let branch = opts
            .parameters
            .get("branch")
            .cloned()
            .or_else(guards::current_branch)
            .unwrap_or_else(|| "unknown".to_string());

        let run_id = uuid::Uuid::new_v4().to_string();
        let short_id = &run_id[..8];
        tracing::info!(
            flow = %flow_id,
            run = %short_id,
            dry_run = opts.dry_run,
            persona = %persona,
            branch = %branch,
            "▶ executing flow"
        );
        obs::flow_start(flow_id, &persona, exec_mode, &branch);

        let started = Instant::now();
        match self.execute_inner(flow, flow_id, &opts, started).await {
            Ok(outcome) => {
                obs::flow_end(flow_id, &persona, exec_mode, &branch, true, "ok");
                tracing::info!(
                    flow = %flow_id,
                    elapsed = format_args!("{:.1}s", started.elapsed().as_secs_f64()),
                    success_rate = outcome.summary.success_rate,
                    "✓ flow completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                obs::flow_end(flow_id, &persona, exec_mode, &branch, false, e.reason());
                tracing::error!(flow = %flow_id, error = %e, "✗ flow failed");
                Err(e)
            }
        }
    }

    async fn execute_inner(
        &self,
        flow: &Flow,
        flow_id: &str,
        opts: &RunOptions,
        started: Instant,
    ) -> Result<RunOutcome, FlowError> {
        let mut log: Vec<LogEntry> = Vec::new();

        // 1. Flow-level guards.
        let guard_ctx = guards::GuardContext {
            dry_run: opts.dry_run,
        };
        for name in &flow.guards {
            match guards::evaluate(name, &guard_ctx) {
                None => {
                    return Err(FlowError::GuardsFailed(format!("unknown guard '{name}'")));
                }
                Some(outcome) if !outcome.passed => {
                    tracing::warn!(guard = %name, reason = %outcome.reason, "✗ guard failed");
                    log.push(LogEntry::error(&format!(
                        "guard failed: {name} ({})",
                        outcome.reason
                    )));
                    return Err(FlowError::GuardsFailed(name.clone()));
                }
                Some(outcome) => {
                    tracing::info!(guard = %name, reason = %outcome.reason, "✓ guard passed");
                }
            }
        }

        // 2. Build the execution order.
        let node_ids: Vec<String> = flow.nodes.keys().cloned().collect();
        if node_ids.is_empty() {
            return Err(FlowError::EmptyFlow(flow_id.to_string()));
        }
        let edge_pairs = graph::edge_pairs(flow);
        let order = graph::topological_order(&node_ids, &edge_pairs).map_err(|cycle| {
            FlowError::CyclicFlow {
                flow_id: flow_id.to_string(),
                cycle,
            }
        })?;

        // 3. Execute in topological order.
        let mut results: IndexMap<String, NodeResult> = IndexMap::new();
        for node_id in &order {
            if self.blocked_by_predecessor(flow, node_id, &results) {
                tracing::info!(node = %node_id, "node skipped, predecessor failed");
                results.insert(
                    node_id.clone(),
                    NodeResult::skipped(node_id, "predecessor failed"),
                );
                continue;
            }

            let node = &flow.nodes[node_id.as_str()];
            let exec = NodeExecution {
                flow_id,
                task_id: opts.task_id.as_deref(),
                node_id,
                node,
                persona: opts
                    .parameters
                    .get("persona")
                    .map(String::as_str)
                    .unwrap_or("CODER_AI"),
                dry_run: opts.dry_run,
                parameters: &opts.parameters,
            };
            let result = execute_node(&exec, self.command_runner.as_ref()).await;

            log.push(LogEntry::node(
                node_id,
                result.status,
                result.duration_seconds,
            ));

            let failed = matches!(result.status, NodeStatus::Failed | NodeStatus::Timeout);
            results.insert(node_id.clone(), result);

            if failed && flow.config.fail_fast {
                tracing::warn!(node = %node_id, "fail-fast enabled, stopping execution");
                break;
            }
        }

        // 4. Summarize.
        let total_nodes = results.len();
        let successful_nodes = results
            .values()
            .filter(|r| r.status == NodeStatus::Success)
            .count();
        let failed_nodes = results
            .values()
            .filter(|r| matches!(r.status, NodeStatus::Failed | NodeStatus::Timeout))
            .count();

        let node_summaries = results
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    NodeSummary {
                        status: r.status,
                        duration: r.duration_seconds,
                        attempts: r.attempts,
                        exit_code: r.exit_code,
                    },
                )
            })
            .collect();

        let summary = RunSummary {
            flow_id: flow_id.to_string(),
            execution_time: started.elapsed().as_secs_f64(),
            total_nodes,
            successful_nodes,
            failed_nodes,
            success_rate: if total_nodes > 0 {
                successful_nodes as f64 / total_nodes as f64
            } else {
                0.0
            },
            dry_run: opts.dry_run,
            node_results: node_summaries,
            execution_log: log,
        };

        Ok(RunOutcome { summary, results })
    }

    /// A node is blocked when any already-executed predecessor did not
    /// succeed, or the incoming edge's `when` condition evaluates false.
    fn blocked_by_predecessor(
        &self,
        flow: &Flow,
        node_id: &str,
        results: &IndexMap<String, NodeResult>,
    ) -> bool {
        for edge in flow.edges.iter().filter(|e| e.to == node_id) {
            let Some(pred_result) = results.get(&edge.from) else {
                continue;
            };
            if pred_result.status != NodeStatus::Success {
                return true;
            }
            if !EdgeCondition::parse(edge.when.as_deref()).evaluate(results) {
                return true;
            }
        }
        false
    }
}
