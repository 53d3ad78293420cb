//! Single-node execution: the opaque step body behind a capability trait,
//! plus the per-node retry loop.
//!
//! The runner depends on [`CommandRunner`], not on any specific execution
//! mechanism, so step bodies can be in-process, subprocess, or RPC. The
//! production implementation shells out with a hard per-attempt timeout.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::obs;

use super::condition::SuccessCondition;
use super::{Node, NodeResult, NodeStatus, envelope};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }
    }
}

/// Capability for running one step body.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands via `sh -c` with a hard timeout; the child is killed when
/// the timeout elapses.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(output) => {
                let output = output.with_context(|| format!("failed to spawn: {command}"))?;
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            }
            Err(_) => Ok(CommandOutput::timed_out()),
        }
    }
}

/// Everything one node execution needs from the surrounding run.
pub struct NodeExecution<'a> {
    pub flow_id: &'a str,
    pub task_id: Option<&'a str>,
    pub node_id: &'a str,
    pub node: &'a Node,
    pub persona: &'a str,
    pub dry_run: bool,
    pub parameters: &'a HashMap<String, String>,
}

/// Literal `{{key}}` replacement from the run parameters. No other
/// templating.
pub fn substitute_parameters(command: &str, parameters: &HashMap<String, String>) -> String {
    let mut command = command.to_string();
    for (key, value) in parameters {
        command = command.replace(&format!("{{{{{key}}}}}"), value);
    }
    command
}

/// Execute one node with its retry policy. Every attempt, including dry-run
/// attempts and the final failed one, is observed exactly once in the step
/// latency histogram.
pub async fn execute_node(exec: &NodeExecution<'_>, runner: &dyn CommandRunner) -> NodeResult {
    let max_retries = exec.node.retries;
    let retry_delay = Duration::from_secs(exec.node.retry_delay);
    let timeout = Duration::from_secs(exec.node.timeout);
    let condition = SuccessCondition::parse(exec.node.success_condition.as_deref());
    let command = substitute_parameters(&exec.node.command, exec.parameters);
    let model = exec.node.model.as_deref().unwrap_or("unknown");
    let exec_mode = if exec.dry_run { "dry_run" } else { "live" };

    let mut attempt: u32 = 1;
    loop {
        tracing::info!(
            node = %exec.node_id,
            attempt,
            max_attempts = max_retries + 1,
            "executing node"
        );

        let mut result = {
            let _timer = obs::step_timer(exec.flow_id, exec.node_id, exec.persona, model, exec_mode);
            run_attempt(exec, runner, &command, timeout).await
        };

        let succeeded = result.status != NodeStatus::Timeout
            && result.error_message.is_none()
            && condition.evaluate(result.exit_code, &result.stdout);
        if succeeded {
            result.status = NodeStatus::Success;
        } else if result.status != NodeStatus::Timeout {
            result.status = NodeStatus::Failed;
        }
        result.attempts = attempt;
        result.envelope = Some(envelope::build(
            exec.node_id,
            &result,
            exec.flow_id,
            exec.task_id,
            exec.dry_run,
        ));

        if succeeded || attempt > max_retries {
            return result;
        }

        obs::step_retry(exec.flow_id, exec.node_id, exec.persona);
        tracing::warn!(
            node = %exec.node_id,
            status = result.status.as_str(),
            attempt,
            retry_delay_secs = exec.node.retry_delay,
            "node attempt failed, retrying"
        );
        tokio::time::sleep(retry_delay).await;
        attempt += 1;
    }
}

/// One attempt. Status here is provisional (`Running`); the caller applies
/// the success condition and settles it.
async fn run_attempt(
    exec: &NodeExecution<'_>,
    runner: &dyn CommandRunner,
    command: &str,
    timeout: Duration,
) -> NodeResult {
    let started = Instant::now();
    let mut result = NodeResult {
        node_id: exec.node_id.to_string(),
        status: NodeStatus::Running,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration_seconds: 0.0,
        attempts: 0,
        error_message: None,
        envelope: None,
    };

    if exec.dry_run {
        result.exit_code = Some(0);
        result.stdout = format!("DRY_RUN: {command}");
        tracing::debug!(node = %exec.node_id, command, "dry-run, command not executed");
    } else {
        match runner.run(command, timeout).await {
            Ok(output) if output.timed_out => {
                result.status = NodeStatus::Timeout;
                result.error_message =
                    Some(format!("command timed out after {}s", timeout.as_secs()));
            }
            Ok(output) => {
                result.exit_code = output.exit_code;
                result.stdout = output.stdout;
                result.stderr = output.stderr;
            }
            Err(e) => {
                result.error_message = Some(format!("{e:#}"));
            }
        }
    }

    result.duration_seconds = started.elapsed().as_secs_f64();
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Scripted runner: pops one canned output per call, in order.
    pub(crate) struct ScriptedRunner {
        outputs: Mutex<Vec<CommandOutput>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(outputs: Vec<CommandOutput>) -> Self {
            let mut outputs = outputs;
            outputs.reverse();
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn exit(code: i32) -> CommandOutput {
            CommandOutput {
                exit_code: Some(code),
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(command.to_string());
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ScriptedRunner::exit(0)))
        }
    }

    fn node(retries: u32) -> Node {
        Node {
            node_type: crate::flows::NodeType::Command,
            name: "Test".to_string(),
            command: "echo {{word}}".to_string(),
            timeout: 5,
            retries,
            retry_delay: 0,
            success_condition: None,
            model: None,
        }
    }

    fn exec_ctx<'a>(
        node: &'a Node,
        dry_run: bool,
        parameters: &'a HashMap<String, String>,
    ) -> NodeExecution<'a> {
        NodeExecution {
            flow_id: "flow_test",
            task_id: None,
            node_id: "n1",
            node,
            persona: "CODER_AI",
            dry_run,
            parameters,
        }
    }

    #[test]
    fn test_substitute_parameters() {
        let mut params = HashMap::new();
        params.insert("word".to_string(), "hello".to_string());
        params.insert("other".to_string(), "x".to_string());
        assert_eq!(
            substitute_parameters("echo {{word}} {{word}} {{missing}}", &params),
            "echo hello hello {{missing}}"
        );
    }

    #[tokio::test]
    async fn test_dry_run_fabricates_success() {
        let node = node(0);
        let mut params = HashMap::new();
        params.insert("word".to_string(), "hi".to_string());
        let runner = ScriptedRunner::new(vec![]);

        let result = execute_node(&exec_ctx(&node, true, &params), &runner).await;
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "DRY_RUN: echo hi");
        assert_eq!(result.attempts, 1);
        // Dry run never touches the command runner.
        assert!(runner.calls.lock().unwrap().is_empty());
        assert_eq!(result.envelope.as_ref().unwrap().exec_mode, "DRY_RUN");
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let node = node(0);
        let params = HashMap::new();
        let runner = ScriptedRunner::new(vec![ScriptedRunner::exit(1)]);

        let result = execute_node(&exec_ctx(&node, false, &params), &runner).await;
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        // Fails twice, succeeds on the third attempt.
        let node = node(2);
        let params = HashMap::new();
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::exit(1),
            ScriptedRunner::exit(1),
            ScriptedRunner::exit(0),
        ]);

        let result = execute_node(&exec_ctx(&node, false, &params), &runner).await;
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.attempts, 3);
        assert_eq!(runner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let node = node(2);
        let params = HashMap::new();
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::exit(1),
            ScriptedRunner::exit(1),
            ScriptedRunner::exit(1),
        ]);

        let result = execute_node(&exec_ctx(&node, false, &params), &runner).await;
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_success_condition_contains() {
        let mut node = node(0);
        node.success_condition = Some("contains('READY')".to_string());
        let params = HashMap::new();
        let runner = ScriptedRunner::new(vec![CommandOutput {
            exit_code: Some(1),
            stdout: "system READY now".to_string(),
            stderr: String::new(),
            timed_out: false,
        }]);

        let result = execute_node(&exec_ctx(&node, false, &params), &runner).await;
        assert_eq!(result.status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_timeout_classification() {
        let node = node(0);
        let params = HashMap::new();
        let runner = ScriptedRunner::new(vec![CommandOutput::timed_out()]);

        let result = execute_node(&exec_ctx(&node, false, &params), &runner).await;
        assert_eq!(result.status, NodeStatus::Timeout);
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let result = ShellRunner
            .run("sleep 2", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_shell_runner_captures_output() {
        let result = ShellRunner
            .run("echo out; echo err >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
    }
}
