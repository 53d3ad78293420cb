//! Wire record for one queued step.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    DryRun,
    Live,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::DryRun => "dry_run",
            ExecMode::Live => "live",
        }
    }
}

/// One step to execute on a persona queue. The payload is step-specific and
/// must not contain PII; it feeds the idempotency hash, nothing else reads
/// it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTask {
    pub flow_id: String,
    pub task_id: String,
    pub step_id: String,
    pub persona: String,
    pub exec_mode: ExecMode,
    pub branch: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub allow_destructive: bool,
    /// Delivery attempt counter, carried on the wire so broker-level retries
    /// survive worker restarts.
    #[serde(default)]
    pub attempt: u32,
}

fn default_model() -> String {
    "unknown".to_string()
}

impl StepTask {
    pub fn dry_run(flow_id: &str, task_id: &str, step_id: &str, persona: &str, branch: &str) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            task_id: task_id.to_string(),
            step_id: step_id.to_string(),
            persona: persona.to_string(),
            exec_mode: ExecMode::DryRun,
            branch: branch.to_string(),
            model: default_model(),
            payload: serde_json::Map::new(),
            allow_destructive: false,
            attempt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_mode_serialization() {
        assert_eq!(serde_json::to_string(&ExecMode::DryRun).unwrap(), "\"dry_run\"");
        assert_eq!(serde_json::to_string(&ExecMode::Live).unwrap(), "\"live\"");
        assert_eq!(ExecMode::DryRun.as_str(), "dry_run");
    }

    #[test]
    fn test_task_roundtrip_with_defaults() {
        let json = r#"{
            "flow_id": "flow_demo",
            "task_id": "T-0001",
            "step_id": "step_001",
            "persona": "CODER_AI",
            "exec_mode": "dry_run",
            "branch": "feature/queue-demo"
        }"#;
        let task: StepTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.model, "unknown");
        assert!(task.payload.is_empty());
        assert!(!task.allow_destructive);
        assert_eq!(task.attempt, 0);

        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: StepTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.task_id, "T-0001");
        assert_eq!(decoded.exec_mode, ExecMode::DryRun);
    }
}
