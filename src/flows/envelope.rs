//! Structured post-execution record for a node (envelope v2).
//!
//! The runner composes envelopes but never consumes them; downstream tools
//! read them from run summaries. No secrets or step payloads are embedded.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{NodeResult, NodeStatus};

pub const ENVELOPE_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeV2 {
    pub envelope_version: String,
    pub schema_version: String,
    pub generated_at: String,
    pub decision: String,
    pub chosen_id: String,
    pub flow_id: String,
    pub task_id: String,
    pub step_id: String,
    pub candidate: Candidate,
    pub exec_mode: String,
    pub metadata: EnvelopeMetadata,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub action_type: String,
    pub scores: Scores,
    pub explanation: String,
    pub preconds: Vec<String>,
    pub command: String,
}

/// Ranking placeholders; a future selection policy may replace them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scores {
    pub intent: f64,
    pub state: f64,
    pub evidence: f64,
    pub recency: f64,
    pub pref: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
}

impl Default for Scores {
    fn default() -> Self {
        Self {
            intent: 0.95,
            state: 0.9,
            evidence: 0.85,
            recency: 0.9,
            pref: 0.88,
            final_score: 0.873,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub feature_flag: String,
    pub safety_gate: String,
    pub branch_protection: bool,
    pub rollback_enabled: bool,
    pub execution_duration: f64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub confidence_score: f64,
    pub validation_status: String,
    pub approval_required: bool,
}

/// Project a node result into its envelope. Pure except for the timestamp.
pub fn build(
    node_id: &str,
    result: &NodeResult,
    flow_id: &str,
    task_id: Option<&str>,
    dry_run: bool,
) -> EnvelopeV2 {
    let scores = Scores::default();
    let confidence_score = scores.final_score;
    EnvelopeV2 {
        envelope_version: ENVELOPE_VERSION.to_string(),
        schema_version: ENVELOPE_VERSION.to_string(),
        generated_at: Utc::now().to_rfc3339(),
        decision: "NODE_EXECUTION".to_string(),
        chosen_id: node_id.to_string(),
        flow_id: flow_id.to_string(),
        task_id: task_id
            .map(String::from)
            .unwrap_or_else(|| format!("task_{node_id}")),
        step_id: format!("step_{node_id}"),
        candidate: Candidate {
            id: node_id.to_string(),
            action_type: "FLOW_NODE_EXECUTION".to_string(),
            scores,
            explanation: format!("Executed flow node: {node_id}"),
            preconds: Vec::new(),
            command: format!("Executed: {node_id}"),
        },
        exec_mode: if dry_run { "DRY_RUN" } else { "LIVE_EXECUTION" }.to_string(),
        metadata: EnvelopeMetadata {
            feature_flag: "flow_execution".to_string(),
            safety_gate: "flow_guards_passed".to_string(),
            branch_protection: true,
            rollback_enabled: false,
            execution_duration: result.duration_seconds,
            attempts: result.attempts,
        },
        provenance: Provenance {
            source: "flow_runner".to_string(),
            confidence_score,
            validation_status: if result.status == NodeStatus::Success {
                "completed"
            } else {
                "failed"
            }
            .to_string(),
            approval_required: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(status: NodeStatus) -> NodeResult {
        NodeResult {
            node_id: "build".to_string(),
            status,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_seconds: 1.5,
            attempts: 2,
            error_message: None,
            envelope: None,
        }
    }

    #[test]
    fn test_build_dry_run() {
        let envelope = build("build", &sample_result(NodeStatus::Success), "flow_x", None, true);
        assert_eq!(envelope.envelope_version, "2.0");
        assert_eq!(envelope.exec_mode, "DRY_RUN");
        assert_eq!(envelope.chosen_id, "build");
        assert_eq!(envelope.task_id, "task_build");
        assert_eq!(envelope.step_id, "step_build");
        assert_eq!(envelope.provenance.validation_status, "completed");
        assert_eq!(envelope.metadata.attempts, 2);
        assert!((envelope.candidate.scores.final_score - 0.873).abs() < f64::EPSILON);
    }

    #[test]
    fn test_build_live_failed() {
        let envelope = build(
            "build",
            &sample_result(NodeStatus::Failed),
            "flow_x",
            Some("T-0001"),
            false,
        );
        assert_eq!(envelope.exec_mode, "LIVE_EXECUTION");
        assert_eq!(envelope.task_id, "T-0001");
        assert_eq!(envelope.provenance.validation_status, "failed");
    }

    #[test]
    fn test_scores_serialize_final_key() {
        let json = serde_json::to_value(Scores::default()).unwrap();
        assert!((json["final"].as_f64().unwrap() - 0.873).abs() < f64::EPSILON);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = build("n1", &sample_result(NodeStatus::Success), "flow_x", None, true);
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: EnvelopeV2 = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.exec_mode, "DRY_RUN");
        assert_eq!(parsed.candidate.id, "n1");
    }
}
