//! The two tiny condition languages used by flow definitions.
//!
//! Both are closed variant sets: `success_condition` decides
//! whether a node attempt counts as success, `when` gates an edge on a prior
//! node's outcome. Anything unrecognized falls back to the default behavior
//! rather than erroring, so registry authors can't break execution with a
//! typo here (the linter only checks that `when` is a string).

use indexmap::IndexMap;

use super::{NodeResult, NodeStatus};

/// Per-node success condition, parsed from the optional
/// `success_condition` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessCondition {
    /// `exit_code == N`
    ExitEq(i32),
    /// `contains('LITERAL')` — substring match on stdout.
    StdoutContains(String),
    /// Absent or unrecognized: success iff exit code 0.
    Default,
}

impl SuccessCondition {
    pub fn parse(expr: Option<&str>) -> Self {
        let Some(expr) = expr else {
            return Self::Default;
        };
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix("exit_code ==") {
            if let Ok(code) = rest.trim().parse::<i32>() {
                return Self::ExitEq(code);
            }
        }
        if let Some(literal) = parse_contains(expr) {
            return Self::StdoutContains(literal);
        }
        Self::Default
    }

    pub fn evaluate(&self, exit_code: Option<i32>, stdout: &str) -> bool {
        match self {
            Self::ExitEq(want) => exit_code == Some(*want),
            Self::StdoutContains(literal) => stdout.contains(literal.as_str()),
            Self::Default => exit_code == Some(0),
        }
    }
}

fn parse_contains(expr: &str) -> Option<String> {
    let inner = expr.strip_prefix("contains(")?.strip_suffix(')')?.trim();
    let literal = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;
    Some(literal.to_string())
}

/// Edge `when` condition, evaluated against prior node results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeCondition {
    /// `{node}.success` — true iff the referenced node succeeded.
    NodeSuccess(String),
    /// Absent or unrecognized: always true.
    Always,
}

impl EdgeCondition {
    pub fn parse(expr: Option<&str>) -> Self {
        let Some(expr) = expr else {
            return Self::Always;
        };
        if expr.contains(".success") {
            let node_id = expr.split('.').next().unwrap_or("").trim();
            if !node_id.is_empty() {
                return Self::NodeSuccess(node_id.to_string());
            }
        }
        Self::Always
    }

    pub fn evaluate(&self, results: &IndexMap<String, NodeResult>) -> bool {
        match self {
            Self::NodeSuccess(node_id) => results
                .get(node_id)
                .map(|r| r.status == NodeStatus::Success)
                .unwrap_or(true),
            Self::Always => true,
        }
    }
}
