//! Structural validation of a flow registry document.
//!
//! The linter works on the raw YAML value rather than the typed model so it
//! can report shape problems (wrong types, missing fields) with stable codes
//! instead of surfacing a deserialization error. Findings accumulate per
//! flow; an invalid registry shape short-circuits flow validation.

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::{graph, guards};

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+$").expect("version regex"));
static FLOW_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^flow_[a-z_][a-z0-9_]*$").expect("flow id regex"));
static NODE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("node id regex"));

const VALID_NODE_TYPES: [&str; 3] = ["command", "condition", "gateway"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// One structural finding with a stable machine-readable code.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub level: Severity,
    pub code: &'static str,
    pub message: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub flow_id: String,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub info: Vec<Finding>,
}

impl ValidationResult {
    fn new(flow_id: &str) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, finding: Finding) {
        match finding.level {
            Severity::Error => self.errors.push(finding),
            Severity::Warning => self.warnings.push(finding),
            Severity::Info => self.info.push(finding),
        }
    }
}

pub struct Linter {
    file_path: String,
}

impl Linter {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    /// Validate a registry file. IO and YAML errors become the
    /// `REGISTRY_LOAD_FAILED` finding on the `registry` entry.
    pub fn lint_file(path: &Path) -> IndexMap<String, ValidationResult> {
        let linter = Self::new(path.display().to_string());
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                return linter.load_failure(format!("failed to load registry: {e}"));
            }
        };
        linter.lint_str(&content)
    }

    /// Validate a registry document. Returns one `ValidationResult` per flow
    /// plus a `registry` entry for document-level findings.
    pub fn lint_str(&self, content: &str) -> IndexMap<String, ValidationResult> {
        let doc: Value = match serde_yaml::from_str(content) {
            Ok(doc) => doc,
            Err(e) => {
                return self.load_failure(format!("failed to load registry: {e}"));
            }
        };

        let mut results = IndexMap::new();
        let registry_result = self.validate_registry_structure(&doc);
        let registry_valid = registry_result.is_valid();
        results.insert("registry".to_string(), registry_result);

        if !registry_valid {
            return results;
        }

        if let Some(flows) = doc.get("flows").and_then(Value::as_mapping) {
            for (key, flow_def) in flows {
                let flow_id = key.as_str().unwrap_or("<non-string>").to_string();
                let result = self.validate_flow(&flow_id, flow_def);
                results.insert(flow_id, result);
            }
        }

        results
    }

    fn load_failure(&self, message: String) -> IndexMap<String, ValidationResult> {
        let mut result = ValidationResult::new("registry");
        result.push(self.finding(Severity::Error, "REGISTRY_LOAD_FAILED", message));
        let mut results = IndexMap::new();
        results.insert("registry".to_string(), result);
        results
    }

    fn finding(&self, level: Severity, code: &'static str, message: impl Into<String>) -> Finding {
        Finding {
            level,
            code,
            message: message.into(),
            file_path: self.file_path.clone(),
        }
    }

    fn validate_registry_structure(&self, doc: &Value) -> ValidationResult {
        let mut result = ValidationResult::new("registry");

        for field in ["version", "flows"] {
            if doc.get(field).is_none() {
                result.push(self.finding(
                    Severity::Error,
                    "MISSING_REGISTRY_FIELD",
                    format!("required field '{field}' missing from registry"),
                ));
            }
        }

        if let Some(version) = doc.get("version") {
            let text = scalar_to_string(version);
            if !VERSION_RE.is_match(&text) {
                result.push(self.finding(
                    Severity::Warning,
                    "INVALID_VERSION_FORMAT",
                    format!("version '{text}' should follow MAJOR.MINOR versioning"),
                ));
            }
        }

        if let Some(flows) = doc.get("flows") {
            if flows.as_mapping().is_none() {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_FLOWS_STRUCTURE",
                    "flows must be a mapping",
                ));
            }
        }

        result
    }

    fn validate_flow(&self, flow_id: &str, flow_def: &Value) -> ValidationResult {
        let mut result = ValidationResult::new(flow_id);

        for field in ["id", "name", "nodes", "edges"] {
            if flow_def.get(field).is_none() {
                result.push(self.finding(
                    Severity::Error,
                    "MISSING_FLOW_FIELD",
                    format!("required field '{field}' missing from flow '{flow_id}'"),
                ));
            }
        }

        if let Some(id) = flow_def.get("id").and_then(Value::as_str) {
            if !FLOW_ID_RE.is_match(id) {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_FLOW_ID_FORMAT",
                    format!("flow id '{id}' must match pattern 'flow_[a-z_][a-z0-9_]*'"),
                ));
            }
        }

        if let Some(nodes) = flow_def.get("nodes") {
            self.validate_nodes(nodes, flow_id, &mut result);
        }

        if let Some(edges) = flow_def.get("edges") {
            self.validate_edges(edges, flow_def.get("nodes"), flow_id, &mut result);
        }

        if let Some(guards) = flow_def.get("guards") {
            self.validate_guards(guards, flow_id, &mut result);
        }

        if let (Some(nodes), Some(edges)) = (flow_def.get("nodes"), flow_def.get("edges")) {
            self.validate_dag(nodes, edges, flow_id, &mut result);
        }

        if let Some(config) = flow_def.get("config") {
            self.validate_config(config, flow_id, &mut result);
        }

        result
    }

    fn validate_nodes(&self, nodes: &Value, flow_id: &str, result: &mut ValidationResult) {
        let Some(nodes) = nodes.as_mapping() else {
            result.push(self.finding(
                Severity::Error,
                "INVALID_NODES_TYPE",
                format!("nodes must be a mapping in flow '{flow_id}'"),
            ));
            return;
        };

        for (key, node_def) in nodes {
            let node_id = key.as_str().unwrap_or("<non-string>");
            if !NODE_ID_RE.is_match(node_id) {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_NODE_ID_FORMAT",
                    format!("node id '{node_id}' must match pattern '[a-z_][a-z0-9_]*'"),
                ));
            }

            for field in ["type", "name", "command"] {
                if node_def.get(field).is_none() {
                    result.push(self.finding(
                        Severity::Error,
                        "MISSING_NODE_FIELD",
                        format!(
                            "required field '{field}' missing from node '{node_id}' in flow '{flow_id}'"
                        ),
                    ));
                }
            }

            if let Some(node_type) = node_def.get("type") {
                let text = scalar_to_string(node_type);
                if !VALID_NODE_TYPES.contains(&text.as_str()) {
                    result.push(self.finding(
                        Severity::Error,
                        "INVALID_NODE_TYPE",
                        format!("node type '{text}' not in valid types: {VALID_NODE_TYPES:?}"),
                    ));
                }
            }

            if let Some(timeout) = node_def.get("timeout") {
                match timeout.as_i64() {
                    Some(t) if (1..=3600).contains(&t) => {}
                    _ => {
                        result.push(self.finding(
                            Severity::Error,
                            "INVALID_TIMEOUT",
                            format!(
                                "timeout {} must be an integer between 1-3600 seconds",
                                scalar_to_string(timeout)
                            ),
                        ));
                    }
                }
            }

            if let Some(retries) = node_def.get("retries") {
                match retries.as_i64() {
                    Some(r) if (0..=10).contains(&r) => {}
                    _ => {
                        result.push(self.finding(
                            Severity::Error,
                            "INVALID_RETRIES",
                            format!(
                                "retries {} must be an integer between 0-10",
                                scalar_to_string(retries)
                            ),
                        ));
                    }
                }
            }
        }
    }

    fn validate_edges(
        &self,
        edges: &Value,
        nodes: Option<&Value>,
        flow_id: &str,
        result: &mut ValidationResult,
    ) {
        let Some(edges) = edges.as_sequence() else {
            result.push(self.finding(
                Severity::Error,
                "INVALID_EDGES_TYPE",
                format!("edges must be a list in flow '{flow_id}'"),
            ));
            return;
        };

        let node_ids: Vec<&str> = nodes
            .and_then(Value::as_mapping)
            .map(|m| m.keys().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        for (i, edge) in edges.iter().enumerate() {
            if edge.as_mapping().is_none() {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_EDGE_TYPE",
                    format!("edge {i} must be a mapping in flow '{flow_id}'"),
                ));
                continue;
            }

            for field in ["from", "to"] {
                if edge.get(field).is_none() {
                    result.push(self.finding(
                        Severity::Error,
                        "MISSING_EDGE_FIELD",
                        format!("required field '{field}' missing from edge {i} in flow '{flow_id}'"),
                    ));
                }
            }

            if let Some(from) = edge.get("from").and_then(Value::as_str) {
                if !node_ids.contains(&from) {
                    result.push(self.finding(
                        Severity::Error,
                        "INVALID_EDGE_FROM",
                        format!("edge {i} references unknown node '{from}' in flow '{flow_id}'"),
                    ));
                }
            }

            if let Some(to) = edge.get("to").and_then(Value::as_str) {
                if !node_ids.contains(&to) {
                    result.push(self.finding(
                        Severity::Error,
                        "INVALID_EDGE_TO",
                        format!("edge {i} references unknown node '{to}' in flow '{flow_id}'"),
                    ));
                }
            }

            if let Some(when) = edge.get("when") {
                if when.as_str().is_none() {
                    result.push(self.finding(
                        Severity::Error,
                        "INVALID_WHEN_CONDITION",
                        format!("edge {i} 'when' condition must be a string in flow '{flow_id}'"),
                    ));
                }
            }
        }
    }

    fn validate_guards(&self, guard_list: &Value, flow_id: &str, result: &mut ValidationResult) {
        let Some(guard_list) = guard_list.as_sequence() else {
            result.push(self.finding(
                Severity::Error,
                "INVALID_GUARDS_TYPE",
                format!("guards must be a list in flow '{flow_id}'"),
            ));
            return;
        };

        for guard in guard_list {
            let Some(name) = guard.as_str() else {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_GUARD_TYPE",
                    format!(
                        "guard '{}' must be a string in flow '{flow_id}'",
                        scalar_to_string(guard)
                    ),
                ));
                continue;
            };

            if !guards::is_known(name) {
                result.push(self.finding(
                    Severity::Error,
                    "UNKNOWN_GUARD",
                    format!("unknown guard '{name}' in flow '{flow_id}'"),
                ));
            }
        }
    }

    fn validate_dag(
        &self,
        nodes: &Value,
        edges: &Value,
        flow_id: &str,
        result: &mut ValidationResult,
    ) {
        let node_ids: Vec<String> = nodes
            .as_mapping()
            .map(|m| {
                m.keys()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let edge_pairs: Vec<(String, String)> = edges
            .as_sequence()
            .map(|seq| {
                seq.iter()
                    .filter_map(|edge| {
                        let from = edge.get("from")?.as_str()?;
                        let to = edge.get("to")?.as_str()?;
                        Some((from.to_string(), to.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(cycle) = graph::find_cycle(&node_ids, &edge_pairs) {
            result.push(self.finding(
                Severity::Error,
                "CYCLIC_DEPENDENCY",
                format!("flow '{flow_id}' contains a cycle: {cycle:?}"),
            ));
            return;
        }

        if graph::roots(&node_ids, &edge_pairs).is_empty() {
            result.push(self.finding(
                Severity::Error,
                "NO_ROOT_NODES",
                format!("flow '{flow_id}' has no root nodes (nodes with no incoming edges)"),
            ));
        }
    }

    fn validate_config(&self, config: &Value, flow_id: &str, result: &mut ValidationResult) {
        if config.as_mapping().is_none() {
            result.push(self.finding(
                Severity::Error,
                "INVALID_CONFIG_TYPE",
                format!("config must be a mapping in flow '{flow_id}'"),
            ));
            return;
        }

        if let Some(max_time) = config.get("max_execution_time") {
            if !max_time.as_i64().map(|v| v >= 1).unwrap_or(false) {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_MAX_EXECUTION_TIME",
                    format!("max_execution_time must be a positive integer in flow '{flow_id}'"),
                ));
            }
        }

        if let Some(max_iter) = config.get("max_iterations") {
            if !max_iter.as_i64().map(|v| v >= 1).unwrap_or(false) {
                result.push(self.finding(
                    Severity::Error,
                    "INVALID_MAX_ITERATIONS",
                    format!("max_iterations must be a positive integer in flow '{flow_id}'"),
                ));
            }
        }
    }
}

/// Render a scalar YAML value for an error message without quoting noise.
fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lint(doc: &str) -> IndexMap<String, ValidationResult> {
        Linter::new("test_registry.yaml").lint_str(doc)
    }

    fn codes(result: &ValidationResult) -> Vec<&'static str> {
        result.errors.iter().map(|f| f.code).collect()
    }

    const VALID: &str = r#"
version: "2.0"
flows:
  flow_ok:
    id: flow_ok
    name: "OK"
    guards: [dry_run_unless_allowed]
    config: { max_execution_time: 100, max_iterations: 10, fail_fast: true }
    nodes:
      first: { type: command, name: "First", command: "echo 1", timeout: 30, retries: 1 }
      second: { type: command, name: "Second", command: "echo 2" }
    edges:
      - { from: first, to: second, when: "first.success" }
"#;

    #[test]
    fn test_valid_registry() {
        let results = lint(VALID);
        assert!(results.values().all(ValidationResult::is_valid));
        assert!(results.contains_key("flow_ok"));
    }

    #[test]
    fn test_unparseable_registry() {
        let results = lint(":\n  - [");
        assert_eq!(codes(&results["registry"]), ["REGISTRY_LOAD_FAILED"]);
    }

    #[test]
    fn test_missing_registry_fields() {
        let results = lint("{}");
        let registry = &results["registry"];
        assert_eq!(registry.errors.len(), 2);
        assert!(codes(registry).iter().all(|c| *c == "MISSING_REGISTRY_FIELD"));
        // Invalid registry short-circuits flow validation.
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_version_format_warning() {
        let results = lint("version: v2\nflows: {}\n");
        let registry = &results["registry"];
        assert!(registry.is_valid());
        assert_eq!(registry.warnings[0].code, "INVALID_VERSION_FORMAT");
    }

    #[test]
    fn test_flows_must_be_mapping() {
        let results = lint("version: \"1.0\"\nflows: [a, b]\n");
        assert!(codes(&results["registry"]).contains(&"INVALID_FLOWS_STRUCTURE"));
    }

    #[test]
    fn test_bad_flow_id_and_missing_fields() {
        let results = lint(
            r#"
version: "2.0"
flows:
  BadFlow:
    id: BadFlow
    name: "Bad"
    nodes: {}
    edges: []
"#,
        );
        let flow = &results["BadFlow"];
        assert!(codes(flow).contains(&"INVALID_FLOW_ID_FORMAT"));
        // Zero nodes means zero roots.
        assert!(codes(flow).contains(&"NO_ROOT_NODES"));
    }

    #[test]
    fn test_node_validation() {
        let results = lint(
            r#"
version: "2.0"
flows:
  flow_bad_nodes:
    id: flow_bad_nodes
    name: "Bad nodes"
    nodes:
      UPPER: { type: rocket, name: "X", command: "x", timeout: 9000, retries: 99 }
      ok_node: { type: command, name: "Y" }
    edges: []
"#,
        );
        let flow = &results["flow_bad_nodes"];
        let codes = codes(flow);
        assert!(codes.contains(&"INVALID_NODE_ID_FORMAT"));
        assert!(codes.contains(&"INVALID_NODE_TYPE"));
        assert!(codes.contains(&"INVALID_TIMEOUT"));
        assert!(codes.contains(&"INVALID_RETRIES"));
        // ok_node is missing its command.
        assert!(codes.contains(&"MISSING_NODE_FIELD"));
    }

    #[test]
    fn test_edge_references() {
        let results = lint(
            r#"
version: "2.0"
flows:
  flow_edges:
    id: flow_edges
    name: "Edges"
    nodes:
      a: { type: command, name: "A", command: "a" }
    edges:
      - { from: a, to: ghost }
      - { from: phantom, to: a, when: 42 }
      - { to: a }
"#,
        );
        let flow = &results["flow_edges"];
        let codes = codes(flow);
        assert!(codes.contains(&"INVALID_EDGE_TO"));
        assert!(codes.contains(&"INVALID_EDGE_FROM"));
        assert!(codes.contains(&"INVALID_WHEN_CONDITION"));
        assert!(codes.contains(&"MISSING_EDGE_FIELD"));
    }

    #[test]
    fn test_unknown_guard() {
        let results = lint(
            r#"
version: "2.0"
flows:
  flow_guarded:
    id: flow_guarded
    name: "Guarded"
    guards: [branch_not_main, summon_demons]
    nodes:
      a: { type: command, name: "A", command: "a" }
    edges: []
"#,
        );
        assert_eq!(codes(&results["flow_guarded"]), ["UNKNOWN_GUARD"]);
    }

    #[test]
    fn test_cycle_detection() {
        let results = lint(
            r#"
version: "2.0"
flows:
  flow_cycle:
    id: flow_cycle
    name: "Cycle"
    nodes:
      a: { type: command, name: "A", command: "a" }
      b: { type: command, name: "B", command: "b" }
    edges:
      - { from: a, to: b }
      - { from: b, to: a }
"#,
        );
        let flow = &results["flow_cycle"];
        assert_eq!(codes(flow), ["CYCLIC_DEPENDENCY"]);
        assert!(flow.errors[0].message.contains('a'));
    }

    #[test]
    fn test_config_validation() {
        let results = lint(
            r#"
version: "2.0"
flows:
  flow_cfg:
    id: flow_cfg
    name: "Cfg"
    config: { max_execution_time: -5, max_iterations: zero }
    nodes:
      a: { type: command, name: "A", command: "a" }
    edges: []
"#,
        );
        let codes = codes(&results["flow_cfg"]);
        assert!(codes.contains(&"INVALID_MAX_EXECUTION_TIME"));
        assert!(codes.contains(&"INVALID_MAX_ITERATIONS"));
    }

    #[test]
    fn test_lint_file_missing() {
        let results = Linter::lint_file(Path::new("/nonexistent/registry.yaml"));
        assert_eq!(codes(&results["registry"]), ["REGISTRY_LOAD_FAILED"]);
    }

    #[test]
    fn test_lint_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, VALID).unwrap();

        let results = Linter::lint_file(&path);
        assert!(results["registry"].is_valid());
        assert!(results["flow_ok"].is_valid());
        assert_eq!(results["flow_ok"].errors.len(), 0);
        // Findings carry the path they came from.
        assert!(
            results["registry"].flow_id == "registry"
                && results
                    .values()
                    .flat_map(|r| r.warnings.iter())
                    .all(|f| f.file_path.contains("registry.yaml"))
        );
    }
}
