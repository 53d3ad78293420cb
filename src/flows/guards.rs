//! Built-in safety guards consulted before flow execution.
//!
//! The set is closed: the linter rejects unknown guard names, so a flow can
//! never reach the runner with a guard that is not registered here. Adding a
//! guard means adding its name to [`GUARD_NAMES`] and its arm to
//! [`evaluate`].

use std::path::Path;
use std::process::Command;

/// Every registered guard name, in the order they are documented.
pub const GUARD_NAMES: [&str; 6] = [
    "branch_not_main",
    "dry_run_unless_allowed",
    "artifacts_present",
    "git_clean",
    "ci_environment",
    "test_framework_available",
];

const FORBIDDEN_BRANCHES: [&str; 2] = ["main", "master"];

const CI_VARS: [&str; 3] = ["CI", "GITHUB_ACTIONS", "GITLAB_CI"];

/// Artifacts the planning stages are expected to have produced before a
/// guarded flow may run.
const REQUIRED_ARTIFACTS: [&str; 3] = [
    "memory-bank/business/client_score.json",
    "memory-bank/business/capacity_report.md",
    "memory-bank/plan/proposal.md",
];

pub fn is_known(name: &str) -> bool {
    GUARD_NAMES.contains(&name)
}

/// Inputs a guard may consult. Guards are pure with respect to the run:
/// they read the context, the environment, and the working tree, and never
/// mutate anything.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext {
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub passed: bool,
    pub reason: String,
}

impl GuardOutcome {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// Evaluate a guard by name. Returns `None` for unknown names — callers
/// treat that as a failure, though the linter should have caught it first.
pub fn evaluate(name: &str, ctx: &GuardContext) -> Option<GuardOutcome> {
    let outcome = match name {
        "branch_not_main" => branch_not_main(),
        "dry_run_unless_allowed" => dry_run_unless_allowed(ctx),
        "artifacts_present" => artifacts_present(),
        "git_clean" => git_clean(),
        "ci_environment" => ci_environment(),
        "test_framework_available" => test_framework_available(),
        _ => return None,
    };
    Some(outcome)
}

/// Current VCS branch, best effort. `None` when git is unavailable or the
/// working directory is not a repository.
pub fn current_branch() -> Option<String> {
    let output = Command::new("git")
        .args(["branch", "--show-current"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() { None } else { Some(branch) }
}

fn branch_not_main() -> GuardOutcome {
    match current_branch() {
        Some(branch) if FORBIDDEN_BRANCHES.contains(&branch.as_str()) => {
            GuardOutcome::fail(format!("cannot run on protected branch '{branch}'"))
        }
        Some(branch) => GuardOutcome::pass(format!("branch '{branch}' is not protected")),
        None => GuardOutcome::fail("could not determine current branch"),
    }
}

fn dry_run_unless_allowed(ctx: &GuardContext) -> GuardOutcome {
    let allow_writes = std::env::var("ALLOW_WRITES").as_deref() == Ok("1");
    if !ctx.dry_run && !allow_writes {
        return GuardOutcome::fail("live execution blocked, set ALLOW_WRITES=1 to enable");
    }
    if ctx.dry_run {
        GuardOutcome::pass("dry-run mode enabled")
    } else {
        GuardOutcome::pass("live execution enabled (ALLOW_WRITES=1)")
    }
}

fn artifacts_present() -> GuardOutcome {
    let missing: Vec<&str> = REQUIRED_ARTIFACTS
        .iter()
        .copied()
        .filter(|path| !Path::new(path).exists())
        .collect();
    if missing.is_empty() {
        GuardOutcome::pass("all required artifacts present")
    } else {
        GuardOutcome::fail(format!("missing required artifacts: {missing:?}"))
    }
}

fn git_clean() -> GuardOutcome {
    let output = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => out,
        _ => return GuardOutcome::fail("git status check failed"),
    };
    if output.stdout.iter().any(|b| !b.is_ascii_whitespace()) {
        GuardOutcome::fail("working tree has uncommitted changes")
    } else {
        GuardOutcome::pass("working tree clean")
    }
}

fn ci_environment() -> GuardOutcome {
    let detected = CI_VARS
        .iter()
        .any(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false));
    if detected {
        GuardOutcome::pass("CI environment detected")
    } else {
        GuardOutcome::fail("no CI environment variable set")
    }
}

fn test_framework_available() -> GuardOutcome {
    match Command::new("cargo").arg("--version").output() {
        Ok(out) if out.status.success() => GuardOutcome::pass("test runner available"),
        _ => GuardOutcome::fail("test runner not available"),
    }
}
