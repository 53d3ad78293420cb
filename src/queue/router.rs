//! Persona routing: which queue a step lands on and how fast a persona may
//! consume. Set at startup, never mutated per-task.

pub const DEFAULT_QUEUE: &str = "q.coder";

pub const ALL_QUEUES: [&str; 3] = ["q.coder", "q.auditor", "q.po"];

/// Fallback ceiling for personas without an explicit limit.
pub const DEFAULT_RATE_LIMIT: (u64, u64) = (20, 60);

pub fn queue_for(persona: &str) -> &'static str {
    match persona {
        "CODER_AI" => "q.coder",
        "AUDITOR_AI" => "q.auditor",
        "PO_AI" => "q.po",
        _ => DEFAULT_QUEUE,
    }
}

/// Fixed-window ceiling `(max_tasks, window_seconds)` per persona.
pub fn rate_limit(persona: &str) -> (u64, u64) {
    match persona {
        "CODER_AI" => (30, 60),
        "AUDITOR_AI" => (10, 60),
        "PO_AI" => (6, 60),
        _ => DEFAULT_RATE_LIMIT,
    }
}
