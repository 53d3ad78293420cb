//! DAG helpers shared by the linter and the runner.
//!
//! Operates on plain node-id/edge-pair slices so the linter can use it on a
//! raw (possibly malformed) document and the runner on the typed model.

use std::collections::{HashMap, HashSet, VecDeque};

use super::Flow;

/// Extract `(from, to)` pairs from a typed flow.
pub fn edge_pairs(flow: &Flow) -> Vec<(String, String)> {
    flow.edges
        .iter()
        .map(|e| (e.from.clone(), e.to.clone()))
        .collect()
}

/// Node ids with no incoming edges, in input order.
pub fn roots(node_ids: &[String], edges: &[(String, String)]) -> Vec<String> {
    let targets: HashSet<&str> = edges.iter().map(|(_, to)| to.as_str()).collect();
    node_ids
        .iter()
        .filter(|id| !targets.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Kahn's algorithm. Ready nodes are drained in input order, so documents
/// with independent branches execute in the order they were written.
///
/// Returns `Err(cycle)` with one representative cycle when the graph is not
/// acyclic.
pub fn topological_order(
    node_ids: &[String],
    edges: &[(String, String)],
) -> Result<Vec<String>, Vec<String>> {
    let known: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
    let mut in_degree: HashMap<&str, usize> = node_ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();

    for (from, to) in edges {
        if !known.contains(from.as_str()) || !known.contains(to.as_str()) {
            continue;
        }
        adj.entry(from.as_str()).or_default().push(to.as_str());
        *in_degree.entry(to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = node_ids
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted = Vec::with_capacity(node_ids.len());
    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_string());
        if let Some(neighbors) = adj.get(node_id) {
            for &next in neighbors {
                let degree = in_degree.get_mut(next).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if sorted.len() < node_ids.len() {
        // Unprocessed nodes are on or behind a cycle; report one witness.
        return Err(find_cycle(node_ids, edges).unwrap_or_default());
    }
    Ok(sorted)
}

/// DFS with white/gray/black coloring; returns one cycle if any exists.
pub fn find_cycle(node_ids: &[String], edges: &[(String, String)]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let known: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        if known.contains(from.as_str()) && known.contains(to.as_str()) {
            adj.entry(from.as_str()).or_default().push(to.as_str());
        }
    }

    let mut colors: HashMap<&str, Color> =
        node_ids.iter().map(|id| (id.as_str(), Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        adj: &HashMap<&'a str, Vec<&'a str>>,
        colors: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        stack.push(node);
        for &next in adj.get(node).map(Vec::as_slice).unwrap_or_default() {
            match colors[next] {
                Color::Gray => {
                    // Back edge: the cycle is the stack suffix from `next`.
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    return Some(stack[start..].iter().map(|s| s.to_string()).collect());
                }
                Color::White => {
                    if let Some(cycle) = visit(next, adj, colors, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        colors.insert(node, Color::Black);
        None
    }

    let mut stack = Vec::new();
    for id in node_ids {
        if colors[id.as_str()] == Color::White {
            if let Some(cycle) = visit(id.as_str(), &adj, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pairs(edges: &[(&str, &str)]) -> Vec<(String, String)> {
        edges
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_topological_order_linear() {
        let order =
            topological_order(&ids(&["a", "b", "c"]), &pairs(&[("a", "b"), ("b", "c")])).unwrap();
        assert_eq!(order, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let nodes = ids(&["d", "a", "b", "c"]);
        let edges = pairs(&[("a", "c"), ("b", "c"), ("c", "d")]);
        let order = topological_order(&nodes, &edges).unwrap();

        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        for (from, to) in &edges {
            assert!(pos(from) < pos(to), "{from} must precede {to}: {order:?}");
        }
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_topological_order_detects_cycle() {
        let err = topological_order(
            &ids(&["a", "b", "c"]),
            &pairs(&[("a", "b"), ("b", "c"), ("c", "a")]),
        )
        .unwrap_err();
        assert_eq!(err.len(), 3);
        assert!(err.contains(&"a".to_string()));
    }

    #[test]
    fn test_find_cycle_self_loop() {
        let cycle = find_cycle(&ids(&["a"]), &pairs(&[("a", "a")])).unwrap();
        assert_eq!(cycle, ids(&["a"]));
    }

    #[test]
    fn test_find_cycle_none_for_dag() {
        assert!(find_cycle(&ids(&["a", "b"]), &pairs(&[("a", "b")])).is_none());
    }

    #[test]
    fn test_roots() {
        let r = roots(&ids(&["a", "b", "c"]), &pairs(&[("a", "b"), ("a", "c")]));
        assert_eq!(r, ids(&["a"]));

        let none = roots(&ids(&["a", "b"]), &pairs(&[("a", "b"), ("b", "a")]));
        assert!(none.is_empty());
    }

    #[test]
    fn test_unknown_edge_endpoints_ignored() {
        // Edges referencing unknown nodes are a lint error elsewhere; the
        // graph helpers must not panic on them.
        let order = topological_order(&ids(&["a"]), &pairs(&[("a", "ghost")])).unwrap();
        assert_eq!(order, ids(&["a"]));
    }
}
