//! Plain-text rendering of graphs, plans and run results for the terminal.

use convoy_core::{NodeState, RunStatus};
use convoy_exec::{ChangeKind, ChangePlan, NodeRecord, RunResult};
use convoy_graph::ResourceGraph;
use std::collections::HashMap;

pub fn render_graph(graph: &ResourceGraph) -> String {
    let mut out = String::new();
    out.push_str(&format!("═══ {} ({} nodes) ═══\n", graph.name(), graph.len()));
    for (n, node) in graph.topological().enumerate() {
        let marker = if node.included { "+" } else { "-" };
        out.push_str(&format!("{:>3}. {} {} [{}]", n + 1, marker, node.id, node.kind.tag()));
        if !node.depends_on.is_empty() {
            let deps: Vec<&str> = node.depends_on.iter().map(|d| d.as_str()).collect();
            out.push_str(&format!(" after {}", deps.join(", ")));
        }
        if let Some(parent) = &node.parent {
            out.push_str(&format!(" parent {}", parent));
        }
        if let Some(when) = &node.when {
            out.push_str(&format!(" when {}", when));
        }
        if let Some(reason) = &node.exclusion {
            out.push_str(&format!(" (excluded: {})", reason));
        }
        out.push('\n');
    }
    if !graph.exports().is_empty() {
        out.push_str("\nExports:\n");
        for (name, r) in graph.exports() {
            out.push_str(&format!("  {} = {}\n", name, r));
        }
    }
    out
}

pub fn render_plan(plan: &ChangePlan) -> String {
    let mut out = String::new();
    out.push_str(&format!("═══ {} plan ═══\n", plan.mode));
    for change in &plan.changes {
        let symbol = match change.change {
            ChangeKind::Create => "+",
            ChangeKind::Update => "~",
            ChangeKind::Delete => "-",
            ChangeKind::Unchanged | ChangeKind::Absent => " ",
            ChangeKind::Excluded => "x",
        };
        out.push_str(&format!("  {} {:<10} {}", symbol, change.change, change.node));
        if !change.reasons.is_empty() {
            out.push_str(&format!(" ({})", change.reasons.join("; ")));
        }
        out.push('\n');
    }
    for orphan in &plan.orphans {
        out.push_str(&format!("  - {:<10} {} (no longer in graph)\n", "delete", orphan));
    }
    out.push_str(&format!(
        "\n{} to create, {} to update, {} to delete, {} unchanged\n",
        plan.count(&ChangeKind::Create),
        plan.count(&ChangeKind::Update),
        plan.count(&ChangeKind::Delete) + plan.orphans.len(),
        plan.count(&ChangeKind::Unchanged),
    ));
    out
}

/// Node ids ordered by their first recorded transition.
fn execution_order(result: &RunResult) -> Vec<&str> {
    let mut first: HashMap<&str, u64> = HashMap::new();
    for t in &result.transitions {
        first.entry(t.node.as_str()).or_insert(t.seq);
    }
    let mut ids: Vec<&str> = result.nodes.keys().map(|k| k.as_str()).collect();
    ids.sort_by_key(|id| first.get(id).copied().unwrap_or(u64::MAX));
    ids
}

fn describe(record: &NodeRecord) -> String {
    match record.state {
        NodeState::Succeeded => match (record.action, record.executed) {
            (Some(action), true) => format!("{}d", action),
            _ => "unchanged".to_string(),
        },
        NodeState::Failed => match &record.error {
            Some(e) => format!("FAILED {}", e),
            None => "FAILED".to_string(),
        },
        NodeState::Skipped => match &record.skip {
            Some(reason) => format!("skipped ({})", reason),
            None => "skipped".to_string(),
        },
        other => other.to_string(),
    }
}

pub fn render_result(result: &RunResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("═══ {} {} [{}] ═══\n", result.mode, result.name, result.run_id));
    for id in execution_order(result) {
        if let Some(record) = result.nodes.get(id) {
            let timing = record
                .wall_ms()
                .filter(|_| record.executed)
                .map(|ms| format!(" {}ms", ms))
                .unwrap_or_default();
            out.push_str(&format!("  {:<32} {}{}\n", id, describe(record), timing));
        }
    }
    if !result.pruned.is_empty() {
        out.push_str("\nPruned:\n");
        for (id, record) in &result.pruned {
            out.push_str(&format!("  {:<32} {}\n", id, describe(record)));
        }
    }
    if !result.exports.is_empty() {
        out.push_str("\nExports:\n");
        for (name, value) in &result.exports {
            out.push_str(&format!("  {} = {}\n", name, value));
        }
    }
    let verdict = match result.status {
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Running => "incomplete",
    };
    out.push_str(&format!(
        "\nRun {}: {} operations, {}ms\n",
        verdict,
        result.executed,
        result.wall_ms()
    ));
    out
}
