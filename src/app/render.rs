use anchorage::engine::{DeploymentReport, DeploymentStatus};
use anchorage::graph::DeploymentGraph;
use anchorage::journal::FutureResult;
use anchorage::planner::ExecutionPlan;
use anchorage::reconciler::FutureStatus;

fn describe_result(result: &FutureResult) -> String {
    result
        .address
        .clone()
        .or_else(|| result.value.as_ref().map(ToString::to_string))
        .or_else(|| result.tx_hash.clone())
        .unwrap_or_else(|| "(no result)".to_string())
}

fn describe_status(status: &FutureStatus) -> String {
    match status {
        FutureStatus::Success(result) => describe_result(result),
        FutureStatus::Pending { resume: Some(in_flight) } => format!(
            "in-progress (nonce {}{})",
            in_flight.nonce,
            in_flight
                .tx_hash
                .as_deref()
                .map(|hash| format!(", tx {hash}"))
                .unwrap_or_default()
        ),
        FutureStatus::Failed(error) => match &error.cascaded_from {
            Some(root) => format!("failed (dependency {root} failed)"),
            None => format!("failed: {} ({})", error.message, error.kind),
        },
        other => other.label().to_string(),
    }
}

pub fn render_plan(plan: &ExecutionPlan) -> String {
    if plan.is_empty() {
        return "Nothing to execute.".to_string();
    }
    let mut lines = Vec::with_capacity(plan.batches.len() + 1);
    lines.push(format!(
        "{} futures in {} batches",
        plan.future_count(),
        plan.batches.len()
    ));
    for (index, batch) in plan.batches.iter().enumerate() {
        let ids: Vec<String> = batch.futures.iter().map(ToString::to_string).collect();
        lines.push(format!("  batch {}: {}", index + 1, ids.join(", ")));
    }
    lines.join("\n")
}

pub fn render_status(status: &DeploymentStatus) -> String {
    let mut lines = vec![format!("◆ {}", status.run_key), String::new()];
    for (name, export) in &status.exports {
        lines.push(format!("  {name:<24} {}", describe_status(export)));
    }
    lines.push(String::new());
    for (id, future) in &status.futures {
        lines.push(format!("  {:<40} {}", id.to_string(), future.label()));
    }
    lines.join("\n")
}

pub fn render_report(graph: &DeploymentGraph, report: &DeploymentReport) -> String {
    let mut lines = vec![format!(
        "◆ {} (attempt {}): {}",
        report.run_key, report.attempt, report.outcome
    )];
    for name in graph.exports().keys() {
        if let Some(result) = report.export(graph, name) {
            lines.push(format!("  {name:<24} {}", describe_result(result)));
        }
    }
    for failed in &report.failed {
        lines.push(format!(
            "  FAILED {}: {} ({})",
            failed.id, failed.error.message, failed.error.kind
        ));
    }
    for id in &report.cascaded {
        lines.push(format!("  FAILED {id}: dependency failed"));
    }
    if !report.not_started.is_empty() {
        lines.push(format!("  {} futures not started", report.not_started.len()));
    }
    lines.join("\n")
}
