//! Human-readable dump of the current execution plan.

use std::fmt::Write;

use flowgrid_graph::ExecutionGraph;

use crate::pending::PendingModification;

/// Render vertices, datasets, partitions, and registered attempts.
pub fn describe(graph: &ExecutionGraph, pending: &[PendingModification]) -> String {
    let total = graph.total_number_of_vertices();
    let finished = graph.vertices_finished();
    let state = graph.lock();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Job '{}' ({}) status {}: {} groups, {} tasks, {} finished groups",
        graph.job_name(),
        graph.job_id(),
        graph.status(),
        state.num_vertices(),
        total,
        finished
    );
    if let Some(cause) = graph.failure_cause() {
        let _ = writeln!(out, "  failure at {}: {}", cause.at, cause.message);
    }

    for group in state.tasks_in_order() {
        let _ = writeln!(
            out,
            "Vertex {} ({}) state {} parallelism {}/{}",
            group.name(),
            group.id(),
            group.aggregate_state(),
            group.parallelism(),
            group.max_parallelism()
        );
        let _ = writeln!(out, "  {}", group.debug_string());
        for dataset in group.produced_data_sets() {
            let Some(result) = state.result(*dataset) else {
                let _ = writeln!(out, "  produces {dataset} (unregistered)");
                continue;
            };
            let consumers: Vec<String> = result
                .consumer_vertices()
                .iter()
                .map(|v| state.task(*v).map(|t| t.name().to_string()).unwrap_or_else(|| v.to_string()))
                .collect();
            let _ = writeln!(
                out,
                "  produces {} ({} partitions) -> [{}]",
                dataset,
                result.num_partitions(),
                consumers.join(", ")
            );
            for partition in result.partitions() {
                let readers: Vec<String> = partition
                    .consumers()
                    .iter()
                    .map(|group| group.len().to_string())
                    .collect();
                let _ = writeln!(
                    out,
                    "    {} #{} readers per consumer [{}]",
                    partition.partition_id(),
                    partition.partition_number(),
                    readers.join(", ")
                );
            }
        }
        for dataset in group.inputs() {
            let producer = state
                .result(*dataset)
                .and_then(|r| state.task(r.producer()))
                .map(|t| t.name().to_string())
                .unwrap_or_default();
            let _ = writeln!(out, "  consumes {dataset} from {producer}");
        }
    }

    let _ = writeln!(out, "Attempts:");
    for exec in state.registered_attempts() {
        let location = exec.assigned_location().unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {} {} {} @ {} [{}]",
            exec.attempt_id(),
            exec.vertex_with_attempt(),
            exec.state(),
            location,
            exec.invokable()
        );
    }

    if !pending.is_empty() {
        let _ = writeln!(out, "Pending modifications:");
        for p in pending {
            let _ = writeln!(
                out,
                "  {} {} acknowledged {}/{}",
                p.id,
                p.kind,
                p.acknowledged.len(),
                p.targets.len()
            );
        }
    }
    out
}
