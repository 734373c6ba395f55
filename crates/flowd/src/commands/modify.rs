use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use flow_core::{BlobSet, FlowConfig};
use flowgrid_graph::{ExecutionGraph, JobGraph, SlotPool};
use flowgrid_modify::{
    ModificationCoordinator, ModificationKind, ModifyOptions, ModifyOutcome,
};
use flowgrid_task::{LocalTaskExecutor, OperatorRegistry};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::OutputFormat;

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub async fn run(
    config_path: &Path,
    command: &str,
    args: Vec<String>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = FlowConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    let rpc_timeout = config.coordinator.rpc_timeout()?;
    let modification_timeout = config.coordinator.modification_timeout()?;

    // ── Job + worker ───────────────────────────────────────────

    let job = JobGraph::from_config(&config.job)?;
    let (responses_tx, responses_rx) = mpsc::unbounded_channel();
    let executor = Arc::new(LocalTaskExecutor::new(
        &config.worker.location,
        OperatorRegistry::with_defaults(),
        responses_tx,
    ));
    let pool = Arc::new(SlotPool::new());
    pool.register_worker(executor.clone(), config.worker.slots);
    info!(location = %config.worker.location, slots = config.worker.slots, "local worker registered");

    let graph = Arc::new(ExecutionGraph::from_job_graph(
        &job,
        pool,
        config.coordinator.max_attempts_history,
    )?);
    graph.schedule_all(&BlobSet::new(), rpc_timeout).await?;
    info!(job = %graph.job_id(), name = graph.job_name(), tasks = graph.total_number_of_vertices(), "job running");

    // ── Coordinator ────────────────────────────────────────────

    let coordinator = Arc::new(ModificationCoordinator::new(
        graph.clone(),
        &config.coordinator,
    )?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let responder = coordinator.clone();
    let coordinator_handle = tokio::spawn(async move {
        responder.run(responses_rx, shutdown_rx).await;
    });

    let result = coordinator
        .execute(&ModifyOptions::new(command, args))
        .await;
    if let Ok(ModifyOutcome::Control(report)) = &result
        && report.kind == ModificationKind::Trigger
        && !wait_for_completion(&coordinator, report.modification_id, modification_timeout).await
    {
        warn!(modification = %report.modification_id, "not every target acknowledged in time");
    }

    let plan = coordinator.describe_current_plan();
    let json_plan = graph.json_plan();

    let _ = shutdown_tx.send(true);
    let _ = coordinator_handle.await;
    executor.shutdown().await;

    let outcome = result?;
    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "outcome": outcome,
                "plan": json_plan,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            if !matches!(outcome, ModifyOutcome::Plan { .. }) {
                println!("{outcome}");
            }
            print!("{plan}");
        }
    }
    Ok(())
}

/// Wait until the coordinator's run loop has collected every
/// acknowledgement for `id`.
async fn wait_for_completion(
    coordinator: &ModificationCoordinator,
    id: flow_core::ModificationId,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while coordinator.pending().contains(id) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
    }
    true
}
