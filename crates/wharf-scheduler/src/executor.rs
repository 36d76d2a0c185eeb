//! The reconciliation executor.
//!
//! One worker task per pipeline run. Within a run every store and
//! cluster interaction is serialized; the worker holds no lock across
//! I/O and re-reads the store at the top of every tick, so state
//! observed after an await is always current.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use wharf_core::dag::TaskGraph;
use wharf_core::events::RunEvent;
use wharf_core::plan::PipelinePlan;
use wharf_core::run::{DeleteMode, JobRecord, PipelineRun, PipelineStatus, TaskPhase, TaskRun, TaskStatus};
use wharf_core::store::JobsStore;
use wharf_core::{Error, ObserveFailure, Result};
use wharf_cluster::ClusterApi;
use wharf_handlers::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause between reconciliation ticks.
    pub poll_interval: Duration,
    /// Submit attempts per task before it is failed.
    pub submit_attempts: u32,
    /// Consecutive observation failures tolerated before a task is
    /// failed.
    pub observe_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            poll_interval: Duration::from_secs(1),
            submit_attempts: 3,
            observe_attempts: 10,
            backoff_base: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(30),
        }
    }
}

fn backoff_delay(attempt: u32, config: &ExecutorConfig) -> Duration {
    let exp = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(attempt));
    exp.min(config.backoff_ceiling)
}

#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobsStore>,
    registry: Arc<HandlerRegistry>,
    cluster: Arc<dyn ClusterApi>,
    config: ExecutorConfig,
    events: broadcast::Sender<RunEvent>,
}

enum Tick {
    Continue,
    Finished(PipelineStatus),
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobsStore>,
        registry: Arc<HandlerRegistry>,
        cluster: Arc<dyn ClusterApi>,
        config: ExecutorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Executor {
            store,
            registry,
            cluster,
            config,
            events,
        }
    }

    /// Progress events for all runs; filter by label on the consumer
    /// side.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Persist a prepared plan and start its reconciliation worker.
    /// The run record is durable before the label is returned.
    pub async fn launch(&self, plan: PipelinePlan) -> Result<String> {
        let PipelinePlan { run, tasks, graph } = plan;
        let label = run.label.clone();

        self.store.put(&JobRecord::Pipeline(run)).await?;
        for task in &tasks {
            self.store.put(&JobRecord::Task(task.clone())).await?;
        }

        info!(label = %label, "Launched pipeline run");
        self.spawn_worker(label.clone(), graph);
        Ok(label)
    }

    /// Enumerate non-terminal runs and resume their reconciliation.
    /// Safe to call on every startup; terminal runs are untouched.
    pub async fn resume_all(&self) -> Result<Vec<String>> {
        let labels = self.store.active_pipelines().await?;
        let mut resumed = Vec::new();
        for label in labels {
            match self.rebuild_graph(&label).await {
                Ok(graph) => {
                    info!(label = %label, "Resuming pipeline run");
                    self.spawn_worker(label.clone(), graph);
                    resumed.push(label);
                }
                Err(err) => {
                    error!(label = %label, error = %err, "Cannot rebuild run; marking failed");
                    if let Ok(mut run) = self.store.get_pipeline(&label).await {
                        run.status = PipelineStatus::Failed;
                        run.error_message = Some(err.to_string());
                        run.completion_time = Some(Utc::now());
                        let _ = self.store.put(&JobRecord::Pipeline(run)).await;
                    }
                }
            }
        }
        Ok(resumed)
    }

    /// Ask a run to stop. Cooperative and idempotent: the flag is
    /// durable and the worker acts on it at its next tick.
    pub async fn request_cancel(&self, label: &str) -> Result<()> {
        let mut run = self.store.get_pipeline(label).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if !run.cancel_requested {
            run.cancel_requested = true;
            self.store.put(&JobRecord::Pipeline(run)).await?;
            info!(label = %label, "Cancellation requested");
        }
        Ok(())
    }

    async fn rebuild_graph(&self, label: &str) -> Result<TaskGraph> {
        let run = self.store.get_pipeline(label).await?;
        let mut tasks = Vec::with_capacity(run.jobs.len());
        for task_label in &run.jobs {
            tasks.push(self.store.get_task(task_label).await?);
        }
        TaskGraph::build(&tasks)
    }

    fn spawn_worker(&self, label: String, graph: TaskGraph) {
        let executor = self.clone();
        tokio::spawn(async move {
            executor.reconcile(label, graph).await;
        });
    }

    async fn reconcile(&self, label: String, graph: TaskGraph) {
        // Consecutive observation failures, per task.
        let mut observe_failures: HashMap<String, u32> = HashMap::new();
        loop {
            match self.tick(&label, &graph, &mut observe_failures).await {
                Ok(Tick::Finished(status)) => {
                    info!(label = %label, status = %status, "Pipeline finished");
                    let _ = self.events.send(RunEvent::PipelineFinished {
                        run: label.clone(),
                        status,
                    });
                    return;
                }
                Ok(Tick::Continue) => {}
                // The record is gone: a cleanup purged the run out
                // from under us.
                Err(Error::Store(wharf_core::StoreError::NotFound(_))) => {
                    info!(label = %label, "Run record purged; stopping worker");
                    return;
                }
                // A dead store fails the step, not the run; retry on
                // the next tick.
                Err(Error::Store(err)) => {
                    warn!(label = %label, error = %err, "Store error during reconciliation");
                }
                Err(err) => {
                    error!(label = %label, error = %err, "Reconciliation error");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn tick(
        &self,
        label: &str,
        graph: &TaskGraph,
        observe_failures: &mut HashMap<String, u32>,
    ) -> Result<Tick> {
        let mut run = self.store.get_pipeline(label).await?;
        if run.status.is_terminal() {
            return Ok(Tick::Finished(run.status));
        }

        let mut tasks = HashMap::with_capacity(run.jobs.len());
        for task_label in &run.jobs {
            let task = self.store.get_task(task_label).await?;
            tasks.insert(task.name.clone(), task);
        }

        if run.cancel_requested {
            let status = self.cancel(&mut run, graph, &mut tasks).await?;
            return Ok(Tick::Finished(status));
        }

        self.submit_ready(&mut run, graph, &mut tasks).await?;
        self.observe_executing(&mut run, graph, &mut tasks, observe_failures)
            .await?;

        self.refresh_lists(&mut run, graph, &tasks);
        let all_terminal = tasks.values().all(|t| t.status.is_terminal());
        if all_terminal {
            run.status = if tasks.values().all(|t| t.status == TaskStatus::Executed) {
                PipelineStatus::Done
            } else if tasks.values().any(|t| t.status == TaskStatus::Failed) {
                PipelineStatus::Failed
            } else {
                PipelineStatus::Terminated
            };
            run.completion_time = Some(Utc::now());
            // Do not resurrect a record a cleanup purged mid-tick; a
            // missing record aborts the tick instead.
            self.store.get_pipeline(label).await?;
            self.store.put(&JobRecord::Pipeline(run.clone())).await?;
            return Ok(Tick::Finished(run.status));
        }

        if run.status == PipelineStatus::Submitted
            && tasks.values().any(|t| t.status != TaskStatus::Waiting)
        {
            run.status = PipelineStatus::Running;
        }
        // Re-validate before writing back: a cancellation may have
        // landed while this tick was blocked on the cluster, and a
        // cleanup may have purged the record outright. A missing or
        // unreadable record aborts the tick without writing, so a
        // purged run is never resurrected by a stale upsert.
        let current = self.store.get_pipeline(label).await?;
        run.cancel_requested |= current.cancel_requested;
        self.store.put(&JobRecord::Pipeline(run)).await?;
        Ok(Tick::Continue)
    }

    /// Submit every ready task, in declaration order. A task found in
    /// BUILDING is a submit interrupted by a restart: with a bound
    /// resource id it rebinds to the live workload, without one the
    /// submit is repeated.
    async fn submit_ready(
        &self,
        run: &mut PipelineRun,
        graph: &TaskGraph,
        tasks: &mut HashMap<String, TaskRun>,
    ) -> Result<()> {
        let executed: HashSet<String> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Executed)
            .map(|t| t.name.clone())
            .collect();

        let ready: Vec<String> = graph
            .names()
            .filter(|name| {
                let task = &tasks[*name];
                match task.status {
                    TaskStatus::Waiting => graph.is_ready(name, &executed),
                    TaskStatus::Building => true,
                    _ => false,
                }
            })
            .map(String::from)
            .collect();

        for name in ready {
            let Some(task) = tasks.get_mut(&name) else {
                continue;
            };

            if task.status == TaskStatus::Building && task.resource_id.is_some() {
                debug!(task = %task.label, "Rebinding to existing workload");
                task.status = TaskStatus::Executing;
                self.store.put(&JobRecord::Task(task.clone())).await?;
                continue;
            }

            task.status = TaskStatus::Building;
            self.store.put(&JobRecord::Task(task.clone())).await?;

            match self.submit_one(task).await {
                Ok(resource_id) => {
                    task.resource_id = Some(resource_id);
                    task.submit_time = Some(Utc::now());
                    task.status = TaskStatus::Executing;
                    self.store.put(&JobRecord::Task(task.clone())).await?;
                    let _ = self.events.send(RunEvent::TaskSubmitted {
                        run: run.label.clone(),
                        task: task.label.clone(),
                    });
                }
                Err(err) => {
                    warn!(task = %task.label, error = %err, "Submit failed");
                    self.fail_task(run, graph, tasks, &name, err.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn submit_one(&self, task: &mut TaskRun) -> Result<String> {
        let handler = self.registry.resolve(task.resource_type)?;
        self.check_gpu_feasibility(task).await?;

        let mut last_err = None;
        for attempt in 0..self.config.submit_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1, &self.config)).await;
            }
            task.attempts += 1;
            match handler.submit(task).await {
                Ok(resource_id) => return Ok(resource_id),
                Err(err) => {
                    warn!(task = %task.label, attempt, error = %err, "Submit attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Submit {
            task: task.label.clone(),
            message: "no submit attempts made".to_string(),
        }))
    }

    /// A task asking for more GPUs than any node can allocate will
    /// never schedule; fail it up front instead of letting it pend
    /// forever. Telemetry failures skip the check.
    async fn check_gpu_feasibility(&self, task: &TaskRun) -> Result<()> {
        let Some(requested) = task.num_gpus.filter(|g| *g > 0) else {
            return Ok(());
        };
        let nodes = match self.cluster.list_nodes().await {
            Ok(nodes) if !nodes.is_empty() => nodes,
            _ => return Ok(()),
        };
        let largest = nodes.iter().map(|n| n.allocatable_gpus()).max().unwrap_or(0);
        if requested > largest {
            return Err(Error::Submit {
                task: task.label.clone(),
                message: format!(
                    "requested {} gpus but the largest node allocates {}",
                    requested, largest
                ),
            });
        }
        Ok(())
    }

    async fn observe_executing(
        &self,
        run: &mut PipelineRun,
        graph: &TaskGraph,
        tasks: &mut HashMap<String, TaskRun>,
        observe_failures: &mut HashMap<String, u32>,
    ) -> Result<()> {
        let executing: Vec<String> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Executing)
            .map(|t| t.name.clone())
            .collect();

        for name in executing {
            let handler = match self.registry.resolve(tasks[&name].resource_type) {
                Ok(handler) => handler,
                Err(err) => {
                    self.fail_task(run, graph, tasks, &name, err.to_string())
                        .await?;
                    continue;
                }
            };

            let phase = match handler.status(&tasks[&name]).await {
                Ok(phase) => {
                    observe_failures.remove(&name);
                    phase
                }
                // Transient infrastructure trouble is retried without
                // bound; only deadline expiries and hard answers count
                // toward the ceiling.
                Err(
                    err @ Error::Observe {
                        kind: ObserveFailure::Transient,
                        ..
                    },
                ) => {
                    debug!(task = %name, error = %err, "Transient observation failure; will retry");
                    continue;
                }
                Err(err) => {
                    let failures = observe_failures.entry(name.clone()).or_insert(0);
                    *failures += 1;
                    if *failures >= self.config.observe_attempts {
                        self.fail_task(
                            run,
                            graph,
                            tasks,
                            &name,
                            format!("observation failed {} times: {}", failures, err),
                        )
                        .await?;
                    } else {
                        debug!(task = %name, failures = *failures, error = %err, "Observation failed; will retry");
                    }
                    continue;
                }
            };

            match phase {
                TaskPhase::Waiting | TaskPhase::Executing => {}
                TaskPhase::Executed => {
                    let Some(task) = tasks.get_mut(&name) else {
                        continue;
                    };
                    task.status = TaskStatus::Executed;
                    task.completion_time = Some(Utc::now());
                    self.store.put(&JobRecord::Task(task.clone())).await?;
                    let _ = self.events.send(RunEvent::TaskFinished {
                        run: run.label.clone(),
                        task: task.label.clone(),
                        status: TaskStatus::Executed,
                    });
                }
                TaskPhase::Failed { message } => {
                    let reason = message
                        .unwrap_or_else(|| format!("Task `{}` failed", tasks[&name].label));
                    self.fail_task(run, graph, tasks, &name, reason).await?;
                }
            }
        }
        Ok(())
    }

    /// Fail a task and retire everything that transitively depends on
    /// it; those tasks can never become ready.
    async fn fail_task(
        &self,
        run: &mut PipelineRun,
        graph: &TaskGraph,
        tasks: &mut HashMap<String, TaskRun>,
        name: &str,
        reason: String,
    ) -> Result<()> {
        if let Some(task) = tasks.get_mut(name) {
            task.status = TaskStatus::Failed;
            task.completion_time = Some(Utc::now());
            self.store.put(&JobRecord::Task(task.clone())).await?;
            let _ = self.events.send(RunEvent::TaskFinished {
                run: run.label.clone(),
                task: task.label.clone(),
                status: TaskStatus::Failed,
            });
        }
        run.error_message = Some(reason);

        for node in graph.descendants(name) {
            let Some(task) = tasks.get_mut(&node.name) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            task.status = TaskStatus::Terminated;
            task.completion_time = Some(Utc::now());
            self.store.put(&JobRecord::Task(task.clone())).await?;
        }
        Ok(())
    }

    /// Delete live workloads and retire every non-terminal task.
    /// Cleanup is best-effort: a failed delete is recorded but does
    /// not block TERMINATED.
    async fn cancel(
        &self,
        run: &mut PipelineRun,
        graph: &TaskGraph,
        tasks: &mut HashMap<String, TaskRun>,
    ) -> Result<PipelineStatus> {
        let mut delete_errors = Vec::new();
        for task in tasks.values_mut() {
            if matches!(task.status, TaskStatus::Executing | TaskStatus::Building)
                && task.resource_id.is_some()
            {
                if let Ok(handler) = self.registry.resolve(task.resource_type)
                    && let Err(err) = handler.delete(task, DeleteMode::Cascade).await
                {
                    warn!(task = %task.label, error = %err, "Cleanup failed");
                    delete_errors.push(format!("{}: {}", task.label, err));
                }
            }
            if !task.status.is_terminal() {
                task.status = TaskStatus::Terminated;
                task.completion_time = Some(Utc::now());
                self.store.put(&JobRecord::Task(task.clone())).await?;
            }
        }

        if !delete_errors.is_empty() {
            run.error_message = Some(format!("cleanup errors: {}", delete_errors.join("; ")));
        }
        run.status = PipelineStatus::Terminated;
        run.completion_time = Some(Utc::now());
        self.refresh_lists(run, graph, tasks);
        self.store.put(&JobRecord::Pipeline(run.clone())).await?;
        Ok(PipelineStatus::Terminated)
    }

    /// Project task statuses back onto the run's partition lists, in
    /// declaration order.
    fn refresh_lists(
        &self,
        run: &mut PipelineRun,
        graph: &TaskGraph,
        tasks: &HashMap<String, TaskRun>,
    ) {
        run.waiting.clear();
        run.executing.clear();
        run.executed.clear();
        run.failed.clear();
        run.terminated.clear();
        for name in graph.names() {
            let task = &tasks[name];
            let bucket = match task.status {
                TaskStatus::Waiting => &mut run.waiting,
                TaskStatus::Building | TaskStatus::Executing => &mut run.executing,
                TaskStatus::Executed => &mut run.executed,
                TaskStatus::Failed => &mut run.failed,
                TaskStatus::Terminated => &mut run.terminated,
            };
            bucket.push(task.label.clone());
        }
    }

}
