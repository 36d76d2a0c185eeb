//! The handler capability set and the phase-mapping rules shared by
//! every resource kind.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use wharf_cluster::{ClusterError, LogStream, PodState, PodSummary, PodPhase, WorkloadEvent};
use wharf_core::pipeline::ResourceKind;
use wharf_core::run::{DeleteMode, TaskPhase, TaskRun};
use wharf_core::{Error, ObserveFailure, Result};

/// Operations every resource kind supports. Handlers are stateless;
/// everything they need arrives with the task.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Create the workload on the cluster and return its resource id.
    async fn submit(&self, task: &TaskRun) -> Result<String>;

    /// Map the workload's native state into the uniform vocabulary.
    async fn status(&self, task: &TaskRun) -> Result<TaskPhase>;

    async fn events(&self, task: &TaskRun) -> Result<Vec<WorkloadEvent>>;

    /// A snapshot of the workload's logs; multi-pod kinds pick a pod
    /// and say which.
    async fn logs(&self, task: &TaskRun, tail: Option<u32>) -> Result<String>;

    /// A live log stream, line by line.
    async fn log_stream(&self, task: &TaskRun) -> Result<LogStream>;

    async fn delete(&self, task: &TaskRun, mode: DeleteMode) -> Result<()>;
}

/// Tunables shared by the handlers.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How long an image pull may back off before the task is failed.
    pub image_pull_deadline: Duration,
    /// Rendezvous endpoint handed to elastic jobs.
    pub elastic_rdzv_endpoint: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            image_pull_deadline: Duration::from_secs(300),
            elastic_rdzv_endpoint: "etcd-service:2379".to_string(),
        }
    }
}

const PULL_FAILURE_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull"];

/// Classify a cluster failure seen while observing a task. Deadline
/// expiries are retried up to the executor's ceiling, other
/// transient trouble without bound, and hard answers count straight
/// toward the ceiling.
pub(crate) fn observe_error(task: &TaskRun, err: ClusterError) -> Error {
    let kind = if err.is_deadline() {
        ObserveFailure::Deadline
    } else if err.is_transient() {
        ObserveFailure::Transient
    } else {
        ObserveFailure::Hard
    };
    Error::Observe {
        task: task.label.clone(),
        message: err.to_string(),
        kind,
    }
}

/// True when the pull has been failing longer than the deadline.
fn pull_deadline_exceeded(
    submitted: Option<DateTime<Utc>>,
    deadline: Duration,
) -> bool {
    let Some(submitted) = submitted else {
        return false;
    };
    let deadline = ChronoDuration::from_std(deadline).unwrap_or(ChronoDuration::MAX);
    Utc::now() - submitted > deadline
}

/// The uniform mapping from one pod's state.
///
/// A pod stuck pulling its image counts as EXECUTING until the
/// configured deadline, after which it is a terminal failure rather
/// than a transient condition.
pub(crate) fn phase_from_pod(
    state: &PodState,
    submitted: Option<DateTime<Utc>>,
    config: &HandlerConfig,
) -> TaskPhase {
    let pulling = state
        .waiting_reasons
        .iter()
        .any(|r| PULL_FAILURE_REASONS.contains(&r.as_str()));
    if pulling {
        if pull_deadline_exceeded(submitted, config.image_pull_deadline) {
            return TaskPhase::Failed {
                message: Some(format!(
                    "image pull failing for longer than {:?}",
                    config.image_pull_deadline
                )),
            };
        }
        return TaskPhase::Executing;
    }

    match state.phase {
        PodPhase::Pending | PodPhase::Unknown => TaskPhase::Waiting,
        PodPhase::Running => TaskPhase::Executing,
        PodPhase::Succeeded => TaskPhase::Executed,
        PodPhase::Failed => TaskPhase::Failed {
            message: state.message.clone(),
        },
    }
}

/// Multi-worker kinds are done only when every pod is; until then
/// they are executing. An empty pod list means the operator has not
/// materialized the workers yet.
pub(crate) fn phase_from_pods(
    pods: &[PodSummary],
    submitted: Option<DateTime<Utc>>,
    config: &HandlerConfig,
) -> TaskPhase {
    if pods.is_empty() {
        return TaskPhase::Waiting;
    }
    let phases: Vec<TaskPhase> = pods
        .iter()
        .map(|p| phase_from_pod(&p.state, submitted, config))
        .collect();
    if let Some(failed) = phases
        .iter()
        .find(|p| matches!(p, TaskPhase::Failed { .. }))
    {
        return failed.clone();
    }
    if phases.iter().all(|p| *p == TaskPhase::Executed) {
        return TaskPhase::Executed;
    }
    if phases.iter().all(|p| *p == TaskPhase::Waiting) {
        return TaskPhase::Waiting;
    }
    TaskPhase::Executing
}

/// The cluster identifier for a task: its bound resource id, or the
/// label it will be bound to.
pub(crate) fn resource_id(task: &TaskRun) -> &str {
    task.resource_id.as_deref().unwrap_or(&task.label)
}
