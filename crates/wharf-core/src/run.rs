//! Runtime state for pipelines and their tasks.

use crate::pipeline::{ConfigMapMount, ResourceKind, SecretMount, TaskDefinition, VolumeMount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Separator between a run label and a task name.
pub const LABEL_SEPARATOR: &str = "--";

/// Generate a fresh run label: `flow-` plus 96 bits of the v4 uuid in
/// lower-case hex. Uniform labels keep store searches and the
/// `${RUN_PATH}` layout predictable regardless of the pipeline name.
pub fn generate_run_label() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("flow-{}", &id[..24])
}

/// Child labels are canonical, keyed off the unique run label.
pub fn task_label(run_label: &str, task_name: &str) -> String {
    format!("{}{}{}", run_label, LABEL_SEPARATOR, task_name)
}

/// A task label carries the separator; a run label never does.
pub fn is_task_label(label: &str) -> bool {
    label.contains(LABEL_SEPARATOR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Submitted,
    Running,
    Done,
    Terminated,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Done | PipelineStatus::Terminated | PipelineStatus::Failed
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Submitted => "SUBMITTED",
            PipelineStatus::Running => "RUNNING",
            PipelineStatus::Done => "DONE",
            PipelineStatus::Terminated => "TERMINATED",
            PipelineStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Building,
    Executing,
    Executed,
    Failed,
    Terminated,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Executed | TaskStatus::Failed | TaskStatus::Terminated
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Building => "BUILDING",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Executed => "EXECUTED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

/// Uniform vocabulary a handler reports for a workload, independent
/// of the resource kind's native phase names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Waiting,
    Executing,
    Executed,
    Failed { message: Option<String> },
}

/// Whether a delete should also take down the workload's backing pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Cascade to backing pods.
    Cascade,
    /// Leave backing pods behind (debugging a failed run).
    OrphanPods,
}

/// One running instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub label: String,
    /// The declared pipeline name.
    pub job: String,
    /// Source-control revision of the pipelines root, when resolvable.
    pub version: Option<String>,
    pub parent: Option<String>,
    pub status: PipelineStatus,
    /// Every child task label, in declaration order.
    pub jobs: Vec<String>,
    pub waiting: Vec<String>,
    pub executing: Vec<String>,
    pub executed: Vec<String>,
    pub failed: Vec<String>,
    pub terminated: Vec<String>,
    pub submit_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl PipelineRun {
    pub fn new(label: String, job: String, version: Option<String>) -> Self {
        PipelineRun {
            label,
            job,
            version,
            parent: None,
            status: PipelineStatus::Submitted,
            jobs: Vec::new(),
            waiting: Vec::new(),
            executing: Vec::new(),
            executed: Vec::new(),
            failed: Vec::new(),
            terminated: Vec::new(),
            submit_time: Utc::now(),
            completion_time: None,
            error_message: None,
            cancel_requested: false,
        }
    }
}

/// One step within a pipeline run, backed by a cluster workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub label: String,
    pub parent: String,
    /// The task name as declared in the descriptor.
    pub name: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub image: String,
    pub resource_type: ResourceKind,
    /// The identifier the cluster knows the workload by; bound on submit.
    pub resource_id: Option<String>,
    pub status: TaskStatus,
    /// Submit attempts so far, across restarts.
    #[serde(default)]
    pub attempts: u32,
    pub submit_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub mounts: Vec<VolumeMount>,
    pub secrets: Vec<SecretMount>,
    pub config_maps: Vec<ConfigMapMount>,
    pub node_selector: Option<HashMap<String, String>>,
    pub pull_policy: String,
    pub num_gpus: Option<u32>,
    pub num_workers: u32,
    pub inputs: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
    /// Dependency task names, persisted so the graph can be rebuilt
    /// from the store after a restart.
    pub depends: Vec<String>,
}

impl TaskRun {
    /// Create a WAITING stub from an expanded definition.
    pub fn from_definition(run_label: &str, def: &TaskDefinition) -> Self {
        TaskRun {
            label: task_label(run_label, &def.name),
            parent: run_label.to_string(),
            name: def.name.clone(),
            command: def.command.clone(),
            args: def.args.clone(),
            image: def.image.clone(),
            resource_type: def.resource_type,
            resource_id: None,
            status: TaskStatus::Waiting,
            attempts: 0,
            submit_time: None,
            completion_time: None,
            mounts: def.mounts.clone(),
            secrets: def.secrets.clone(),
            config_maps: def.config_maps.clone(),
            node_selector: def.node_selector.clone(),
            pull_policy: def.pull_policy.clone(),
            num_gpus: def.num_gpus,
            num_workers: def.num_workers,
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
            depends: def.depends.clone(),
        }
    }
}

/// What the jobs store holds under one label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JobRecord {
    Pipeline(PipelineRun),
    Task(TaskRun),
}

impl JobRecord {
    pub fn label(&self) -> &str {
        match self {
            JobRecord::Pipeline(run) => &run.label,
            JobRecord::Task(task) => &task.label,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            JobRecord::Pipeline(run) => run.parent.as_deref(),
            JobRecord::Task(task) => Some(&task.parent),
        }
    }

    pub fn status_str(&self) -> String {
        match self {
            JobRecord::Pipeline(run) => run.status.to_string(),
            JobRecord::Task(task) => task.status.to_string(),
        }
    }

    pub fn as_pipeline(&self) -> Option<&PipelineRun> {
        match self {
            JobRecord::Pipeline(run) => Some(run),
            JobRecord::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskRun> {
        match self {
            JobRecord::Task(task) => Some(task),
            JobRecord::Pipeline(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_labels_are_uniform_and_unique() {
        let a = generate_run_label();
        let b = generate_run_label();
        assert_ne!(a, b);
        for label in [&a, &b] {
            assert!(label.starts_with("flow-"));
            assert!(
                label[5..].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()),
                "label {} not lower-case alphanumeric",
                label
            );
            assert!(!is_task_label(label));
        }
    }

    #[test]
    fn task_labels_embed_the_parent() {
        let label = task_label("flow-abc123", "train");
        assert_eq!(label, "flow-abc123--train");
        assert!(is_task_label(&label));
    }

    #[test]
    fn record_roundtrips_through_json() {
        let run = PipelineRun::new("flow-x".into(), "sst2".into(), None);
        let record = JobRecord::Pipeline(run);
        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label(), "flow-x");
        assert_eq!(back.status_str(), "SUBMITTED");
    }

    #[test]
    fn terminal_states_are_closed() {
        assert!(TaskStatus::Executed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Terminated.is_terminal());
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Building.is_terminal());
        assert!(!TaskStatus::Executing.is_terminal());
    }
}
