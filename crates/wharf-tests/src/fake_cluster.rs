//! A scripted in-memory cluster.
//!
//! Workloads progress through phases as they are polled, following a
//! per-task [`Behavior`]. Tests inspect submission order, deletions,
//! and live workloads.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use wharf_cluster::manifest::{JobManifest, PodManifest};
use wharf_cluster::{
    ClusterApi, ClusterError, CustomKind, JobState, LogStream, NodeInfo, PodPhase, PodState,
    PodSummary, WorkloadEvent,
};

/// How a workload behaves once submitted.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Run for `after_polls` status checks, then succeed.
    Succeed { after_polls: u32 },
    /// Run for `after_polls` status checks, then fail.
    Fail { after_polls: u32, message: String },
    /// Never admitted: the image pull backs off forever.
    ImagePullBackOff,
    /// Run until deleted.
    RunForever,
    /// Status checks fail with transport errors `errors` times, then
    /// the workload runs for `after_polls` checks and succeeds.
    Flaky { errors: u32, after_polls: u32 },
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior::Succeed { after_polls: 2 }
    }
}

#[derive(Debug)]
struct Workload {
    kind: String,
    behavior: Behavior,
    polls: u32,
    logs: String,
}

#[derive(Default)]
struct Inner {
    workloads: HashMap<String, Workload>,
    /// Behaviors keyed by declared task name (the label suffix).
    behaviors: HashMap<String, Behavior>,
    logs: HashMap<String, String>,
    submissions: Vec<String>,
    deletions: Vec<String>,
    nodes: Vec<NodeInfo>,
}

pub struct FakeCluster {
    inner: Mutex<Inner>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let mut nodes = Vec::new();
        nodes.push(NodeInfo {
            name: "node-0".to_string(),
            allocatable: HashMap::from([
                ("cpu".to_string(), "32".to_string()),
                ("nvidia.com/gpu".to_string(), "8".to_string()),
            ]),
        });
        FakeCluster {
            inner: Mutex::new(Inner {
                nodes,
                ..Inner::default()
            }),
        }
    }

    /// Script the behavior of every workload whose label ends in
    /// `--{task_name}`.
    pub fn behave(&self, task_name: &str, behavior: Behavior) {
        self.inner
            .lock()
            .unwrap()
            .behaviors
            .insert(task_name.to_string(), behavior);
    }

    pub fn set_logs(&self, task_name: &str, logs: &str) {
        self.inner
            .lock()
            .unwrap()
            .logs
            .insert(task_name.to_string(), logs.to_string());
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.inner.lock().unwrap().nodes = nodes;
    }

    /// Place a workload directly, as if a previous process had
    /// submitted it.
    pub fn install(&self, name: &str, kind: &str, behavior: Behavior) {
        let mut inner = self.inner.lock().unwrap();
        inner.workloads.insert(
            name.to_string(),
            Workload {
                kind: kind.to_string(),
                behavior,
                polls: 0,
                logs: String::new(),
            },
        );
    }

    /// Labels in the order their workloads were created.
    pub fn submission_order(&self) -> Vec<String> {
        self.inner.lock().unwrap().submissions.clone()
    }

    pub fn deletions(&self) -> Vec<String> {
        self.inner.lock().unwrap().deletions.clone()
    }

    pub fn has_workload(&self, name: &str) -> bool {
        self.inner.lock().unwrap().workloads.contains_key(name)
    }

    fn task_name(label: &str) -> &str {
        label.rsplit("--").next().unwrap_or(label)
    }

    fn create(&self, name: &str, kind: &str) -> Result<String, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.workloads.contains_key(name) {
            return Err(ClusterError::Api {
                status: 409,
                message: format!("workload {} already exists", name),
            });
        }
        let behavior = inner
            .behaviors
            .get(Self::task_name(name))
            .cloned()
            .unwrap_or_default();
        let logs = inner
            .logs
            .get(Self::task_name(name))
            .cloned()
            .unwrap_or_default();
        inner.workloads.insert(
            name.to_string(),
            Workload {
                kind: kind.to_string(),
                behavior,
                polls: 0,
                logs,
            },
        );
        inner.submissions.push(name.to_string());
        Ok(name.to_string())
    }

    fn state_of(workload: &mut Workload) -> PodState {
        workload.polls += 1;
        match &workload.behavior {
            Behavior::Succeed { after_polls } => {
                if workload.polls > *after_polls {
                    PodState {
                        phase: PodPhase::Succeeded,
                        message: None,
                        waiting_reasons: Vec::new(),
                    }
                } else {
                    PodState {
                        phase: PodPhase::Running,
                        message: None,
                        waiting_reasons: Vec::new(),
                    }
                }
            }
            Behavior::Fail {
                after_polls,
                message,
            } => {
                if workload.polls > *after_polls {
                    PodState {
                        phase: PodPhase::Failed,
                        message: Some(message.clone()),
                        waiting_reasons: Vec::new(),
                    }
                } else {
                    PodState {
                        phase: PodPhase::Running,
                        message: None,
                        waiting_reasons: Vec::new(),
                    }
                }
            }
            Behavior::ImagePullBackOff => PodState {
                phase: PodPhase::Pending,
                message: None,
                waiting_reasons: vec!["ImagePullBackOff".to_string()],
            },
            Behavior::RunForever => PodState {
                phase: PodPhase::Running,
                message: None,
                waiting_reasons: Vec::new(),
            },
            // The error polls were already spent in `pod_state`.
            Behavior::Flaky { errors, after_polls } => {
                if workload.polls > *errors + *after_polls {
                    PodState {
                        phase: PodPhase::Succeeded,
                        message: None,
                        waiting_reasons: Vec::new(),
                    }
                } else {
                    PodState {
                        phase: PodPhase::Running,
                        message: None,
                        waiting_reasons: Vec::new(),
                    }
                }
            }
        }
    }

    fn delete(&self, name: &str) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.workloads.remove(name).is_none() {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        inner.deletions.push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<String, ClusterError> {
        self.create(&manifest.metadata.name, "Pod")
    }

    async fn create_job(&self, manifest: &JobManifest) -> Result<String, ClusterError> {
        self.create(&manifest.metadata.name, "Job")
    }

    async fn create_custom(
        &self,
        kind: &CustomKind,
        manifest: &serde_json::Value,
    ) -> Result<String, ClusterError> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| ClusterError::Decode("manifest has no metadata.name".to_string()))?;
        self.create(name, kind.kind)
    }

    async fn pod_state(&self, name: &str) -> Result<PodState, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let workload = inner
            .workloads
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        if let Behavior::Flaky { errors, .. } = workload.behavior
            && workload.polls < errors
        {
            workload.polls += 1;
            return Err(ClusterError::Transport("connection reset by peer".to_string()));
        }
        Ok(Self::state_of(workload))
    }

    async fn job_state(&self, name: &str) -> Result<JobState, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let workload = inner
            .workloads
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        let state = Self::state_of(workload);
        Ok(match state.phase {
            PodPhase::Succeeded => JobState {
                succeeded: 1,
                ..JobState::default()
            },
            PodPhase::Failed => JobState {
                failed: 1,
                ..JobState::default()
            },
            _ => JobState {
                active: 1,
                ..JobState::default()
            },
        })
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        // Name-carrying selectors embed a workload name in one of
        // their values; group-only selectors match everything and the
        // handler filters by prefix.
        let values: Vec<&str> = label_selector
            .split(',')
            .filter_map(|kv| kv.split_once('=').map(|(_, v)| v))
            .collect();
        let selects_by_name = inner
            .workloads
            .keys()
            .any(|name| values.contains(&name.as_str()));
        let names: Vec<String> = inner
            .workloads
            .keys()
            .filter(|name| !selects_by_name || values.contains(&name.as_str()))
            .cloned()
            .collect();
        let mut summaries = Vec::new();
        for name in names {
            let workload = inner.workloads.get_mut(&name).expect("listed workload");
            summaries.push(PodSummary {
                name: name.clone(),
                state: Self::state_of(workload),
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn events(&self, _kind: &str, name: &str) -> Result<Vec<WorkloadEvent>, ClusterError> {
        let inner = self.inner.lock().unwrap();
        let workload = inner
            .workloads
            .get(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        let events = match workload.behavior {
            Behavior::ImagePullBackOff => vec![
                WorkloadEvent {
                    event_type: "Warning".to_string(),
                    reason: "Failed".to_string(),
                    source: "kubelet,node-0".to_string(),
                    message: format!("Failed to pull image for {}", name),
                    timestamp: Some(Utc::now()),
                },
                WorkloadEvent {
                    event_type: "Warning".to_string(),
                    reason: "BackOff".to_string(),
                    source: "kubelet,node-0".to_string(),
                    message: "Back-off pulling image".to_string(),
                    timestamp: Some(Utc::now()),
                },
            ],
            _ => vec![WorkloadEvent {
                event_type: "Normal".to_string(),
                reason: "Started".to_string(),
                source: "kubelet,node-0".to_string(),
                message: format!("Started container {}", name),
                timestamp: Some(Utc::now()),
            }],
        };
        Ok(events)
    }

    async fn pod_logs(&self, pod: &str, _tail: Option<u32>) -> Result<String, ClusterError> {
        let inner = self.inner.lock().unwrap();
        let workload = inner
            .workloads
            .get(pod)
            .ok_or_else(|| ClusterError::NotFound(pod.to_string()))?;
        Ok(workload.logs.clone())
    }

    async fn follow_pod_logs(&self, pod: &str) -> Result<LogStream, ClusterError> {
        let logs = self.pod_logs(pod, None).await?;
        let lines: Vec<Result<String, ClusterError>> = logs
            .lines()
            .map(|line| Ok(line.to_string()))
            .collect();
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.delete(name)
    }

    async fn delete_job(&self, name: &str, _cascade: bool) -> Result<(), ClusterError> {
        self.delete(name)
    }

    async fn delete_custom(
        &self,
        _kind: &CustomKind,
        name: &str,
        _cascade: bool,
    ) -> Result<(), ClusterError> {
        self.delete(name)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        Ok(self.inner.lock().unwrap().nodes.clone())
    }
}
