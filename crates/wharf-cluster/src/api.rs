//! The narrow, typed surface the handlers are allowed to use.
//!
//! Nothing outside this crate speaks the cluster's wire protocol;
//! handlers compose these operations and never reach around them.

use crate::error::ClusterError;
use crate::manifest::{JobManifest, PodManifest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// A stream of log lines from one pod.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, ClusterError>> + Send>>;

/// Identifies a custom-resource kind on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomKind {
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
    pub kind: &'static str,
}

impl CustomKind {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Observed pod state, flattened to what the handlers consume.
#[derive(Debug, Clone)]
pub struct PodState {
    pub phase: PodPhase,
    pub message: Option<String>,
    /// Waiting reasons of containers that have not started
    /// (`ImagePullBackOff`, `ErrImagePull`, ...).
    pub waiting_reasons: Vec<String>,
}

/// Batch job counters as reported by the cluster.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone)]
pub struct PodSummary {
    pub name: String,
    pub state: PodState,
}

/// An event recorded against a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub source: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A schedulable node and its allocatable resources.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub allocatable: HashMap<String, String>,
}

impl NodeInfo {
    /// Allocatable GPUs, when the node advertises any.
    pub fn allocatable_gpus(&self) -> u32 {
        self.allocatable
            .get("nvidia.com/gpu")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<String, ClusterError>;

    async fn create_job(&self, manifest: &JobManifest) -> Result<String, ClusterError>;

    async fn create_custom(
        &self,
        kind: &CustomKind,
        manifest: &serde_json::Value,
    ) -> Result<String, ClusterError>;

    async fn pod_state(&self, name: &str) -> Result<PodState, ClusterError>;

    async fn job_state(&self, name: &str) -> Result<JobState, ClusterError>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, ClusterError>;

    async fn events(&self, kind: &str, name: &str) -> Result<Vec<WorkloadEvent>, ClusterError>;

    async fn pod_logs(&self, pod: &str, tail: Option<u32>) -> Result<String, ClusterError>;

    async fn follow_pod_logs(&self, pod: &str) -> Result<LogStream, ClusterError>;

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    /// `cascade` removes the job's backing pods as well.
    async fn delete_job(&self, name: &str, cascade: bool) -> Result<(), ClusterError>;

    async fn delete_custom(
        &self,
        kind: &CustomKind,
        name: &str,
        cascade: bool,
    ) -> Result<(), ClusterError>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;
}
