//! Handler for single-container pods, the default resource kind.

use crate::handler::{HandlerConfig, ResourceHandler, observe_error, phase_from_pod, resource_id};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use wharf_cluster::manifest::pod_manifest_for;
use wharf_cluster::{ClusterApi, LogStream, WorkloadEvent};
use wharf_core::pipeline::ResourceKind;
use wharf_core::run::{DeleteMode, TaskPhase, TaskRun};
use wharf_core::{Error, Result};

pub struct PodHandler {
    cluster: Arc<dyn ClusterApi>,
    config: HandlerConfig,
}

impl PodHandler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: HandlerConfig) -> Self {
        PodHandler { cluster, config }
    }
}

#[async_trait]
impl ResourceHandler for PodHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pod
    }

    async fn submit(&self, task: &TaskRun) -> Result<String> {
        let manifest = pod_manifest_for(task);
        let name = self
            .cluster
            .create_pod(&manifest)
            .await
            .map_err(|e| Error::Submit {
                task: task.label.clone(),
                message: e.to_string(),
            })?;
        info!(task = %task.label, "Submitted pod");
        Ok(name)
    }

    async fn status(&self, task: &TaskRun) -> Result<TaskPhase> {
        let state = self
            .cluster
            .pod_state(resource_id(task))
            .await
            .map_err(|e| observe_error(task, e))?;
        Ok(phase_from_pod(&state, task.submit_time, &self.config))
    }

    async fn events(&self, task: &TaskRun) -> Result<Vec<WorkloadEvent>> {
        Ok(self.cluster.events("Pod", resource_id(task)).await?)
    }

    async fn logs(&self, task: &TaskRun, tail: Option<u32>) -> Result<String> {
        Ok(self.cluster.pod_logs(resource_id(task), tail).await?)
    }

    async fn log_stream(&self, task: &TaskRun) -> Result<LogStream> {
        Ok(self.cluster.follow_pod_logs(resource_id(task)).await?)
    }

    async fn delete(&self, task: &TaskRun, _mode: DeleteMode) -> Result<()> {
        self.cluster.delete_pod(resource_id(task)).await?;
        Ok(())
    }
}
