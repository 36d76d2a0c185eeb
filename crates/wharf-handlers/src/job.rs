//! Handler for batch jobs: a pod wrapped in a job so the cluster
//! restarts it until completion.

use crate::handler::{HandlerConfig, ResourceHandler, observe_error, phase_from_pod, resource_id};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use wharf_cluster::manifest::job_manifest_for;
use wharf_cluster::{ClusterApi, ClusterError, LogStream, PodSummary, WorkloadEvent};
use wharf_core::pipeline::ResourceKind;
use wharf_core::run::{DeleteMode, TaskPhase, TaskRun};
use wharf_core::{Error, Result};

pub struct BatchJobHandler {
    cluster: Arc<dyn ClusterApi>,
    config: HandlerConfig,
}

impl BatchJobHandler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: HandlerConfig) -> Self {
        BatchJobHandler { cluster, config }
    }

    async fn pods(&self, task: &TaskRun) -> std::result::Result<Vec<PodSummary>, ClusterError> {
        let selector = format!("job-name={}", resource_id(task));
        self.cluster.list_pods(&selector).await
    }
}

#[async_trait]
impl ResourceHandler for BatchJobHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BatchJob
    }

    async fn submit(&self, task: &TaskRun) -> Result<String> {
        let manifest = job_manifest_for(task);
        let name = self
            .cluster
            .create_job(&manifest)
            .await
            .map_err(|e| Error::Submit {
                task: task.label.clone(),
                message: e.to_string(),
            })?;
        info!(task = %task.label, "Submitted batch job");
        Ok(name)
    }

    async fn status(&self, task: &TaskRun) -> Result<TaskPhase> {
        let state = self
            .cluster
            .job_state(resource_id(task))
            .await
            .map_err(|e| observe_error(task, e))?;

        if state.failed > 0 {
            return Ok(TaskPhase::Failed {
                message: Some(format!("{} pod(s) failed", state.failed)),
            });
        }
        if state.succeeded > 0 {
            return Ok(TaskPhase::Executed);
        }
        if state.active > 0 {
            // An "active" pod may still be wedged pulling its image;
            // the deadline check lives on the pod states.
            let pods = self.pods(task).await.map_err(|e| observe_error(task, e))?;
            for pod in pods {
                if let TaskPhase::Failed { message } =
                    phase_from_pod(&pod.state, task.submit_time, &self.config)
                {
                    return Ok(TaskPhase::Failed { message });
                }
            }
            return Ok(TaskPhase::Executing);
        }
        Ok(TaskPhase::Waiting)
    }

    async fn events(&self, task: &TaskRun) -> Result<Vec<WorkloadEvent>> {
        Ok(self.cluster.events("Job", resource_id(task)).await?)
    }

    async fn logs(&self, task: &TaskRun, tail: Option<u32>) -> Result<String> {
        let pods = self.pods(task).await?;
        let Some(first) = pods.first() else {
            return Ok(String::new());
        };
        let logs = self.cluster.pod_logs(&first.name, tail).await?;
        if pods.len() > 1 {
            let mut header: Vec<String> = Vec::with_capacity(pods.len() + 2);
            header.push(format!("Found {} pods,", pods.len()));
            header.extend(pods.iter().map(|p| p.name.clone()));
            header.push(format!("using pod/{}", first.name));
            return Ok(format!("{}\n{}", header.join("\n"), logs));
        }
        Ok(logs)
    }

    async fn log_stream(&self, task: &TaskRun) -> Result<LogStream> {
        let pods = self.pods(task).await?;
        let pod = pods
            .first()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| resource_id(task).to_string());
        Ok(self.cluster.follow_pod_logs(&pod).await?)
    }

    async fn delete(&self, task: &TaskRun, mode: DeleteMode) -> Result<()> {
        let cascade = mode == DeleteMode::Cascade;
        self.cluster.delete_job(resource_id(task), cascade).await?;
        Ok(())
    }
}
