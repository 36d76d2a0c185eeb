//! Handlers for the multi-worker training kinds (TFJob, PyTorchJob,
//! ElasticJob, MPIJob).
//!
//! The kinds differ only in their custom-resource coordinates, the
//! shape of the replica spec, and how their operators label worker
//! pods, so one handler covers all four, parameterized by a
//! [`TrainingKind`]. Their operators expose no usable status field,
//! so status is aggregated from the worker pods.

use crate::handler::{HandlerConfig, ResourceHandler, observe_error, phase_from_pods, resource_id};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use wharf_cluster::manifest::{RESTART_NEVER, pod_spec_for};
use wharf_cluster::{ClusterApi, ClusterError, CustomKind, LogStream, PodSummary, WorkloadEvent};
use wharf_core::pipeline::ResourceKind;
use wharf_core::run::{DeleteMode, TaskPhase, TaskRun};
use wharf_core::{Error, Result};

/// How an operator labels the pods belonging to one of its jobs.
#[derive(Debug, Clone)]
enum PodSelector {
    /// `"{key}={name},{extra}"`
    NameLabel {
        key: &'static str,
        extra: &'static str,
    },
    /// A fixed selector plus a name-prefix filter on the results.
    GroupPrefix { selector: &'static str },
}

#[derive(Debug, Clone)]
enum ReplicaLayout {
    Tf,
    PyTorch,
    Elastic,
    Mpi,
}

#[derive(Debug, Clone)]
pub struct TrainingKind {
    resource: ResourceKind,
    custom: CustomKind,
    container_name: &'static str,
    selector: PodSelector,
    layout: ReplicaLayout,
}

impl TrainingKind {
    pub fn tf_job() -> Self {
        TrainingKind {
            resource: ResourceKind::TfJob,
            custom: CustomKind {
                group: "kubeflow.org",
                version: "v1",
                plural: "tfjobs",
                kind: "TFJob",
            },
            container_name: "tensorflow",
            selector: PodSelector::NameLabel {
                key: "tf-job-name",
                extra: "group-name=kubeflow.org",
            },
            layout: ReplicaLayout::Tf,
        }
    }

    pub fn pytorch_job() -> Self {
        TrainingKind {
            resource: ResourceKind::PyTorchJob,
            custom: CustomKind {
                group: "kubeflow.org",
                version: "v1",
                plural: "pytorchjobs",
                kind: "PyTorchJob",
            },
            container_name: "pytorch",
            selector: PodSelector::NameLabel {
                key: "pytorch-job-name",
                extra: "group-name=kubeflow.org",
            },
            layout: ReplicaLayout::PyTorch,
        }
    }

    pub fn elastic_job() -> Self {
        TrainingKind {
            resource: ResourceKind::ElasticJob,
            custom: CustomKind {
                group: "elastic.pytorch.org",
                version: "v1alpha1",
                plural: "elasticjobs",
                kind: "ElasticJob",
            },
            container_name: "pytorch-elasticjob",
            selector: PodSelector::GroupPrefix {
                selector: "group-name=elastic.pytorch.org",
            },
            layout: ReplicaLayout::Elastic,
        }
    }

    pub fn mpi_job() -> Self {
        TrainingKind {
            resource: ResourceKind::MpiJob,
            custom: CustomKind {
                group: "kubeflow.org",
                version: "v1alpha1",
                plural: "mpijobs",
                kind: "MPIJob",
            },
            container_name: "mpi",
            selector: PodSelector::NameLabel {
                key: "mpi_job_name",
                extra: "mpi_role_type=launcher",
            },
            layout: ReplicaLayout::Mpi,
        }
    }

    /// The full custom-resource manifest for a task. The worker
    /// template embeds the same pod spec every other kind uses; the
    /// wrapping differs per operator.
    fn manifest(&self, task: &TaskRun, config: &HandlerConfig) -> Result<serde_json::Value> {
        let pod_spec = serde_json::to_value(pod_spec_for(
            task,
            Some(self.container_name),
            RESTART_NEVER,
        ))?;
        let template = json!({
            "metadata": {"name": task.label},
            "spec": pod_spec,
        });

        let spec = match self.layout {
            ReplicaLayout::Tf => json!({
                "tfReplicaSpecs": {
                    "Worker": {
                        "replicas": task.num_workers,
                        "restartPolicy": RESTART_NEVER,
                        "template": template,
                    }
                }
            }),
            ReplicaLayout::PyTorch => json!({
                "pytorchReplicaSpecs": {
                    "Worker": {
                        "replicas": task.num_workers,
                        "restartPolicy": RESTART_NEVER,
                        "template": template,
                    }
                }
            }),
            ReplicaLayout::Elastic => json!({
                "replicaSpecs": {
                    "Worker": {
                        "replicas": task.num_workers,
                        "restartPolicy": "ExitCode",
                        "template": template,
                    }
                },
                "minReplicas": task.num_workers,
                "maxReplicas": task.num_workers,
                "rdzvEndpoint": config.elastic_rdzv_endpoint,
            }),
            ReplicaLayout::Mpi => json!({
                "replicas": task.num_workers,
                "restartPolicy": RESTART_NEVER,
                "template": template,
            }),
        };

        Ok(json!({
            "kind": self.custom.kind,
            "apiVersion": self.custom.api_version(),
            "metadata": {"name": task.label},
            "spec": spec,
        }))
    }
}

pub struct TrainingJobHandler {
    cluster: Arc<dyn ClusterApi>,
    config: HandlerConfig,
    kind: TrainingKind,
}

impl TrainingJobHandler {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: HandlerConfig, kind: TrainingKind) -> Self {
        TrainingJobHandler {
            cluster,
            config,
            kind,
        }
    }

    async fn pods(&self, task: &TaskRun) -> std::result::Result<Vec<PodSummary>, ClusterError> {
        let name = resource_id(task);
        match &self.kind.selector {
            PodSelector::NameLabel { key, extra } => {
                let selector = format!("{}={},{}", key, name, extra);
                self.cluster.list_pods(&selector).await
            }
            PodSelector::GroupPrefix { selector } => {
                let pods = self.cluster.list_pods(selector).await?;
                Ok(pods
                    .into_iter()
                    .filter(|p| p.name.starts_with(name))
                    .collect())
            }
        }
    }
}

#[async_trait]
impl ResourceHandler for TrainingJobHandler {
    fn kind(&self) -> ResourceKind {
        self.kind.resource
    }

    async fn submit(&self, task: &TaskRun) -> Result<String> {
        let manifest = self.kind.manifest(task, &self.config)?;
        let name = self
            .cluster
            .create_custom(&self.kind.custom, &manifest)
            .await
            .map_err(|e| Error::Submit {
                task: task.label.clone(),
                message: e.to_string(),
            })?;
        info!(task = %task.label, kind = self.kind.custom.kind, workers = task.num_workers, "Submitted training job");
        Ok(name)
    }

    async fn status(&self, task: &TaskRun) -> Result<TaskPhase> {
        let pods = self.pods(task).await.map_err(|e| observe_error(task, e))?;
        Ok(phase_from_pods(&pods, task.submit_time, &self.config))
    }

    async fn events(&self, task: &TaskRun) -> Result<Vec<WorkloadEvent>> {
        Ok(self
            .cluster
            .events(self.kind.custom.kind, resource_id(task))
            .await?)
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
        self.cluster
            .delete_custom(&self.kind.custom, resource_id(task), cascade)
            .await?;
        Ok(())
    }
}
