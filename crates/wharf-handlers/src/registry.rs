//! Resolution from a resource kind to its handler.

use crate::handler::{HandlerConfig, ResourceHandler};
use crate::job::BatchJobHandler;
use crate::pod::PodHandler;
use crate::training::{TrainingJobHandler, TrainingKind};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use wharf_cluster::ClusterApi;
use wharf_core::pipeline::ResourceKind;
use wharf_core::{Error, Result};

/// Which handler groups a deployment enables. Clusters without the
/// kubeflow or elastic operators run a reduced set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerModules {
    #[default]
    All,
    Core,
    Kf,
    Elastic,
}

impl FromStr for HandlerModules {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(HandlerModules::All),
            "core" => Ok(HandlerModules::Core),
            "kf" => Ok(HandlerModules::Kf),
            "elastic" => Ok(HandlerModules::Elastic),
            other => Err(format!("unknown handler module group `{}`", other)),
        }
    }
}

pub struct HandlerRegistry {
    handlers: HashMap<ResourceKind, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: HandlerConfig,
        modules: HandlerModules,
    ) -> Self {
        let mut handlers: HashMap<ResourceKind, Arc<dyn ResourceHandler>> = HashMap::new();

        handlers.insert(
            ResourceKind::Pod,
            Arc::new(PodHandler::new(cluster.clone(), config.clone())),
        );
        handlers.insert(
            ResourceKind::BatchJob,
            Arc::new(BatchJobHandler::new(cluster.clone(), config.clone())),
        );

        if matches!(modules, HandlerModules::All | HandlerModules::Kf) {
            for kind in [
                TrainingKind::tf_job(),
                TrainingKind::pytorch_job(),
                TrainingKind::mpi_job(),
            ] {
                let handler = TrainingJobHandler::new(cluster.clone(), config.clone(), kind);
                handlers.insert(handler.kind(), Arc::new(handler));
            }
        }
        if matches!(modules, HandlerModules::All | HandlerModules::Elastic) {
            let handler =
                TrainingJobHandler::new(cluster.clone(), config.clone(), TrainingKind::elastic_job());
            handlers.insert(handler.kind(), Arc::new(handler));
        }

        HandlerRegistry { handlers }
    }

    /// Exact-match resolution; unknown kinds are rejected at
    /// submission time.
    pub fn resolve(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnsupportedResourceKind(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.handlers.keys().copied().collect()
    }
}
