//! Shared fixtures for the integration tests.

use crate::fake_cluster::FakeCluster;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wharf_core::run::PipelineStatus;
use wharf_core::store::JobsStore;
use wharf_handlers::{HandlerConfig, HandlerModules, HandlerRegistry};
use wharf_scheduler::{Executor, ExecutorConfig};
use wharf_store::MemoryStore;

pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub cluster: Arc<FakeCluster>,
    pub registry: Arc<HandlerRegistry>,
    pub executor: Executor,
}

/// A fast-ticking executor over a memory store and a fake cluster.
pub fn test_env(handler_config: HandlerConfig) -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(FakeCluster::new());
    let registry = Arc::new(HandlerRegistry::new(
        cluster.clone(),
        handler_config,
        HandlerModules::All,
    ));
    let executor = Executor::new(
        store.clone(),
        registry.clone(),
        cluster.clone(),
        ExecutorConfig {
            poll_interval: Duration::from_millis(20),
            backoff_base: Duration::from_millis(5),
            backoff_ceiling: Duration::from_millis(50),
            observe_attempts: 3,
            ..ExecutorConfig::default()
        },
    );
    TestEnv {
        store,
        cluster,
        registry,
        executor,
    }
}

pub fn write_pipeline(root: &Path, name: &str, yaml: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.yml"), yaml).unwrap();
}

/// Poll the store until the run reaches `expected` or the deadline
/// passes.
pub async fn wait_for_status(
    store: &Arc<MemoryStore>,
    label: &str,
    expected: PipelineStatus,
) -> wharf_core::run::PipelineRun {
    let deadline = Duration::from_secs(10);
    let poll = Duration::from_millis(10);
    let run = tokio::time::timeout(deadline, async {
        loop {
            if let Ok(run) = store.get_pipeline(label).await
                && run.status == expected
            {
                return run;
            }
            tokio::time::sleep(poll).await;
        }
    })
    .await;
    run.unwrap_or_else(|_| panic!("run {} never reached {:?}", label, expected))
}
