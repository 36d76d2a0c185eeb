//! Cleanup of a run: cancel it, delete its workloads, and optionally
//! purge the store records and the on-disk workspace.

use crate::executor::Executor;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use wharf_core::Result;
use wharf_core::run::DeleteMode;
use wharf_core::store::JobsStore;
use wharf_handlers::HandlerRegistry;

/// How long to wait for a live worker to observe the cancellation
/// and finalize its run before records start moving.
const WORKER_SETTLE: Duration = Duration::from_secs(5);
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// What happened to each record during a cleanup request.
#[derive(Debug, Clone, Serialize)]
pub struct Cleaned {
    pub task_id: String,
    pub cleaned_from_cluster: bool,
    pub purged_from_db: bool,
    pub removed_from_fs: bool,
}

/// Tear down a run. Deletes are best-effort; a workload that cannot
/// be deleted is reported but does not stop the rest. The parent
/// record is purged last so a partial failure leaves it queryable.
pub async fn cleanup(
    store: Arc<dyn JobsStore>,
    registry: Arc<HandlerRegistry>,
    executor: &Executor,
    label: &str,
    purge_db: bool,
    purge_fs: bool,
    data_path: &Path,
) -> Result<Vec<Cleaned>> {
    let run = store.get_pipeline(label).await?;
    let children = run.jobs.clone();

    // Cancellation is cooperative: the worker observes the flag at
    // its next tick and finalizes the run. Wait for that before
    // deleting or purging anything, so no in-flight tick writes race
    // the removals below. A run left non-terminal by a dead worker
    // stops the wait at the deadline.
    executor.request_cancel(label).await?;
    let settle_deadline = Instant::now() + WORKER_SETTLE;
    loop {
        match store.get_pipeline(label).await {
            Ok(run) if run.status.is_terminal() => break,
            Ok(_) if Instant::now() < settle_deadline => {
                tokio::time::sleep(SETTLE_POLL).await;
            }
            Ok(_) => {
                warn!(label = %label, "Run did not finalize before cleanup deadline");
                break;
            }
            Err(_) => break,
        }
    }

    let mut cleaned: HashSet<String> = HashSet::new();
    let mut purged: HashSet<String> = HashSet::new();
    let mut removed: HashSet<String> = HashSet::new();

    if purge_fs {
        let workspace = data_path.join(label);
        match tokio::fs::remove_dir_all(&workspace).await {
            Ok(()) => {
                info!(label = %label, path = %workspace.display(), "Removed run workspace");
                removed.insert(label.to_string());
                removed.extend(children.iter().cloned());
            }
            Err(err) => {
                warn!(label = %label, error = %err, "Could not remove run workspace");
            }
        }
    }

    for child in &children {
        match store.get_task(child).await {
            Ok(task) => {
                if task.resource_id.is_some()
                    && let Ok(handler) = registry.resolve(task.resource_type)
                {
                    match handler.delete(&task, DeleteMode::Cascade).await {
                        Ok(()) => {
                            cleaned.insert(child.clone());
                        }
                        Err(err) => {
                            warn!(task = %child, error = %err, "Workload delete failed");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(task = %child, error = %err, "No task record during cleanup");
            }
        }
        if purge_db && store.remove(child).await? {
            purged.insert(child.clone());
        }
    }

    if purge_db && store.remove(label).await? {
        purged.insert(label.to_string());
    }

    let mut rows = Vec::with_capacity(children.len() + 1);
    for id in std::iter::once(&label.to_string()).chain(children.iter()) {
        rows.push(Cleaned {
            task_id: id.clone(),
            cleaned_from_cluster: cleaned.contains(id),
            purged_from_db: purged.contains(id),
            removed_from_fs: removed.contains(id),
        });
    }
    Ok(rows)
}
