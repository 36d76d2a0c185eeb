//! Port trait for the jobs store.
//!
//! The store is the single durable authority for run state; every
//! backend exposes the same narrow, label-keyed interface. `put` is
//! an atomic upsert-by-label so status transitions do not race.

use crate::error::StoreError;
use crate::run::{JobRecord, PipelineRun, TaskRun};
use async_trait::async_trait;

#[async_trait]
pub trait JobsStore: Send + Sync {
    /// Atomically create or replace the record stored under its label.
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Fetch by label; `StoreError::NotFound` when absent.
    async fn get(&self, label: &str) -> Result<JobRecord, StoreError>;

    async fn exists(&self, label: &str) -> Result<bool, StoreError>;

    /// Delete by label; `Ok(false)` when there was nothing to delete.
    async fn remove(&self, label: &str) -> Result<bool, StoreError>;

    /// Labels of pipeline records matching a substring pattern.
    async fn parents_like(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Labels of task records matching a substring pattern.
    async fn children_like(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Pipeline labels whose status is non-terminal; enumerated on
    /// startup so reconciliation resumes after a restart.
    async fn active_pipelines(&self) -> Result<Vec<String>, StoreError>;

    async fn get_pipeline(&self, label: &str) -> Result<PipelineRun, StoreError> {
        match self.get(label).await? {
            JobRecord::Pipeline(run) => Ok(run),
            JobRecord::Task(_) => Err(StoreError::Corrupt(format!(
                "`{}` is a task record, not a pipeline",
                label
            ))),
        }
    }

    async fn get_task(&self, label: &str) -> Result<TaskRun, StoreError> {
        match self.get(label).await? {
            JobRecord::Task(task) => Ok(task),
            JobRecord::Pipeline(_) => Err(StoreError::Corrupt(format!(
                "`{}` is a pipeline record, not a task",
                label
            ))),
        }
    }
}
