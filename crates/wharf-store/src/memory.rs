//! In-memory store, for tests and single-process development runs.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use wharf_core::StoreError;
use wharf_core::run::JobRecord;
use wharf_core::store::JobsStore;

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl JobsStore for MemoryStore {
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.label().to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, label: &str) -> Result<JobRecord, StoreError> {
        self.records
            .read()
            .await
            .get(label)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(label.to_string()))
    }

    async fn exists(&self, label: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(label))
    }

    async fn remove(&self, label: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(label).is_some())
    }

    async fn parents_like(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut labels: Vec<String> = records
            .values()
            .filter(|r| matches!(r, JobRecord::Pipeline(_)))
            .filter(|r| r.label().contains(pattern))
            .map(|r| r.label().to_string())
            .collect();
        labels.sort();
        Ok(labels)
    }

    async fn children_like(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut labels: Vec<String> = records
            .values()
            .filter(|r| matches!(r, JobRecord::Task(_)))
            .filter(|r| r.label().contains(pattern))
            .map(|r| r.label().to_string())
            .collect();
        labels.sort();
        Ok(labels)
    }

    async fn active_pipelines(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut labels: Vec<String> = records
            .values()
            .filter_map(|r| r.as_pipeline())
            .filter(|run| !run.status.is_terminal())
            .map(|run| run.label.clone())
            .collect();
        labels.sort();
        Ok(labels)
    }
}
