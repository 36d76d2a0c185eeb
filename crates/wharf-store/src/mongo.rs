//! MongoDB-backed jobs store.
//!
//! Documents are `{label, parent, status, record}`; `record` holds
//! the full serialized record, the rest exist for the queries.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use tracing::info;
use wharf_core::StoreError;
use wharf_core::config::DbConfig;
use wharf_core::run::JobRecord;
use wharf_core::store::JobsStore;

const COLLECTION: &str = "jobs";

pub struct MongoStore {
    jobs: Collection<Document>,
}

fn backend_err(err: mongodb::error::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl MongoStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(config.mongo_uri())
            .await
            .map_err(backend_err)?;
        let jobs = client.database(&config.db).collection::<Document>(COLLECTION);

        // Index creation is idempotent.
        let index = IndexModel::builder()
            .keys(doc! { "label": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        jobs.create_index(index).await.map_err(backend_err)?;

        info!(host = %config.host, db = %config.db, "Connected to mongo jobs store");
        Ok(MongoStore { jobs })
    }

    fn encode(record: &JobRecord) -> Result<Document, StoreError> {
        let body = mongodb::bson::to_document(record)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let parent = match record.parent() {
            Some(parent) => Bson::String(parent.to_string()),
            None => Bson::Null,
        };
        Ok(doc! {
            "label": record.label(),
            "parent": parent,
            "status": record.status_str(),
            "record": body,
        })
    }

    fn decode(document: Document) -> Result<JobRecord, StoreError> {
        let body = document
            .get_document("record")
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        mongodb::bson::from_document(body.clone()).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn labels_matching(&self, filter: Document) -> Result<Vec<String>, StoreError> {
        let mut cursor = self.jobs.find(filter).await.map_err(backend_err)?;
        let mut labels = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(backend_err)? {
            if let Ok(label) = document.get_str("label") {
                labels.push(label.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }
}

#[async_trait]
impl JobsStore for MongoStore {
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let document = Self::encode(record)?;
        self.jobs
            .replace_one(doc! { "label": record.label() }, document)
            .upsert(true)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, label: &str) -> Result<JobRecord, StoreError> {
        let document = self
            .jobs
            .find_one(doc! { "label": label })
            .await
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound(label.to_string()))?;
        Self::decode(document)
    }

    async fn exists(&self, label: &str) -> Result<bool, StoreError> {
        let found = self
            .jobs
            .find_one(doc! { "label": label })
            .await
            .map_err(backend_err)?;
        Ok(found.is_some())
    }

    async fn remove(&self, label: &str) -> Result<bool, StoreError> {
        let result = self
            .jobs
            .delete_one(doc! { "label": label })
            .await
            .map_err(backend_err)?;
        Ok(result.deleted_count > 0)
    }

    async fn parents_like(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.labels_matching(doc! {
            "label": { "$regex": regex_escape(pattern) },
            "parent": Bson::Null,
        })
        .await
    }

    async fn children_like(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.labels_matching(doc! {
            "label": { "$regex": regex_escape(pattern) },
            "parent": { "$ne": Bson::Null },
        })
        .await
    }

    async fn active_pipelines(&self) -> Result<Vec<String>, StoreError> {
        self.labels_matching(doc! {
            "parent": Bson::Null,
            "status": { "$in": ["SUBMITTED", "RUNNING"] },
        })
        .await
    }
}

/// The search contract is substring match; escape anything the
/// pattern language would interpret.
fn regex_escape(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
