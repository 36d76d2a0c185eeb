//! Jobs-store backends.
//!
//! The scheduler talks to [`wharf_core::store::JobsStore`]; this
//! crate provides the Postgres and Mongo implementations plus an
//! in-memory one for tests and local development.

pub mod memory;
pub mod mongo;
pub mod postgres;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use postgres::PostgresStore;

use std::sync::Arc;
use wharf_core::StoreError;
use wharf_core::config::{DbBackend, DbConfig};
use wharf_core::store::JobsStore;

/// Connect to whichever backend the credential file names.
pub async fn connect(config: &DbConfig) -> Result<Arc<dyn JobsStore>, StoreError> {
    match config.backend {
        DbBackend::Postgres => Ok(Arc::new(PostgresStore::connect(config).await?)),
        DbBackend::Mongo => Ok(Arc::new(MongoStore::connect(config).await?)),
    }
}
