//! Shared state behind the control surface.

use std::path::PathBuf;
use std::sync::Arc;
use wharf_core::store::JobsStore;
use wharf_handlers::HandlerRegistry;
use wharf_scheduler::Executor;

pub struct AppState {
    pub store: Arc<dyn JobsStore>,
    pub registry: Arc<HandlerRegistry>,
    pub executor: Executor,
    pub root_path: PathBuf,
    pub data_path: PathBuf,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobsStore>,
        registry: Arc<HandlerRegistry>,
        executor: Executor,
        root_path: PathBuf,
        data_path: PathBuf,
    ) -> Self {
        AppState {
            store,
            registry,
            executor,
            root_path,
            data_path,
        }
    }
}
