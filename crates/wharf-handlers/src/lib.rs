//! Per-resource-kind handlers for cluster workloads.
//!
//! Each handler owns the submitted spec shape for its kind and maps
//! the kind's native status vocabulary into the scheduler's uniform
//! one. Handlers only ever touch the cluster through the
//! [`wharf_cluster::ClusterApi`] port.

pub mod handler;
pub mod job;
pub mod pod;
pub mod registry;
pub mod training;

pub use handler::{HandlerConfig, ResourceHandler};
pub use registry::{HandlerModules, HandlerRegistry};
