//! Typed client for the cluster control plane.
//!
//! This crate is the only place that knows the cluster's REST paths
//! and wire shapes. Handlers consume the [`api::ClusterApi`] trait;
//! production wires in [`http::HttpClusterClient`], tests substitute
//! their own implementation.

pub mod api;
pub mod error;
pub mod http;
pub mod manifest;

pub use api::{
    ClusterApi, CustomKind, JobState, LogStream, NodeInfo, PodPhase, PodState, PodSummary,
    WorkloadEvent,
};
pub use error::ClusterError;
pub use http::{ClusterConfig, HttpClusterClient};
