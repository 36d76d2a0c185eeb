//! Test support for the wharf workspace: a scripted fake cluster and
//! environment fixtures. The end-to-end scenarios live in `tests/`.

pub mod fake_cluster;
pub mod helpers;

pub use fake_cluster::{Behavior, FakeCluster};
pub use helpers::{TestEnv, test_env, wait_for_status, write_pipeline};
