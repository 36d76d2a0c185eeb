//! The executor that drives pipeline DAGs to completion, plus run
//! cleanup.

pub mod cleanup;
pub mod executor;

pub use cleanup::{Cleaned, cleanup};
pub use executor::{Executor, ExecutorConfig};
