//! Progress events published by the executor.
//!
//! The control surface subscribes to these to stream run progress to
//! a connected client; nothing in the scheduler depends on anyone
//! listening.

use crate::run::{PipelineStatus, TaskStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    TaskSubmitted {
        run: String,
        task: String,
    },
    TaskFinished {
        run: String,
        task: String,
        status: TaskStatus,
    },
    PipelineFinished {
        run: String,
        status: PipelineStatus,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run(&self) -> &str {
        match self {
            RunEvent::TaskSubmitted { run, .. }
            | RunEvent::TaskFinished { run, .. }
            | RunEvent::PipelineFinished { run, .. } => run,
        }
    }

    /// True once the run has reached a terminal state.
    pub fn is_final(&self) -> bool {
        matches!(self, RunEvent::PipelineFinished { .. })
    }

    /// The progress line shown to a streaming client.
    pub fn message(&self) -> String {
        match self {
            RunEvent::TaskSubmitted { task, .. } => format!("Submitting {}", task),
            RunEvent::TaskFinished { task, status, .. } => {
                format!("Done running {} ({})", task, status)
            }
            RunEvent::PipelineFinished { run, status } => {
                format!("Pipeline {} {}", run, status)
            }
        }
    }
}
