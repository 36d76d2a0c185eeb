//! Variable expansion for task descriptors.
//!
//! Recognized variables are substituted textually, left to right, in
//! a single pass; the substituted values are never re-scanned.
//! Unknown variables pass through unchanged so container-side
//! `${...}` syntax survives.

use crate::pipeline::TaskDefinition;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

pub const ROOT_PATH: &str = "ROOT_PATH";
pub const WORK_PATH: &str = "WORK_PATH";
pub const DATA_PATH: &str = "DATA_PATH";
pub const RUN_PATH: &str = "RUN_PATH";
pub const TASK_PATH: &str = "TASK_PATH";
pub const TASK_ID: &str = "TASK_ID";
pub const TASK_NAME: &str = "TASK_NAME";
pub const PIPE_ID: &str = "PIPE_ID";

fn variable_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// The pipeline-scope variables for one run, plus the per-task pair
/// filled in by [`ExpansionContext::for_task`].
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    variables: HashMap<String, String>,
}

impl ExpansionContext {
    pub fn new(root_path: &Path, work_path: &Path, data_path: &Path, run_label: &str) -> Self {
        let run_path = data_path.join(run_label);
        let mut variables = HashMap::new();
        variables.insert(ROOT_PATH.to_string(), root_path.display().to_string());
        variables.insert(WORK_PATH.to_string(), work_path.display().to_string());
        variables.insert(DATA_PATH.to_string(), data_path.display().to_string());
        variables.insert(RUN_PATH.to_string(), run_path.display().to_string());
        variables.insert(PIPE_ID.to_string(), run_label.to_string());
        ExpansionContext { variables }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn run_path(&self) -> &str {
        self.get(RUN_PATH).unwrap_or_default()
    }

    /// Derive the per-task context: `${TASK_ID}`, `${TASK_NAME}` and
    /// `${TASK_PATH}` join the pipeline-scope variables.
    pub fn for_task(&self, task_label: &str, task_name: &str) -> ExpansionContext {
        let mut variables = self.variables.clone();
        variables.insert(TASK_ID.to_string(), task_label.to_string());
        variables.insert(TASK_NAME.to_string(), task_name.to_string());
        let task_path = format!("{}/{}", self.run_path(), task_name);
        variables.insert(TASK_PATH.to_string(), task_path);
        ExpansionContext { variables }
    }

    /// Expand variables in one string.
    pub fn expand(&self, input: &str) -> String {
        variable_pattern()
            .replace_all(input, |caps: &Captures| {
                let name = &caps[1];
                match self.variables.get(name) {
                    Some(value) => value.clone(),
                    // Unknown variables are left for the container to see.
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }

    /// Expand the string fields of a task definition in place:
    /// `command`, `args`, `image`, and mount paths.
    pub fn expand_task(&self, task: &mut TaskDefinition) {
        for part in task.command.iter_mut() {
            *part = self.expand(part);
        }
        for arg in task.args.iter_mut() {
            *arg = self.expand(arg);
        }
        task.image = self.expand(&task.image);
        for mount in task.mounts.iter_mut() {
            mount.path = self.expand(&mount.path);
        }
    }
}
