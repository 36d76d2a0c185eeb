//! Turn a named pipeline on disk into a launchable plan.

use crate::dag::TaskGraph;
use crate::pipeline::PipelineDefinition;
use crate::run::{self, PipelineRun, TaskRun};
use crate::template::ExpansionContext;
use crate::{Error, Result};
use std::path::Path;
use tracing::info;

/// Everything the executor needs to launch one run: the pipeline
/// record, WAITING task stubs in declaration order, and the graph.
#[derive(Debug)]
pub struct PipelinePlan {
    pub run: PipelineRun,
    pub tasks: Vec<TaskRun>,
    pub graph: TaskGraph,
}

impl PipelinePlan {
    /// Read `<root>/<pipeline>/main.yml`, expand variables, create the
    /// run's data directories, and build the DAG. Nothing is
    /// persisted or submitted here; descriptor problems surface
    /// before any record exists.
    pub fn prepare(
        root_path: &Path,
        data_path: &Path,
        pipeline: &str,
        version: Option<String>,
    ) -> Result<Self> {
        let work_path = root_path.join(pipeline);
        let definition = PipelineDefinition::load(&work_path)?;

        let label = run::generate_run_label();
        let context = ExpansionContext::new(root_path, &work_path, data_path, &label);

        // ${RUN_PATH} is per-run; a collision means the label
        // generator failed its uniqueness contract.
        let run_path = Path::new(context.run_path());
        if run_path.exists() {
            return Err(Error::Validation(format!(
                "run path {} already exists",
                run_path.display()
            )));
        }

        let mut tasks = Vec::with_capacity(definition.tasks.len());
        for def in &definition.tasks {
            let task_label = run::task_label(&label, &def.name);
            let task_context = context.for_task(&task_label, &def.name);

            let mut expanded = def.clone();
            task_context.expand_task(&mut expanded);

            let task_path = task_context
                .get(crate::template::TASK_PATH)
                .unwrap_or_default();
            std::fs::create_dir_all(task_path)?;

            tasks.push(TaskRun::from_definition(&label, &expanded));
        }

        let graph = TaskGraph::build(&tasks)?;

        let mut run = PipelineRun::new(label.clone(), definition.name.clone(), version);
        run.jobs = tasks.iter().map(|t| t.label.clone()).collect();
        run.waiting = run.jobs.clone();

        info!(label = %label, pipeline = %definition.name, tasks = tasks.len(), "Prepared pipeline plan");
        Ok(PipelinePlan { run, tasks, graph })
    }
}
