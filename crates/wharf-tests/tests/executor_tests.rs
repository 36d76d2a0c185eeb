//! End-to-end scheduler scenarios against the fake cluster.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wharf_cluster::ClusterApi;
use wharf_core::plan::PipelinePlan;
use wharf_core::run::{JobRecord, PipelineRun, PipelineStatus, TaskRun, TaskStatus};
use wharf_core::store::JobsStore;
use wharf_handlers::{HandlerConfig, HandlerModules, HandlerRegistry};
use wharf_scheduler::{Executor, ExecutorConfig};
use wharf_store::MemoryStore;
use wharf_tests::{Behavior, FakeCluster, test_env, wait_for_status, write_pipeline};

/// Parse one task mapping through the production descriptor parser.
fn task_def(yaml: &str) -> wharf_core::pipeline::TaskDefinition {
    let def = wharf_core::pipeline::PipelineDefinition::parse(&format!(
        "name: probe\ntasks:\n  - {}",
        yaml
    ))
    .unwrap();
    def.tasks[0].clone()
}

#[tokio::test]
async fn single_pod_pipeline_runs_to_done_and_cleans_up() {
    let env = test_env(HandlerConfig::default());
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "sst2",
        r#"
name: sst2
tasks:
  - name: train
    image: wharf/sst2
    command: [run-train]
    args: ["--basedir", "${RUN_PATH}/${TASK_ID}"]
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "sst2", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();
    assert!(label.starts_with("flow-"));
    assert!(label[5..].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

    let run = wait_for_status(&env.store, &label, PipelineStatus::Done).await;
    assert_eq!(run.executed, vec![format!("{}--train", label)]);
    assert!(run.completion_time.is_some());

    let task = env.store.get_task(&format!("{}--train", label)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Executed);
    // The cluster id is the label, by construction.
    assert_eq!(task.resource_id.as_deref(), Some(task.label.as_str()));

    // An empty log stream does not change the outcome.
    let handler = env.registry.resolve(task.resource_type).unwrap();
    assert_eq!(handler.logs(&task, None).await.unwrap(), "");

    let workspace = data.path().join(&label);
    assert!(workspace.is_dir());
    let rows = wharf_scheduler::cleanup(
        env.store.clone(),
        env.registry.clone(),
        &env.executor,
        &label,
        true,
        true,
        data.path(),
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.purged_from_db && r.removed_from_fs));
    assert!(!workspace.exists());
    assert!(!env.store.exists(&label).await.unwrap());
    assert!(
        !env.store
            .exists(&format!("{}--train", label))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn failed_dependency_terminates_the_subtree() {
    let env = test_env(HandlerConfig::default());
    env.cluster.behave(
        "train",
        Behavior::Fail {
            after_polls: 1,
            message: "exit 1".to_string(),
        },
    );
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "two-step",
        r#"
name: two-step
tasks:
  - {name: train, image: img, command: [run-train]}
  - {name: export, image: img, command: [run-export], depends: train}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "two-step", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();

    let run = wait_for_status(&env.store, &label, PipelineStatus::Failed).await;
    assert!(run.error_message.is_some());

    let train = env.store.get_task(&format!("{}--train", label)).await.unwrap();
    let export = env.store.get_task(&format!("{}--export", label)).await.unwrap();
    assert_eq!(train.status, TaskStatus::Failed);
    assert_eq!(export.status, TaskStatus::Terminated);
    // The dependent was never submitted.
    assert!(export.resource_id.is_none());
    assert_eq!(export.attempts, 0);
    assert_eq!(
        env.cluster.submission_order(),
        vec![format!("{}--train", label)]
    );

    // The partition invariant holds on the final record.
    let all: HashSet<_> = run
        .waiting
        .iter()
        .chain(&run.executing)
        .chain(&run.executed)
        .chain(&run.failed)
        .chain(&run.terminated)
        .cloned()
        .collect();
    assert_eq!(all, run.jobs.iter().cloned().collect::<HashSet<_>>());
    let total = run.waiting.len()
        + run.executing.len()
        + run.executed.len()
        + run.failed.len()
        + run.terminated.len();
    assert_eq!(total, run.jobs.len());
}

#[tokio::test]
async fn simultaneously_ready_tasks_submit_in_declaration_order() {
    let env = test_env(HandlerConfig::default());
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "parallel",
        r#"
name: parallel
tasks:
  - {name: a, image: img, command: [run-a]}
  - {name: b, image: img, command: [run-b]}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "parallel", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();
    wait_for_status(&env.store, &label, PipelineStatus::Done).await;

    assert_eq!(
        env.cluster.submission_order(),
        vec![format!("{}--a", label), format!("{}--b", label)]
    );
}

#[tokio::test]
async fn image_pull_backoff_fails_after_the_deadline() {
    let env = test_env(HandlerConfig {
        image_pull_deadline: Duration::ZERO,
        ..HandlerConfig::default()
    });
    env.cluster.behave("train", Behavior::ImagePullBackOff);
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "unpullable",
        r#"
name: unpullable
tasks:
  - {name: train, image: nowhere/missing:latest, command: [run]}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "unpullable", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();

    let run = wait_for_status(&env.store, &label, PipelineStatus::Failed).await;
    assert!(run.error_message.unwrap().contains("image pull"));

    let task_label = format!("{}--train", label);
    let task = env.store.get_task(&task_label).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let handler = env.registry.resolve(task.resource_type).unwrap();
    let events = handler.events(&task).await.unwrap();
    let reasons: Vec<_> = events.iter().map(|e| e.reason.as_str()).collect();
    assert!(reasons.contains(&"BackOff"));
    assert!(reasons.contains(&"Failed"));
}

#[tokio::test]
async fn transient_observation_failures_retry_without_bound() {
    let env = test_env(HandlerConfig::default());
    // More consecutive transport errors than the bounded ceiling
    // (observe_attempts = 3 in the test env) would tolerate.
    env.cluster.behave(
        "train",
        Behavior::Flaky {
            errors: 8,
            after_polls: 1,
        },
    );
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "shaky",
        r#"
name: shaky
tasks:
  - {name: train, image: img, command: [run-train]}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "shaky", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();

    let run = wait_for_status(&env.store, &label, PipelineStatus::Done).await;
    assert!(run.error_message.is_none());
    let task = env.store.get_task(&format!("{}--train", label)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Executed);
}

#[tokio::test]
async fn vanished_workload_fails_after_bounded_retries() {
    let env = test_env(HandlerConfig::default());
    env.cluster.behave("spin", Behavior::RunForever);
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "doomed",
        r#"
name: doomed
tasks:
  - {name: spin, image: img, command: [spin]}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "doomed", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();
    let spin_label = format!("{}--spin", label);

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(task) = env.store.get_task(&spin_label).await
                && task.status == TaskStatus::Executing
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started executing");

    // The workload disappears out from under the scheduler; status
    // checks now answer NotFound, which is not transient.
    env.cluster.delete_pod(&spin_label).await.unwrap();

    let run = wait_for_status(&env.store, &label, PipelineStatus::Failed).await;
    assert!(run.error_message.unwrap().contains("observation failed"));
    let task = env.store.get_task(&spin_label).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn cleanup_of_a_live_run_cancels_before_purging() {
    let env = test_env(HandlerConfig::default());
    env.cluster.behave("spin", Behavior::RunForever);
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "endless",
        r#"
name: endless
tasks:
  - {name: spin, image: img, command: [spin]}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "endless", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();
    let spin_label = format!("{}--spin", label);

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(task) = env.store.get_task(&spin_label).await
                && task.status == TaskStatus::Executing
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started executing");

    let rows = wharf_scheduler::cleanup(
        env.store.clone(),
        env.registry.clone(),
        &env.executor,
        &label,
        true,
        false,
        data.path(),
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(env.cluster.deletions().contains(&spin_label));

    // The worker finalized before the purge; nothing resurrects the
    // records afterwards.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!env.store.exists(&label).await.unwrap());
    assert!(!env.store.exists(&spin_label).await.unwrap());
}

#[tokio::test]
async fn cancellation_deletes_workloads_and_terminates() {
    let env = test_env(HandlerConfig::default());
    env.cluster.behave("spin", Behavior::RunForever);
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "endless",
        r#"
name: endless
tasks:
  - {name: spin, image: img, command: [spin]}
  - {name: after, image: img, command: [run], depends: spin}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "endless", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();
    let spin_label = format!("{}--spin", label);

    // Wait until the first task is live on the cluster.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(task) = env.store.get_task(&spin_label).await
                && task.status == TaskStatus::Executing
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never started executing");

    env.executor.request_cancel(&label).await.unwrap();
    // A second request is a no-op.
    env.executor.request_cancel(&label).await.unwrap();

    let run = wait_for_status(&env.store, &label, PipelineStatus::Terminated).await;
    assert!(run.waiting.is_empty());
    assert!(run.executing.is_empty());

    assert!(env.cluster.deletions().contains(&spin_label));
    assert!(!env.cluster.has_workload(&spin_label));

    let after = env.store.get_task(&format!("{}--after", label)).await.unwrap();
    assert_eq!(after.status, TaskStatus::Terminated);
    assert!(after.resource_id.is_none());
}

#[tokio::test]
async fn resume_rebinds_live_tasks_and_finishes_the_rest() {
    let env = test_env(HandlerConfig::default());
    let label = "flow-resume0000";

    let mut train = TaskRun::from_definition(
        label,
        &task_def("{name: train, image: img, command: [run-train]}"),
    );
    let mut export = TaskRun::from_definition(
        label,
        &task_def("{name: export, image: img, command: [run-export], depends: train}"),
    );
    // train was submitted by the previous process and is still live.
    train.status = TaskStatus::Executing;
    train.resource_id = Some(train.label.clone());
    train.submit_time = Some(chrono::Utc::now());
    export.status = TaskStatus::Waiting;
    env.cluster
        .install(&train.label, "Pod", Behavior::Succeed { after_polls: 1 });

    let mut run = PipelineRun::new(label.to_string(), "resumable".to_string(), None);
    run.status = PipelineStatus::Running;
    run.jobs = vec![train.label.clone(), export.label.clone()];
    run.executing = vec![train.label.clone()];
    run.waiting = vec![export.label.clone()];

    env.store.put(&JobRecord::Pipeline(run)).await.unwrap();
    env.store.put(&JobRecord::Task(train.clone())).await.unwrap();
    env.store.put(&JobRecord::Task(export.clone())).await.unwrap();

    let resumed = env.executor.resume_all().await.unwrap();
    assert_eq!(resumed, vec![label.to_string()]);

    let run = wait_for_status(&env.store, label, PipelineStatus::Done).await;
    assert_eq!(run.executed.len(), 2);

    // The live workload was rebound, not resubmitted; export was
    // submitted once train finished.
    assert_eq!(env.cluster.submission_order(), vec![export.label.clone()]);

    let train = env.store.get_task(&train.label).await.unwrap();
    let export = env.store.get_task(&export.label).await.unwrap();
    assert_eq!(train.status, TaskStatus::Executed);
    assert_eq!(export.status, TaskStatus::Executed);
}

#[tokio::test]
async fn interrupted_submit_without_resource_id_is_retried_on_resume() {
    let env = test_env(HandlerConfig::default());
    let label = "flow-resume1111";

    let mut task = TaskRun::from_definition(
        label,
        &task_def("{name: train, image: img, command: [run-train]}"),
    );
    // Crashed between the BUILDING write and the submit call.
    task.status = TaskStatus::Building;
    task.attempts = 1;

    let mut run = PipelineRun::new(label.to_string(), "halfway".to_string(), None);
    run.status = PipelineStatus::Running;
    run.jobs = vec![task.label.clone()];
    run.executing = vec![task.label.clone()];

    env.store.put(&JobRecord::Pipeline(run)).await.unwrap();
    env.store.put(&JobRecord::Task(task.clone())).await.unwrap();

    env.executor.resume_all().await.unwrap();
    wait_for_status(&env.store, label, PipelineStatus::Done).await;

    assert_eq!(env.cluster.submission_order(), vec![task.label.clone()]);
    let task = env.store.get_task(&task.label).await.unwrap();
    assert_eq!(task.status, TaskStatus::Executed);
    assert!(task.attempts > 1);
}

#[tokio::test]
async fn batch_and_training_kinds_run_to_done() {
    let env = test_env(HandlerConfig::default());
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "mixed",
        r#"
name: mixed
tasks:
  - {name: prep, image: img, command: [prep], resource_type: Job}
  - {name: train, image: img, command: [train], resource_type: TFJob, num_workers: 2, depends: prep}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "mixed", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();
    let run = wait_for_status(&env.store, &label, PipelineStatus::Done).await;
    assert_eq!(run.executed.len(), 2);
    assert_eq!(
        env.cluster.submission_order(),
        vec![format!("{}--prep", label), format!("{}--train", label)]
    );
}

#[tokio::test]
async fn unsupported_kind_fails_the_task_at_submission() {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(FakeCluster::new());
    // Core modules only: no training-job handlers registered.
    let registry = Arc::new(HandlerRegistry::new(
        cluster.clone(),
        HandlerConfig::default(),
        HandlerModules::Core,
    ));
    let executor = Executor::new(
        store.clone(),
        registry,
        cluster.clone(),
        ExecutorConfig {
            poll_interval: Duration::from_millis(20),
            ..ExecutorConfig::default()
        },
    );

    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "needs-kf",
        r#"
name: needs-kf
tasks:
  - {name: train, image: img, command: [train], resource_type: TFJob}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "needs-kf", None).unwrap();
    let label = executor.launch(plan).await.unwrap();

    let run = wait_for_status(&store, &label, PipelineStatus::Failed).await;
    assert!(run.error_message.unwrap().contains("TFJob"));
    assert!(cluster.submission_order().is_empty());
}

#[tokio::test]
async fn infeasible_gpu_request_fails_before_submission() {
    let env = test_env(HandlerConfig::default());
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_pipeline(
        root.path(),
        "greedy",
        r#"
name: greedy
tasks:
  - {name: train, image: img, command: [train], num_gpus: 16}
"#,
    );

    let plan = PipelinePlan::prepare(root.path(), data.path(), "greedy", None).unwrap();
    let label = env.executor.launch(plan).await.unwrap();

    let run = wait_for_status(&env.store, &label, PipelineStatus::Failed).await;
    assert!(run.error_message.unwrap().contains("gpus"));
    assert!(env.cluster.submission_order().is_empty());
}
