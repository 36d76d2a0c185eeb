//! Control-surface operations exercised directly against the op
//! dispatcher, with a real executor underneath.

use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wharf_core::run::PipelineStatus;
use wharf_core::store::JobsStore;
use wharf_handlers::HandlerConfig;
use wharf_serve::AppState;
use wharf_serve::ops::{self, ApiStatus, Reply, Request};
use wharf_tests::{TestEnv, test_env, wait_for_status, write_pipeline};

struct Surface {
    env: TestEnv,
    state: Arc<AppState>,
    _root: TempDir,
    _data: TempDir,
}

fn surface(pipeline: Option<(&str, &str)>) -> Surface {
    let env = test_env(HandlerConfig::default());
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    if let Some((name, yaml)) = pipeline {
        write_pipeline(root.path(), name, yaml);
    }
    let store: Arc<dyn JobsStore> = env.store.clone();
    let state = Arc::new(AppState::new(
        store,
        env.registry.clone(),
        env.executor.clone(),
        root.path().to_path_buf(),
        data.path().to_path_buf(),
    ));
    Surface {
        env,
        state,
        _root: root,
        _data: data,
    }
}

async fn collect(state: Arc<AppState>, request: Request) -> Vec<Reply> {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move {
        ops::handle(state, request, tx).await;
    });
    let mut replies = Vec::new();
    while let Some(reply) = rx.recv().await {
        replies.push(reply);
    }
    replies
}

#[tokio::test]
async fn ping_answers_pong() {
    let surface = surface(None);
    let replies = collect(
        surface.state.clone(),
        Request::Ping {
            request: Some("are-you-there".to_string()),
        },
    )
    .await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, ApiStatus::OK);
    assert_eq!(replies[0].response, "PONG are-you-there");
}

#[tokio::test]
async fn unknown_ops_fail_to_parse() {
    assert!(serde_json::from_str::<Request>(r#"{"op": "PING"}"#).is_ok());
    assert!(serde_json::from_str::<Request>(r#"{"op": "EXPLODE"}"#).is_err());
    assert!(serde_json::from_str::<Request>(r#"{"no_op": true}"#).is_err());
}

#[tokio::test]
async fn run_streams_progress_and_ends_with_the_label() {
    let surface = surface(Some((
        "sst2",
        r#"
name: sst2
tasks:
  - {name: train, image: img, command: [run-train]}
"#,
    )));

    let replies = collect(
        surface.state.clone(),
        Request::Run {
            pipeline: "sst2".to_string(),
        },
    )
    .await;

    assert!(replies.len() >= 3);
    assert_eq!(replies[0].status, ApiStatus::OK);
    let label = replies[0].response.as_str().unwrap().to_string();
    assert!(label.starts_with("flow-"));

    let last = replies.last().unwrap();
    assert_eq!(last.status, ApiStatus::END);
    assert_eq!(last.response.as_str().unwrap(), label);

    // The middle frames narrate submission and completion.
    let middle: Vec<String> = replies[1..replies.len() - 1]
        .iter()
        .map(|r| r.response.as_str().unwrap().to_string())
        .collect();
    assert!(middle.iter().any(|m| m.starts_with("Submitting")));
    assert!(middle.iter().any(|m| m.starts_with("Done running")));

    let run = surface.env.store.get_pipeline(&label).await.unwrap();
    assert_eq!(run.status, PipelineStatus::Done);
}

#[tokio::test]
async fn run_of_a_cyclic_pipeline_creates_no_record() {
    let surface = surface(Some((
        "cyclic",
        r#"
name: cyclic
tasks:
  - {name: a, image: img, command: [c], depends: b}
  - {name: b, image: img, command: [c], depends: a}
"#,
    )));

    let replies = collect(
        surface.state.clone(),
        Request::Run {
            pipeline: "cyclic".to_string(),
        },
    )
    .await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, ApiStatus::ERROR);
    assert!(replies[0].response.as_str().unwrap().contains("Cycle"));

    assert!(surface.env.store.parents_like("flow-").await.unwrap().is_empty());
}

#[tokio::test]
async fn status_data_show_and_cleanup_cover_a_finished_run() {
    let surface = surface(Some((
        "demo",
        r#"
name: demo
tasks:
  - {name: train, image: img, command: [run-train]}
"#,
    )));

    let replies = collect(
        surface.state.clone(),
        Request::Run {
            pipeline: "demo".to_string(),
        },
    )
    .await;
    let label = replies[0].response.as_str().unwrap().to_string();
    wait_for_status(&surface.env.store, &label, PipelineStatus::Done).await;

    // STATUS on the run label aggregates pipeline and task rows.
    let replies = collect(
        surface.state.clone(),
        Request::Status {
            label: label.clone(),
        },
    )
    .await;
    assert_eq!(replies[0].status, ApiStatus::OK);
    let body = &replies[0].response[0];
    assert_eq!(body["pipeline_status"]["status"], "DONE");
    assert_eq!(body["task_statuses"][0]["status"], "EXECUTED");
    assert_eq!(
        body["task_statuses"][0]["resource_id"],
        format!("{}--train", label)
    );

    // STATUS on a task label returns the single row.
    let replies = collect(
        surface.state.clone(),
        Request::Status {
            label: format!("{}--train", label),
        },
    )
    .await;
    assert_eq!(replies[0].response["status"], "EXECUTED");

    // DATA returns the raw stored record.
    let replies = collect(
        surface.state.clone(),
        Request::Data {
            label: label.clone(),
        },
    )
    .await;
    assert_eq!(replies[0].response["success"], true);
    assert_eq!(replies[0].response["jobs"]["label"], label);

    // SHOW lists matching runs.
    let replies = collect(
        surface.state.clone(),
        Request::Show {
            query: "flow-".to_string(),
        },
    )
    .await;
    assert_eq!(replies[0].response[0]["label"], label);

    // CLEANUP with both flags purges the records.
    let replies = collect(
        surface.state.clone(),
        Request::Cleanup {
            label: label.clone(),
            db: true,
            fs: true,
        },
    )
    .await;
    assert_eq!(replies[0].status, ApiStatus::OK);
    let rows = replies[0].response.as_array().unwrap();
    assert_eq!(rows.len(), 2);

    let replies = collect(surface.state.clone(), Request::Data { label }).await;
    assert_eq!(replies[0].status, ApiStatus::ERROR);
}

#[tokio::test]
async fn logs_and_events_flow_through_the_handler() {
    let surface = surface(Some((
        "noisy",
        r#"
name: noisy
tasks:
  - {name: train, image: img, command: [run-train]}
"#,
    )));
    surface.env.cluster.set_logs("train", "epoch 1\nepoch 2");

    let replies = collect(
        surface.state.clone(),
        Request::Run {
            pipeline: "noisy".to_string(),
        },
    )
    .await;
    let label = replies[0].response.as_str().unwrap().to_string();
    let task_label = format!("{}--train", label);
    wait_for_status(&surface.env.store, &label, PipelineStatus::Done).await;

    let replies = collect(
        surface.state.clone(),
        Request::Logs {
            task_label: task_label.clone(),
            follow: false,
            lines: None,
        },
    )
    .await;
    assert_eq!(replies[0].status, ApiStatus::OK);
    assert_eq!(replies[0].response, "epoch 1\nepoch 2");
    assert_eq!(replies[1].status, ApiStatus::END);

    // Following yields one frame per line before END.
    let replies = collect(
        surface.state.clone(),
        Request::Logs {
            task_label: task_label.clone(),
            follow: true,
            lines: None,
        },
    )
    .await;
    let lines: Vec<_> = replies[..replies.len() - 1]
        .iter()
        .map(|r| r.response.as_str().unwrap())
        .collect();
    assert_eq!(lines, vec!["epoch 1", "epoch 2"]);

    let replies = collect(
        surface.state.clone(),
        Request::Events { task_label },
    )
    .await;
    assert_eq!(replies[0].status, ApiStatus::OK);
    assert_eq!(replies[0].response[0]["reason"], "Started");
}
