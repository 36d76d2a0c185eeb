//! Control-surface operations.
//!
//! Each request is one JSON object tagged by `op`; replies go out as
//! a sequence of `{status, response}` frames. Streaming operations
//! (RUN, LOGS with follow) emit many OK frames and close with END.

use crate::state::AppState;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use wharf_core::plan::PipelinePlan;
use wharf_core::run::{JobRecord, TaskRun, is_task_label};

#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
pub enum Request {
    #[serde(rename = "PING")]
    Ping {
        #[serde(default)]
        request: Option<String>,
    },
    #[serde(rename = "RUN")]
    Run { pipeline: String },
    #[serde(rename = "STATUS")]
    Status { label: String },
    #[serde(rename = "DATA")]
    Data { label: String },
    #[serde(rename = "LOGS")]
    Logs {
        task_label: String,
        #[serde(default)]
        follow: bool,
        #[serde(default)]
        lines: Option<u32>,
    },
    #[serde(rename = "EVENTS")]
    Events { task_label: String },
    #[serde(rename = "CLEANUP")]
    Cleanup {
        label: String,
        #[serde(default)]
        db: bool,
        #[serde(default)]
        fs: bool,
    },
    #[serde(rename = "SHOW")]
    Show {
        #[serde(default)]
        query: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ApiStatus {
    OK,
    END,
    ERROR,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub status: ApiStatus,
    pub response: Value,
}

impl Reply {
    pub fn ok(response: impl Serialize) -> Self {
        Reply {
            status: ApiStatus::OK,
            response: serde_json::to_value(response).unwrap_or(Value::Null),
        }
    }

    pub fn end(response: impl Serialize) -> Self {
        Reply {
            status: ApiStatus::END,
            response: serde_json::to_value(response).unwrap_or(Value::Null),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Reply {
            status: ApiStatus::ERROR,
            response: Value::String(message.to_string()),
        }
    }
}

async fn send(tx: &mpsc::Sender<Reply>, reply: Reply) -> bool {
    tx.send(reply).await.is_ok()
}

/// Dispatch one request, writing every reply frame to `tx`.
pub async fn handle(state: Arc<AppState>, request: Request, tx: mpsc::Sender<Reply>) {
    let result = match request {
        Request::Ping { request } => ping(&tx, request).await,
        Request::Run { pipeline } => run(&state, &tx, pipeline).await,
        Request::Status { label } => status(&state, &tx, label).await,
        Request::Data { label } => data(&state, &tx, label).await,
        Request::Logs {
            task_label,
            follow,
            lines,
        } => logs(&state, &tx, task_label, follow, lines).await,
        Request::Events { task_label } => events(&state, &tx, task_label).await,
        Request::Cleanup { label, db, fs } => cleanup(&state, &tx, label, db, fs).await,
        Request::Show { query } => show(&state, &tx, query).await,
    };
    if let Err(err) = result {
        error!(error = %err, "Operation failed");
        let _ = send(&tx, Reply::error(err)).await;
    }
}

async fn ping(tx: &mpsc::Sender<Reply>, request: Option<String>) -> wharf_core::Result<()> {
    let body = match request {
        Some(text) => format!("PONG {}", text),
        None => "PONG".to_string(),
    };
    send(tx, Reply::ok(body)).await;
    Ok(())
}

/// Resolve the pipelines root's revision, when it is a git checkout.
async fn git_revision(root: &std::path::Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(root)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!rev.is_empty()).then_some(rev)
}

async fn run(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    pipeline: String,
) -> wharf_core::Result<()> {
    let version = git_revision(&state.root_path).await;
    let plan = PipelinePlan::prepare(&state.root_path, &state.data_path, &pipeline, version)?;

    // Subscribe before launching so no progress event is missed.
    let mut progress = state.executor.subscribe();
    let label = state.executor.launch(plan).await?;
    info!(label = %label, pipeline = %pipeline, "Run started");
    if !send(tx, Reply::ok(&label)).await {
        return Ok(());
    }

    loop {
        match progress.recv().await {
            Ok(event) if event.run() == label => {
                let finished = event.is_final();
                if !send(tx, Reply::ok(event.message())).await {
                    return Ok(());
                }
                if finished {
                    break;
                }
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    send(tx, Reply::end(&label)).await;
    Ok(())
}

fn task_row(task: &TaskRun) -> Value {
    json!({
        "task": task.label,
        "status": task.status,
        "name": task.name,
        "command": task.command,
        "image": task.image,
        "resource_type": task.resource_type,
        "resource_id": task.resource_id,
        "submitted": task.submit_time,
        "completed": task.completion_time,
    })
}

async fn status(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    label: String,
) -> wharf_core::Result<()> {
    if is_task_label(&label) {
        let task = state.store.get_task(&label).await?;
        send(tx, Reply::ok(task_row(&task))).await;
        return Ok(());
    }

    let mut results = Vec::new();
    for parent in state.store.parents_like(&label).await? {
        let run = state.store.get_pipeline(&parent).await?;
        let mut rows = Vec::with_capacity(run.jobs.len());
        for child in &run.jobs {
            let task = state.store.get_task(child).await?;
            rows.push(task_row(&task));
        }
        results.push(json!({
            "pipeline_status": {
                "label": run.label,
                "job": run.job,
                "version": run.version,
                "status": run.status,
                "submitted": run.submit_time,
                "completed": run.completion_time,
                "error_message": run.error_message,
            },
            "task_statuses": rows,
        }));
    }
    send(tx, Reply::ok(results)).await;
    Ok(())
}

async fn data(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    label: String,
) -> wharf_core::Result<()> {
    let record = state.store.get(&label).await?;
    send(tx, Reply::ok(json!({ "success": true, "jobs": record }))).await;
    Ok(())
}

async fn resolve_task(state: &Arc<AppState>, label: &str) -> wharf_core::Result<TaskRun> {
    Ok(state.store.get_task(label).await?)
}

async fn logs(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    task_label: String,
    follow: bool,
    lines: Option<u32>,
) -> wharf_core::Result<()> {
    let task = resolve_task(state, &task_label).await?;
    let handler = state.registry.resolve(task.resource_type)?;

    if follow {
        let mut stream = handler.log_stream(&task).await?;
        while let Some(line) = stream.next().await {
            match line {
                Ok(line) => {
                    if !send(tx, Reply::ok(line)).await {
                        return Ok(());
                    }
                }
                Err(err) => {
                    send(tx, Reply::error(err)).await;
                    break;
                }
            }
        }
    } else {
        let logs = handler.logs(&task, lines).await?;
        if !send(tx, Reply::ok(logs)).await {
            return Ok(());
        }
    }
    send(tx, Reply::end("LOGS")).await;
    Ok(())
}

async fn events(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    task_label: String,
) -> wharf_core::Result<()> {
    let task = resolve_task(state, &task_label).await?;
    let handler = state.registry.resolve(task.resource_type)?;
    let events = handler.events(&task).await?;
    send(tx, Reply::ok(events)).await;
    Ok(())
}

async fn cleanup(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    label: String,
    db: bool,
    fs: bool,
) -> wharf_core::Result<()> {
    let rows = wharf_scheduler::cleanup(
        state.store.clone(),
        state.registry.clone(),
        &state.executor,
        &label,
        db,
        fs,
        &state.data_path,
    )
    .await?;
    send(tx, Reply::ok(rows)).await;
    Ok(())
}

async fn show(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Reply>,
    query: String,
) -> wharf_core::Result<()> {
    let mut runs = Vec::new();
    for label in state.store.parents_like(&query).await? {
        if let JobRecord::Pipeline(run) = state.store.get(&label).await? {
            runs.push(json!({
                "label": run.label,
                "job": run.job,
                "status": run.status,
                "submitted": run.submit_time,
                "completed": run.completion_time,
            }));
        }
    }
    send(tx, Reply::ok(runs)).await;
    Ok(())
}
