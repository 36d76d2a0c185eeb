//! `ClusterApi` over the cluster's REST control plane.

use crate::api::{
    ClusterApi, CustomKind, JobState, LogStream, NodeInfo, PodPhase, PodState, PodSummary,
    WorkloadEvent,
};
use crate::error::ClusterError;
use crate::manifest::{JobManifest, PodManifest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// API-server base, e.g. `https://10.0.0.1:6443` or a local proxy.
    pub base_url: String,
    pub namespace: String,
    /// Bearer token for RBAC clusters.
    pub token: Option<String>,
    /// Deadline applied to every non-streaming call.
    pub request_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            base_url: "http://127.0.0.1:8001".to_string(),
            namespace: "default".to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpClusterClient {
    http: reqwest::Client,
    config: ClusterConfig,
}

impl HttpClusterClient {
    pub fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(HttpClusterClient { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn namespaced(&self, suffix: &str) -> String {
        self.url(&format!(
            "/api/v1/namespaces/{}/{}",
            self.config.namespace, suffix
        ))
    }

    fn custom_path(&self, kind: &CustomKind, name: Option<&str>) -> String {
        let base = format!(
            "/apis/{}/{}/namespaces/{}/{}",
            kind.group, kind.version, self.config.namespace, kind.plural
        );
        match name {
            Some(name) => self.url(&format!("{}/{}", base, name)),
            None => self.url(&base),
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, url)
            .timeout(self.config.request_timeout);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn check(resp: Response) -> Result<Response, ClusterError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        // Error bodies are a Status object carrying a message.
        let message = match resp.json::<StatusWire>().await {
            Ok(body) => body.message.unwrap_or_else(|| status.to_string()),
            Err(_) => status.to_string(),
        };
        if status == StatusCode::NOT_FOUND {
            Err(ClusterError::NotFound(message))
        } else {
            Err(ClusterError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn create_pod(&self, manifest: &PodManifest) -> Result<String, ClusterError> {
        debug!(pod = %manifest.metadata.name, "Creating pod");
        let resp = self
            .request(Method::POST, self.namespaced("pods"))
            .json(manifest)
            .send()
            .await?;
        let created: PodWire = Self::check(resp).await?.json().await?;
        Ok(created.metadata.name)
    }

    async fn create_job(&self, manifest: &JobManifest) -> Result<String, ClusterError> {
        debug!(job = %manifest.metadata.name, "Creating job");
        let url = self.url(&format!(
            "/apis/batch/v1/namespaces/{}/jobs",
            self.config.namespace
        ));
        let resp = self.request(Method::POST, url).json(manifest).send().await?;
        let created: NamedWire = Self::check(resp).await?.json().await?;
        Ok(created.metadata.name)
    }

    async fn create_custom(
        &self,
        kind: &CustomKind,
        manifest: &serde_json::Value,
    ) -> Result<String, ClusterError> {
        debug!(kind = kind.kind, "Creating custom workload");
        let resp = self
            .request(Method::POST, self.custom_path(kind, None))
            .json(manifest)
            .send()
            .await?;
        let created: NamedWire = Self::check(resp).await?.json().await?;
        Ok(created.metadata.name)
    }

    async fn pod_state(&self, name: &str) -> Result<PodState, ClusterError> {
        let resp = self
            .request(Method::GET, self.namespaced(&format!("pods/{}", name)))
            .send()
            .await?;
        let pod: PodWire = Self::check(resp).await?.json().await?;
        Ok(pod.state())
    }

    async fn job_state(&self, name: &str) -> Result<JobState, ClusterError> {
        let resp = self
            .request(
                Method::GET,
                self.url(&format!(
                    "/apis/batch/v1/namespaces/{}/jobs/{}",
                    self.config.namespace, name
                )),
            )
            .send()
            .await?;
        let job: JobWire = Self::check(resp).await?.json().await?;
        let status = job.status.unwrap_or_default();
        Ok(JobState {
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
        })
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, ClusterError> {
        let resp = self
            .request(Method::GET, self.namespaced("pods"))
            .query(&[("labelSelector", label_selector)])
            .send()
            .await?;
        let pods: PodListWire = Self::check(resp).await?.json().await?;
        Ok(pods
            .items
            .into_iter()
            .map(|pod| PodSummary {
                name: pod.metadata.name.clone(),
                state: pod.state(),
            })
            .collect())
    }

    async fn events(&self, kind: &str, name: &str) -> Result<Vec<WorkloadEvent>, ClusterError> {
        let selector = format!(
            "involvedObject.name={},involvedObject.namespace={},involvedObject.kind={}",
            name, self.config.namespace, kind
        );
        let resp = self
            .request(Method::GET, self.namespaced("events"))
            .query(&[("fieldSelector", selector.as_str())])
            .send()
            .await?;
        let events: EventListWire = Self::check(resp).await?.json().await?;
        Ok(events.items.into_iter().map(EventWire::into_event).collect())
    }

    async fn pod_logs(&self, pod: &str, tail: Option<u32>) -> Result<String, ClusterError> {
        let mut req = self.request(Method::GET, self.namespaced(&format!("pods/{}/log", pod)));
        if let Some(lines) = tail {
            req = req.query(&[("tailLines", lines.to_string())]);
        }
        let resp = Self::check(req.send().await?).await?;
        Ok(resp.text().await?)
    }

    async fn follow_pod_logs(&self, pod: &str) -> Result<LogStream, ClusterError> {
        // No deadline here: a follow stays open as long as the pod does.
        let mut req = self
            .http
            .get(self.namespaced(&format!("pods/{}/log", pod)))
            .query(&[("follow", "true")]);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        let resp = Self::check(req.send().await?).await?;
        Ok(line_stream(resp))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let resp = self
            .request(Method::DELETE, self.namespaced(&format!("pods/{}", name)))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str, cascade: bool) -> Result<(), ClusterError> {
        let policy = if cascade { "Background" } else { "Orphan" };
        let resp = self
            .request(
                Method::DELETE,
                self.url(&format!(
                    "/apis/batch/v1/namespaces/{}/jobs/{}",
                    self.config.namespace, name
                )),
            )
            .query(&[("propagationPolicy", policy)])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_custom(
        &self,
        kind: &CustomKind,
        name: &str,
        cascade: bool,
    ) -> Result<(), ClusterError> {
        let policy = if cascade { "Background" } else { "Orphan" };
        let resp = self
            .request(Method::DELETE, self.custom_path(kind, Some(name)))
            .query(&[("propagationPolicy", policy)])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let resp = self
            .request(Method::GET, self.url("/api/v1/nodes"))
            .send()
            .await?;
        let nodes: NodeListWire = Self::check(resp).await?.json().await?;
        Ok(nodes
            .items
            .into_iter()
            .map(|node| NodeInfo {
                name: node.metadata.name,
                allocatable: node
                    .status
                    .and_then(|s| s.allocatable)
                    .unwrap_or_default(),
            })
            .collect())
    }
}

/// Split a streaming log body into lines.
fn line_stream(resp: Response) -> LogStream {
    struct State {
        body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
        buf: Vec<u8>,
        ready: VecDeque<String>,
        done: bool,
    }

    let state = State {
        body: resp.bytes_stream().boxed(),
        buf: Vec::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.ready.pop_front() {
                return Some((Ok(line), st));
            }
            if st.done {
                if st.buf.is_empty() {
                    return None;
                }
                let line = String::from_utf8_lossy(&st.buf).to_string();
                st.buf.clear();
                return Some((Ok(line), st));
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(&chunk);
                    while let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                        let rest = st.buf.split_off(pos + 1);
                        let line = String::from_utf8_lossy(&st.buf[..pos]).to_string();
                        st.buf = rest;
                        st.ready.push_back(line);
                    }
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err.into()), st));
                }
                None => st.done = true,
            }
        }
    }))
}

// Wire-format fragments, limited to the fields wharf reads.

#[derive(Debug, Deserialize)]
struct StatusWire {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectMetaWire {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NamedWire {
    metadata: ObjectMetaWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodWire {
    metadata: ObjectMetaWire,
    status: Option<PodStatusWire>,
}

impl PodWire {
    fn state(&self) -> PodState {
        let status = self.status.as_ref();
        PodState {
            phase: status.and_then(|s| s.phase).unwrap_or(PodPhase::Unknown),
            message: status.and_then(|s| s.message.clone()),
            waiting_reasons: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|containers| {
                    containers
                        .iter()
                        .filter_map(|c| c.state.as_ref())
                        .filter_map(|s| s.waiting.as_ref())
                        .filter_map(|w| w.reason.clone())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusWire {
    phase: Option<PodPhase>,
    message: Option<String>,
    container_statuses: Option<Vec<ContainerStatusWire>>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatusWire {
    state: Option<ContainerStateWire>,
}

#[derive(Debug, Deserialize)]
struct ContainerStateWire {
    waiting: Option<WaitingWire>,
}

#[derive(Debug, Deserialize)]
struct WaitingWire {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodListWire {
    items: Vec<PodWire>,
}

#[derive(Debug, Deserialize)]
struct JobWire {
    status: Option<JobStatusWire>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatusWire {
    active: Option<u32>,
    succeeded: Option<u32>,
    failed: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventWire {
    #[serde(rename = "type")]
    event_type: Option<String>,
    reason: Option<String>,
    message: Option<String>,
    source: Option<EventSourceWire>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl EventWire {
    fn into_event(self) -> WorkloadEvent {
        let source = self
            .source
            .map(|s| {
                [s.component, s.host]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        WorkloadEvent {
            event_type: self.event_type.unwrap_or_default(),
            reason: self.reason.unwrap_or_default(),
            source,
            message: self.message.unwrap_or_default(),
            timestamp: self.last_timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventSourceWire {
    component: Option<String>,
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventListWire {
    items: Vec<EventWire>,
}

#[derive(Debug, Deserialize)]
struct NodeWire {
    metadata: ObjectMetaWire,
    status: Option<NodeStatusWire>,
}

#[derive(Debug, Deserialize)]
struct NodeStatusWire {
    allocatable: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct NodeListWire {
    items: Vec<NodeWire>,
}
