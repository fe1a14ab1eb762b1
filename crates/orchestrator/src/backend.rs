//! Where a probe executes: in this process, or in a remote function.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use probe::{run_probe, ProbeContext, ProbeServices};
use sentinel_core::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::registry::ProbeRegistry;

/// Inputs identical for both backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeJob {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub target_url: String,
    pub probe_type: String,
    #[serde(default)]
    pub configuration: Value,
}

impl ProbeJob {
    pub fn new(run: &Run, session: &Session) -> Self {
        ProbeJob {
            run_id: run.id,
            session_id: session.id,
            target_url: run.target_url.clone(),
            probe_type: session.probe_type.clone(),
            configuration: run.configuration.clone(),
        }
    }

    pub fn kind(&self) -> ProbeKind {
        ProbeKind::resolve(&self.probe_type)
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute the job to completion. An `Err` means the probe could not be
    /// dispatched or its outcome is unknown; probe failures themselves come
    /// back as `Ok(SessionStatus::Failed)`.
    async fn dispatch(&self, job: &ProbeJob, cancel: &CancellationToken) -> anyhow::Result<SessionStatus>;
}

/// In-process execution through the probe lifecycle wrapper.
pub struct LocalBackend {
    registry: ProbeRegistry,
    store: Arc<dyn RecordStore>,
    services: Arc<ProbeServices>,
}

impl LocalBackend {
    pub fn new(registry: ProbeRegistry, store: Arc<dyn RecordStore>, services: Arc<ProbeServices>) -> Self {
        LocalBackend { registry, store, services }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn dispatch(&self, job: &ProbeJob, cancel: &CancellationToken) -> anyhow::Result<SessionStatus> {
        let kind = job.kind();
        let probe = self.registry.resolve(kind).ok_or_else(|| anyhow!("no probe registered for {kind}"))?;
        if probe.kind() != kind {
            debug!(requested = %job.probe_type, using = %probe.kind(), "probe type resolved to default");
        }
        let ctx = ProbeContext::new(
            job.run_id,
            job.session_id,
            probe.kind(),
            job.target_url.clone(),
            &job.configuration,
            self.store.clone(),
            self.services.clone(),
            cancel.child_token(),
        );
        Ok(run_probe(probe.as_ref(), &ctx).await)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Invokes `{endpoint}/run_<probe>_agent` with the job as JSON. The remote
/// side runs the same lifecycle against the same store.
pub struct RemoteBackend {
    client: reqwest::Client,
    opts: RemoteOptions,
}

#[derive(Deserialize)]
struct RemoteReply {
    status: Option<String>,
}

impl RemoteBackend {
    pub fn new(opts: RemoteOptions) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(opts.timeout).build()?;
        Ok(RemoteBackend { client, opts })
    }

    pub fn function_name(kind: ProbeKind) -> String {
        format!("run_{}_agent", kind.as_str())
    }

    fn url(&self, kind: ProbeKind) -> String {
        format!("{}/{}", self.opts.endpoint.trim_end_matches('/'), Self::function_name(kind))
    }
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn dispatch(&self, job: &ProbeJob, _cancel: &CancellationToken) -> anyhow::Result<SessionStatus> {
        let url = self.url(job.kind());
        info!(session_id = %job.session_id, probe = %job.probe_type, %url, "dispatching probe remotely");
        let mut req = self.client.post(&url).json(job);
        if let Some(token) = &self.opts.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.with_context(|| format!("invoke {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("remote probe returned HTTP {}: {}", status.as_u16(), body.chars().take(300).collect::<String>());
        }
        let reply: RemoteReply = resp.json().await.unwrap_or(RemoteReply { status: None });
        match reply.status.as_deref().and_then(SessionStatus::parse) {
            Some(s) => Ok(s),
            None => bail!("remote probe reply carried no session status"),
        }
    }
}

/// Chooses the backend per probe kind; callers never branch on which one.
#[derive(Clone)]
pub struct BackendSelector {
    local: Arc<dyn ExecutionBackend>,
    remote: Option<Arc<dyn ExecutionBackend>>,
    remote_kinds: HashSet<ProbeKind>,
}

impl BackendSelector {
    pub fn local_only(local: Arc<dyn ExecutionBackend>) -> Self {
        BackendSelector { local, remote: None, remote_kinds: HashSet::new() }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ExecutionBackend>, kinds: impl IntoIterator<Item = ProbeKind>) -> Self {
        self.remote = Some(remote);
        self.remote_kinds = kinds.into_iter().collect();
        self
    }

    pub fn for_kind(&self, kind: ProbeKind) -> &Arc<dyn ExecutionBackend> {
        match &self.remote {
            Some(remote) if self.remote_kinds.contains(&kind) => remote,
            _ => &self.local,
        }
    }
}
