//! Cluster-facing types and error definitions

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::engine::StopSignal;

/// Errors that can occur when talking to the cluster
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Port forward error: {0}")]
    PortForward(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Streamed output (logs) of a target
pub type OutputStream = BoxStream<'static, Result<Bytes, ClusterError>>;

/// Lifecycle phase of a target as reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl TargetPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => TargetPhase::Pending,
            Some("Running") => TargetPhase::Running,
            Some("Succeeded") => TargetPhase::Succeeded,
            Some("Failed") => TargetPhase::Failed,
            _ => TargetPhase::Unknown,
        }
    }
}

/// One addressable unit in the cluster (a pod)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub name: String,
    /// Named sub-endpoints (containers), in declaration order
    pub containers: Vec<String>,
    pub phase: TargetPhase,
}

impl Target {
    /// Container to read output from.
    ///
    /// Pods with several containers require an explicit choice, so the first
    /// one is used. Single-container pods let the server decide.
    pub fn default_container(&self) -> Option<&str> {
        if self.containers.len() > 1 {
            self.containers.first().map(String::as_str)
        } else {
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == TargetPhase::Running
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Which targets to list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSelector {
    /// None lists across all namespaces
    pub namespace: Option<String>,
    /// Kubernetes label selector, e.g. `app=nginx`
    pub labels: Option<String>,
}

impl TargetSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            labels: None,
        }
    }

    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = Some(labels.into());
        self
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespace = self.namespace.as_deref().unwrap_or("*");
        match &self.labels {
            Some(labels) => write!(f, "{}[{}]", namespace, labels),
            None => write!(f, "{}", namespace),
        }
    }
}

/// Workload to provision for the duration of one scenario run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    /// Labels applied to the workload and its pods
    pub labels: BTreeMap<String, String>,
    pub container_port: u16,
}

impl FixtureSpec {
    /// Selector matching the pods of this fixture
    pub fn selector(&self) -> TargetSelector {
        let labels = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        TargetSelector::in_namespace(&self.namespace).with_labels(labels)
    }
}

/// Handle to a provisioned fixture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureHandle {
    pub name: String,
    pub namespace: String,
    pub selector: TargetSelector,
}

impl FixtureHandle {
    pub fn for_spec(spec: &FixtureSpec) -> Self {
        Self {
            name: spec.name.clone(),
            namespace: spec.namespace.clone(),
            selector: spec.selector(),
        }
    }
}

impl fmt::Display for FixtureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How long and how often to poll for fixture readiness
#[derive(Debug, Clone, Copy)]
pub struct ReadyPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReadyPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Request to forward a local port to a port on a target
#[derive(Debug)]
pub struct TunnelRequest {
    pub target: Target,
    pub local_port: u16,
    pub remote_port: u16,
    /// Tunnel serves until this fires
    pub stop: StopSignal,
    /// Fired once the local port accepts connections
    pub ready: oneshot::Sender<()>,
}
