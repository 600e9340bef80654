//! Kubernetes REST client
//!
//! Talks to the API server over plain HTTP(S) with an optional bearer token.
//! The default endpoint is a local `kubectl proxy`, which takes care of
//! authentication.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use metrics::counter;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::ClusterConfig;

use super::portforward::{self, PortForwardEndpoint};
use super::service::ClusterClient;
use super::types::{
    ClusterError, FixtureHandle, FixtureSpec, OutputStream, Target, TargetPhase, TargetSelector,
    TunnelRequest,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cluster client backed by the Kubernetes REST API
pub struct KubeClient {
    http: Client,
    api_server: String,
    token: Option<String>,
}

impl KubeClient {
    /// Create a client from cluster configuration
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let api_server = config.api_server.trim_end_matches('/').to_string();
        if !api_server.starts_with("http://") && !api_server.starts_with("https://") {
            return Err(ClusterError::InvalidRequest(format!(
                "API server URL must start with http:// or https://, got {:?}",
                config.api_server
            )));
        }

        let token = config.resolve_token()?;

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()?;

        info!("Using API server at {}", api_server);

        Ok(Self {
            http,
            api_server,
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.api_server, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn port_forward_endpoint(&self, target: &Target, remote_port: u16) -> PortForwardEndpoint {
        let ws_base = if let Some(rest) = self.api_server.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else {
            format!("ws://{}", self.api_server.trim_start_matches("http://"))
        };

        PortForwardEndpoint {
            url: format!(
                "{}/api/v1/namespaces/{}/pods/{}/portforward?ports={}",
                ws_base, target.namespace, target.name, remote_port
            ),
            token: self.token.clone(),
        }
    }
}

/// Turn non-success responses into errors
async fn check(response: Response) -> Result<Response, ClusterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        Err(ClusterError::NotFound(message))
    } else {
        Err(ClusterError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn pods_path(selector: &TargetSelector) -> String {
    match &selector.namespace {
        Some(ns) => format!("/api/v1/namespaces/{}/pods", ns),
        None => "/api/v1/pods".to_string(),
    }
}

// ============================================================================
// API payloads (only the fields we read)
// ============================================================================

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

impl From<Pod> for Target {
    fn from(pod: Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace,
            name: pod.metadata.name,
            containers: pod.spec.containers.into_iter().map(|c| c.name).collect(),
            phase: TargetPhase::parse(pod.status.phase.as_deref()),
        }
    }
}

/// Deployment manifest for a fixture
fn deployment_manifest(spec: &FixtureSpec) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
        },
        "spec": {
            "replicas": spec.replicas,
            "selector": { "matchLabels": spec.labels },
            "template": {
                "metadata": { "labels": spec.labels },
                "spec": {
                    "containers": [{
                        "name": spec.name,
                        "image": spec.image,
                        "ports": [{ "containerPort": spec.container_port }],
                    }],
                },
            },
        },
    })
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn list_targets(&self, selector: &TargetSelector) -> Result<Vec<Target>, ClusterError> {
        let mut request = self.request(Method::GET, &pods_path(selector));
        if let Some(labels) = &selector.labels {
            request = request.query(&[("labelSelector", labels.as_str())]);
        }

        let response = check(request.send().await?).await?;
        let pods: PodList = serde_json::from_slice(&response.bytes().await?)?;
        Ok(pods.items.into_iter().map(Target::from).collect())
    }

    async fn stream_output(
        &self,
        target: &Target,
        container: Option<&str>,
    ) -> Result<OutputStream, ClusterError> {
        let path = format!(
            "/api/v1/namespaces/{}/pods/{}/log",
            target.namespace, target.name
        );
        let mut request = self.request(Method::GET, &path);
        if let Some(container) = container {
            request = request.query(&[("container", container)]);
        }

        let response = check(request.send().await?).await?;
        Ok(response.bytes_stream().map_err(ClusterError::from).boxed())
    }

    async fn open_tunnel(&self, request: TunnelRequest) -> Result<(), ClusterError> {
        let endpoint = self.port_forward_endpoint(&request.target, request.remote_port);
        debug!("Port forward endpoint for {}: {}", request.target, endpoint.url);
        portforward::serve(endpoint, request).await
    }

    async fn create_fixture(&self, spec: &FixtureSpec) -> Result<FixtureHandle, ClusterError> {
        let path = format!("/apis/apps/v1/namespaces/{}/deployments", spec.namespace);
        let request = self
            .request(Method::POST, &path)
            .json(&deployment_manifest(spec));

        check(request.send().await?).await?;
        counter!("konnload_fixtures_created_total").increment(1);
        info!("Deployment {}/{} created", spec.namespace, spec.name);

        Ok(FixtureHandle::for_spec(spec))
    }

    async fn delete_fixture(&self, handle: &FixtureHandle) -> Result<(), ClusterError> {
        let path = format!(
            "/apis/apps/v1/namespaces/{}/deployments/{}",
            handle.namespace, handle.name
        );
        let request = self
            .request(Method::DELETE, &path)
            .query(&[("propagationPolicy", "Background")]);

        check(request.send().await?).await?;
        counter!("konnload_fixtures_deleted_total").increment(1);
        info!("Deployment {} deleted", handle);
        Ok(())
    }
}
