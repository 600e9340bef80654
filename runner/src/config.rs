//! Scenario configuration
//!
//! Configuration is loaded from an optional YAML file. Every section may be
//! omitted and falls back to built-in defaults. Cluster access settings can be
//! overridden from environment variables.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cluster::{ClusterError, FixtureSpec, ReadyPolicy, TargetSelector};

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster access
    pub cluster: ClusterConfig,

    /// Concurrent log streaming scenario
    pub concurrent_connections: ConnectionsConfig,

    /// Concurrent port-forward scenario
    pub concurrent_portforwards: PortForwardsConfig,
}

/// How to reach the cluster API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// API server base URL
    pub api_server: String,
    /// Bearer token
    pub token: Option<String>,
    /// File holding a bearer token (used when `token` is unset)
    pub token_file: Option<PathBuf>,
    /// Skip TLS certificate verification for HTTPS API servers
    pub insecure_skip_tls_verify: bool,
}

/// Concurrent log streaming scenario settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Number of concurrent workers
    #[serde(alias = "number_of_concurrent_users")]
    pub worker_count: usize,
    /// Log retrievals per worker
    #[serde(alias = "number_of_times")]
    pub iterations: usize,
    /// Upper bound of the random delay before each retrieval
    pub max_jitter_ms: u64,
    /// Namespace to pick pods from (all namespaces when unset)
    pub namespace: Option<String>,
}

/// Concurrent port-forward scenario settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortForwardsConfig {
    /// Number of concurrent tunnels
    #[serde(alias = "number_of_concurrent_portforwards")]
    pub worker_count: usize,
    /// How long each tunnel is held open
    #[serde(alias = "keep_connected_for_seconds")]
    pub hold_duration_seconds: u64,
    /// Local port of the first tunnel; worker `i` uses `start_port + i`
    pub start_port: u16,
    /// Pod port the tunnels forward to
    pub remote_port: u16,
    /// Delay between requests through a tunnel
    pub probe_interval_ms: u64,
    /// Workload provisioned for the tunnels
    pub fixture: FixtureConfig,
}

/// Fixture workload settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    /// Value of the `app` label on the fixture pods
    pub app_label: String,
    pub ready_timeout_seconds: u64,
    pub ready_poll_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: "http://127.0.0.1:8001".to_string(),
            token: None,
            token_file: None,
            insecure_skip_tls_verify: false,
        }
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            iterations: 10,
            max_jitter_ms: 15_000,
            namespace: None,
        }
    }
}

impl Default for PortForwardsConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            hold_duration_seconds: 30,
            start_port: 18080,
            remote_port: 8080,
            probe_interval_ms: 3_000,
            fixture: FixtureConfig::default(),
        }
    }
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            name: "konnload-nginx".to_string(),
            namespace: "default".to_string(),
            image: "bitnami/nginx".to_string(),
            replicas: 10,
            app_label: "konnload-nginx".to_string(),
            ready_timeout_seconds: 60,
            ready_poll_interval_seconds: 2,
        }
    }
}

impl ClusterConfig {
    /// Bearer token from inline config or token file
    pub fn resolve_token(&self) -> Result<Option<String>, ClusterError> {
        if let Some(token) = &self.token
            && !token.is_empty()
        {
            return Ok(Some(token.clone()));
        }
        match &self.token_file {
            Some(path) => {
                let token = std::fs::read_to_string(path)?;
                Ok(Some(token.trim().to_string()))
            }
            None => Ok(None),
        }
    }
}

impl ConnectionsConfig {
    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn selector(&self) -> TargetSelector {
        match &self.namespace {
            Some(ns) => TargetSelector::in_namespace(ns),
            None => TargetSelector::all(),
        }
    }
}

impl PortForwardsConfig {
    pub fn hold_duration(&self) -> Duration {
        Duration::from_secs(self.hold_duration_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Local port used by a worker. Validated configs never overflow.
    pub fn local_port(&self, worker: usize) -> u16 {
        self.start_port.saturating_add(worker as u16)
    }

    pub fn fixture_spec(&self) -> FixtureSpec {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), self.fixture.app_label.clone());

        FixtureSpec {
            name: self.fixture.name.clone(),
            namespace: self.fixture.namespace.clone(),
            image: self.fixture.image.clone(),
            replicas: self.fixture.replicas,
            labels,
            container_port: self.remote_port,
        }
    }

    pub fn ready_policy(&self) -> ReadyPolicy {
        ReadyPolicy {
            timeout: Duration::from_secs(self.fixture.ready_timeout_seconds),
            poll_interval: Duration::from_secs(self.fixture.ready_poll_interval_seconds),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            info!("Config file {:?} not found, using defaults", path);
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document. Empty documents yield defaults.
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Override cluster access settings from environment variables
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("KONNLOAD_API_SERVER")
            && !url.is_empty()
        {
            self.cluster.api_server = url;
        }
        if let Ok(token) = env::var("KONNLOAD_TOKEN")
            && !token.is_empty()
        {
            self.cluster.token = Some(token);
        }
        if let Ok(path) = env::var("KONNLOAD_TOKEN_FILE")
            && !path.is_empty()
        {
            self.cluster.token_file = Some(PathBuf::from(path));
        }
        if let Ok(val) = env::var("KONNLOAD_INSECURE_SKIP_TLS_VERIFY") {
            self.cluster.insecure_skip_tls_verify = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Reject settings the scenarios cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pf = &self.concurrent_portforwards;

        if pf.worker_count > 0 {
            if pf.start_port == 0 {
                return Err(ConfigError::Invalid(
                    "concurrent_portforwards.start_port must be non-zero".to_string(),
                ));
            }
            let last_port = (pf.start_port as usize)
                .checked_add(pf.worker_count - 1)
                .filter(|port| *port <= u16::MAX as usize)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "concurrent_portforwards needs {} ports from {} which exceeds {}",
                        pf.worker_count,
                        pf.start_port,
                        u16::MAX
                    ))
                })?;
            debug!(
                "concurrent_portforwards uses ports {}..={}",
                pf.start_port, last_port
            );
        }
        if pf.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "concurrent_portforwards.probe_interval_ms must be non-zero".to_string(),
            ));
        }
        if pf.fixture.replicas == 0 {
            return Err(ConfigError::Invalid(
                "concurrent_portforwards.fixture.replicas must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
