//! Common Test Utilities for Integration Tests
//!
//! Provides `MockCluster`, an in-memory `ClusterClient` whose tunnels serve
//! real HTTP on the requested local port.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use konnload::cluster::{
    ClusterClient, ClusterError, FixtureHandle, FixtureSpec, OutputStream, Target, TargetPhase,
    TargetSelector, TunnelRequest,
};
use konnload::config::{ConnectionsConfig, PortForwardsConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Upper bound for runs that should end early
pub const QUICK: Duration = Duration::from_secs(3);

/// Create a pod-like target
pub fn target(name: &str, containers: &[&str], phase: TargetPhase) -> Target {
    Target {
        namespace: "default".to_string(),
        name: name.to_string(),
        containers: containers.iter().map(|c| c.to_string()).collect(),
        phase,
    }
}

/// `count` running single-container targets
pub fn running_targets(count: usize) -> Vec<Target> {
    (0..count)
        .map(|i| target(&format!("web-{}", i), &["web"], TargetPhase::Running))
        .collect()
}

/// Log streaming settings without jitter
pub fn connections_config(workers: usize, iterations: usize) -> ConnectionsConfig {
    ConnectionsConfig {
        worker_count: workers,
        iterations,
        max_jitter_ms: 0,
        namespace: None,
    }
}

/// Port-forward settings with fast readiness polling
pub fn portforwards_config(
    workers: usize,
    start_port: u16,
    hold_seconds: u64,
    probe_interval_ms: u64,
) -> PortForwardsConfig {
    let mut config = PortForwardsConfig {
        worker_count: workers,
        hold_duration_seconds: hold_seconds,
        start_port,
        probe_interval_ms,
        ..PortForwardsConfig::default()
    };
    config.fixture.replicas = 2;
    config.fixture.ready_timeout_seconds = 5;
    config.fixture.ready_poll_interval_seconds = 1;
    config
}

/// In-memory cluster with call counters
pub struct MockCluster {
    targets: Mutex<Vec<Target>>,
    payload: Bytes,
    fixtures: Mutex<HashSet<String>>,
    /// Ports whose tunnels drop every connection unanswered
    broken_ports: Mutex<HashSet<u16>>,
    /// Every Nth log stream fails to open (0 = never)
    stream_failure_every: usize,
    fail_list: AtomicBool,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    containers_requested: Mutex<Vec<Option<String>>>,

    pub list_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub tunnels_opened: AtomicUsize,
    pub tunnels_closed: AtomicUsize,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MockCluster {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: Mutex::new(targets),
            payload: Bytes::from_static(b"0123456789"),
            fixtures: Mutex::new(HashSet::new()),
            broken_ports: Mutex::new(HashSet::new()),
            stream_failure_every: 0,
            fail_list: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            containers_requested: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            tunnels_opened: AtomicUsize::new(0),
            tunnels_closed: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn with_payload(mut self, payload: &'static [u8]) -> Self {
        self.payload = Bytes::from_static(payload);
        self
    }

    pub fn with_stream_failure_every(mut self, n: usize) -> Self {
        self.stream_failure_every = n;
        self
    }

    pub fn break_port(&self, port: u16) {
        self.broken_ports.lock().unwrap().insert(port);
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn containers_requested(&self) -> Vec<Option<String>> {
        self.containers_requested.lock().unwrap().clone()
    }

    pub fn set_targets(&self, targets: Vec<Target>) {
        *self.targets.lock().unwrap() = targets;
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn list_targets(&self, _selector: &TargetSelector) -> Result<Vec<Target>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ClusterError::Api {
                status: 500,
                message: "list failed".to_string(),
            });
        }
        Ok(self.targets.lock().unwrap().clone())
    }

    async fn stream_output(
        &self,
        target: &Target,
        container: Option<&str>,
    ) -> Result<OutputStream, ClusterError> {
        let call = self.stream_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.containers_requested
            .lock()
            .unwrap()
            .push(container.map(str::to_string));

        if self.stream_failure_every > 0 && call % self.stream_failure_every == 0 {
            return Err(ClusterError::NotFound(target.to_string()));
        }

        let chunks: Vec<Result<Bytes, ClusterError>> = self
            .payload
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn open_tunnel(&self, request: TunnelRequest) -> Result<(), ClusterError> {
        self.tunnels_opened.fetch_add(1, Ordering::SeqCst);
        let broken = self
            .broken_ports
            .lock()
            .unwrap()
            .contains(&request.local_port);

        let listener = TcpListener::bind(("127.0.0.1", request.local_port)).await?;
        let _ = request.ready.send(());

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = request.stop.triggered() => break,
                accepted = listener.accept() => {
                    let (socket, _) = accepted?;
                    if broken {
                        drop(socket);
                        continue;
                    }
                    connections.spawn(serve_http(socket));
                }
            }
        }

        connections.shutdown().await;
        self.tunnels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_fixture(&self, spec: &FixtureSpec) -> Result<FixtureHandle, ClusterError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ClusterError::Api {
                status: 409,
                message: "already exists".to_string(),
            });
        }
        self.fixtures.lock().unwrap().insert(spec.name.clone());
        Ok(FixtureHandle::for_spec(spec))
    }

    async fn delete_fixture(&self, handle: &FixtureHandle) -> Result<(), ClusterError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ClusterError::Api {
                status: 500,
                message: "delete failed".to_string(),
            });
        }
        if self.fixtures.lock().unwrap().remove(&handle.name) {
            Ok(())
        } else {
            Err(ClusterError::NotFound(handle.to_string()))
        }
    }
}

/// Answer one HTTP request with a short body
async fn serve_http(mut socket: TcpStream) {
    let mut buf = [0u8; 1024];
    let mut request = Vec::new();
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }

    let _ = socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
        .await;
    let _ = socket.shutdown().await;
}
