//! Cluster access for load scenarios
//!
//! This module provides:
//! - `ClusterClient` trait for abstracting the cluster API
//! - `KubeClient` talking to the Kubernetes REST API
//! - Port forwarding over the API server's websocket subresource

mod portforward;
mod rest;
mod service;
mod types;

pub use rest::KubeClient;
pub use service::ClusterClient;
pub use types::{
    ClusterError, FixtureHandle, FixtureSpec, OutputStream, ReadyPolicy, Target, TargetPhase,
    TargetSelector, TunnelRequest,
};
