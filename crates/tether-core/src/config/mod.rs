//! Recognized client configuration options
//!
//! Parsing and merging of configuration *files* is the front-end's job; this
//! module models the options the session core acts on, the defaults applied
//! when the manager reports nothing, and the merge of manager-reported
//! defaults with local overrides.

pub mod serde_utils;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use serde_utils::duration_secs_opt;

/// Effective client configuration for one session. Every field is optional
/// in the serialized form; accessors apply the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub timeouts: TimeoutConfig,
    pub grpc: GrpcConfig,
    pub cluster: ClusterConfig,
    pub routing: RoutingConfig,
}

impl ClientConfig {
    /// Merge manager-reported defaults into this (local) configuration.
    ///
    /// Local values take precedence in every field; the never-proxy set is
    /// the union of both sides.
    pub fn merge_remote(mut self, remote: ClientConfig) -> ClientConfig {
        self.timeouts.traffic_manager_connect = self
            .timeouts
            .traffic_manager_connect
            .or(remote.timeouts.traffic_manager_connect);
        self.timeouts.traffic_manager_api = self
            .timeouts
            .traffic_manager_api
            .or(remote.timeouts.traffic_manager_api);
        self.grpc.max_receive_size = self.grpc.max_receive_size.or(remote.grpc.max_receive_size);
        if self.cluster.mapped_namespaces.is_empty() {
            self.cluster.mapped_namespaces = remote.cluster.mapped_namespaces;
        }
        self.cluster.connect_from_root_daemon = self
            .cluster
            .connect_from_root_daemon
            .or(remote.cluster.connect_from_root_daemon);
        for subnet in remote.routing.never_proxy {
            if !self.routing.never_proxy.contains(&subnet) {
                self.routing.never_proxy.push(subnet);
            }
        }
        self
    }
}

/// Timeouts applied to manager interactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Bound on establishing the manager connection and acquiring a session.
    #[serde(with = "duration_secs_opt", skip_serializing_if = "Option::is_none")]
    pub traffic_manager_connect: Option<Duration>,

    /// Per-call bound on unary manager and root-daemon calls.
    #[serde(with = "duration_secs_opt", skip_serializing_if = "Option::is_none")]
    pub traffic_manager_api: Option<Duration>,
}

impl TimeoutConfig {
    pub fn traffic_manager_connect(&self) -> Duration {
        self.traffic_manager_connect
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn traffic_manager_api(&self) -> Duration {
        self.traffic_manager_api.unwrap_or(Duration::from_secs(15))
    }
}

/// gRPC channel options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrpcConfig {
    /// Maximum message size accepted on manager streams, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_receive_size: Option<u64>,
}

/// Cluster-scoped options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Namespaces this session exposes. Empty means all namespaces the
    /// cluster-side manager serves.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mapped_namespaces: Vec<String>,

    /// Let the root daemon own the cluster connection, authenticating
    /// through the user daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_from_root_daemon: Option<bool>,
}

impl ClusterConfig {
    pub fn connect_from_root_daemon(&self) -> bool {
        self.connect_from_root_daemon.unwrap_or(false)
    }
}

/// Outbound routing options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Subnets that must never be routed through the cluster.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub never_proxy: Vec<String>,
}
