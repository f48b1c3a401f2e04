//! Connect surface: the request, the supplied collaborators, and the
//! connect-info report handed back to the front-end

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use tether_core::cache::SessionCache;
use tether_core::config::ClientConfig;
use tether_core::error::{ConnectError, ConnectErrorKind, ErrorCategory};
use tether_core::traits::cluster::ClusterApi;
use tether_core::types::{SessionRef, SubnetViaWorkload};
use tether_manager::api::{InterceptInfo, ManagerApi};

use crate::forward::{DialHandler, PortForwarder};
use crate::registry::IngestInfo;
use crate::rootd::{DaemonStatus, RootDaemonApi};

/// Parameters of a connect (or update-status) call.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Connection name; part of the daemon identity.
    pub name: String,
    /// Requested namespaces; `["all"]` and an empty list both mean "no
    /// explicit mapping".
    pub mapped_namespaces: Vec<String>,
    /// Overrides the computed `user@host` client id.
    pub client_id: Option<String>,
    pub is_pod_daemon: bool,
    /// Whether this daemon runs inside a container; part of the daemon
    /// identity.
    pub in_container: bool,
    pub subnet_via_workloads: Vec<SubnetViaWorkload>,
    /// Namespace the traffic manager is installed in.
    pub manager_namespace: String,
    pub kube_context: String,
    pub kube_server: String,
    pub kube_flags: HashMap<String, String>,
    pub kubeconfig_data: Vec<u8>,
    /// Environment the front-end was invoked with. A key with a leading `-`
    /// requires the variable to be unset locally.
    pub environment: HashMap<String, String>,
}

impl ConnectRequest {
    /// The explicitly requested namespaces; `["all"]` collapses to none.
    pub fn requested_namespaces(&self) -> Vec<String> {
        if self.mapped_namespaces.len() == 1 && self.mapped_namespaces[0] == "all" {
            Vec::new()
        } else {
            self.mapped_namespaces.clone()
        }
    }
}

/// Port-forward helper that yields the manager transport. Supplied, not
/// implemented, by the session core.
#[async_trait]
pub trait ManagerConnector: Send + Sync {
    async fn connect(&self, manager_namespace: &str) -> anyhow::Result<Arc<dyn ManagerApi>>;
}

/// Yields the root daemon endpoint: either the in-process root session or a
/// client over the local socket.
#[async_trait]
pub trait RootDaemonConnector: Send + Sync {
    async fn open(&self) -> anyhow::Result<Arc<dyn RootDaemonApi>>;
}

/// Registers the local authenticator service and yields the context of an
/// external kubeconfig pointing the root daemon at it.
#[async_trait]
pub trait ClusterAuthBridge: Send + Sync {
    async fn external_kube_context(&self) -> anyhow::Result<String>;
}

/// Everything the session core does not implement itself.
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterApi>,
    pub manager_connector: Arc<dyn ManagerConnector>,
    pub root_daemon: Arc<dyn RootDaemonConnector>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub dialer: Arc<dyn DialHandler>,
    pub cache: SessionCache,
    /// Installation id, stable across sessions on this host.
    pub install_id: String,
    /// Local configuration, as parsed and merged by the front-end.
    pub local_config: ClientConfig,
    /// Present when `connect-from-root-daemon` may be honored.
    pub auth_bridge: Option<Arc<dyn ClusterAuthBridge>>,
}

/// Error slot of a [`ConnectInfo`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectInfoError {
    #[default]
    Unspecified,
    ClusterFailed,
    TrafficManagerFailed,
    DaemonFailed,
    MustRestart,
    AlreadyConnected,
}

impl From<ConnectErrorKind> for ConnectInfoError {
    fn from(kind: ConnectErrorKind) -> Self {
        match kind {
            ConnectErrorKind::ClusterFailed => ConnectInfoError::ClusterFailed,
            ConnectErrorKind::TrafficManagerFailed => ConnectInfoError::TrafficManagerFailed,
            ConnectErrorKind::DaemonFailed => ConnectInfoError::DaemonFailed,
        }
    }
}

/// Status report of a session, also used to convey connect failures.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub error: ConnectInfoError,
    pub error_text: String,
    pub error_category: ErrorCategory,

    pub cluster_context: String,
    pub cluster_server: String,
    pub cluster_id: String,
    pub connection_name: String,
    pub namespace: String,
    pub kube_flags: HashMap<String, String>,

    pub session: Option<SessionRef>,
    pub manager_namespace: String,
    pub manager_name: String,
    /// Manager version, `v`-prefixed.
    pub manager_version: String,

    pub intercepts: Vec<InterceptInfo>,
    pub ingests: Vec<IngestInfo>,
    pub subnet_via_workloads: Vec<SubnetViaWorkload>,
    /// Present only when a namespace mapping is in force.
    pub mapped_namespaces: Option<Vec<String>>,
    pub daemon_status: Option<DaemonStatus>,
}

impl ConnectInfo {
    pub fn from_error(err: &ConnectError) -> Self {
        Self {
            error: err.kind.into(),
            error_text: err.message.clone(),
            error_category: err.category,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_collapses_to_no_mapping() {
        let req = ConnectRequest {
            mapped_namespaces: vec!["all".to_string()],
            ..Default::default()
        };
        assert!(req.requested_namespaces().is_empty());

        let req = ConnectRequest {
            mapped_namespaces: vec!["alpha".to_string(), "beta".to_string()],
            ..Default::default()
        };
        assert_eq!(req.requested_namespaces(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_connect_info_from_error() {
        let err = ConnectError::new(
            ConnectErrorKind::TrafficManagerFailed,
            ErrorCategory::User,
            "traffic manager not found",
        );
        let info = ConnectInfo::from_error(&err);
        assert_eq!(info.error, ConnectInfoError::TrafficManagerFailed);
        assert_eq!(info.error_category, ErrorCategory::User);
        assert_eq!(info.error_text, "traffic manager not found");
    }
}
