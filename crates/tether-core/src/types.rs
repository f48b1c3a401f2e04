//! Core domain types shared by the manager client and the session core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a managed workload controller.
///
/// The set is closed; kind-specific behavior lives in the workload watcher
/// drivers, not on the entity itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Unspecified,
    Deployment,
    ReplicaSet,
    StatefulSet,
    Rollout,
}

impl WorkloadKind {
    /// Parse a kind from its lower-cased resource name. Unknown names map to
    /// `Unspecified`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "deployment" => WorkloadKind::Deployment,
            "replicaset" => WorkloadKind::ReplicaSet,
            "statefulset" => WorkloadKind::StatefulSet,
            "rollout" => WorkloadKind::Rollout,
            _ => WorkloadKind::Unspecified,
        }
    }

    /// The wire name, as reported in exported workload info.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Unspecified => "UNSPECIFIED",
            WorkloadKind::Deployment => "DEPLOYMENT",
            WorkloadKind::ReplicaSet => "REPLICASET",
            WorkloadKind::StatefulSet => "STATEFULSET",
            WorkloadKind::Rollout => "ROLLOUT",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollout state of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadState {
    #[default]
    Unknown,
    Progressing,
    Available,
    Failed,
    NotFound,
}

impl WorkloadState {
    /// Name used as the not-interceptable reason for entries that are not
    /// `Available`.
    pub fn name(&self) -> &'static str {
        match self {
            WorkloadState::Unknown => "Unknown",
            WorkloadState::Progressing => "Progressing",
            WorkloadState::Available => "Available",
            WorkloadState::Failed => "Failed",
            WorkloadState::NotFound => "NotFound",
        }
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Traffic-agent installation state of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    #[default]
    None,
    Installing,
    Installed,
    Failed,
}

/// Key of a workload within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Materialized per-workload state, as maintained by the workload view.
#[derive(Debug, Clone, Default)]
pub struct WorkloadEntry {
    pub uid: String,
    pub state: WorkloadState,
    pub agent_state: AgentState,
    pub intercept_clients: Vec<String>,
}

/// Opaque session membership returned by the traffic manager. Required on
/// every subsequent manager call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

impl SessionRef {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

/// Identifies one user daemon on this host. Stable across restarts of the
/// same connection, distinct between connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonIdentifier {
    /// Connection name, as chosen by the front-end.
    pub name: String,
    /// Kubernetes context the daemon is bound to.
    pub kube_context: String,
    /// Connected namespace.
    pub namespace: String,
    /// Whether the daemon runs inside a container.
    pub in_container: bool,
}

impl DaemonIdentifier {
    pub fn new(
        name: impl Into<String>,
        kube_context: impl Into<String>,
        namespace: impl Into<String>,
        in_container: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kube_context: kube_context.into(),
            namespace: namespace.into(),
            in_container,
        }
    }

    /// Stable file-system-safe encoding of this identifier, used to key the
    /// session identity cache. Lower-cased, with every run of characters
    /// outside `[a-z0-9]` collapsed to a single `-`.
    pub fn encoded(&self) -> String {
        let raw = if self.in_container {
            format!("{}-{}-{}-cn", self.name, self.kube_context, self.namespace)
        } else {
            format!("{}-{}-{}", self.name, self.kube_context, self.namespace)
        };
        let mut out = String::with_capacity(raw.len());
        let mut last_dash = false;
        for c in raw.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        out.trim_matches('-').to_string()
    }
}

impl fmt::Display for DaemonIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

/// Directive to route a subnet through a workload's pod network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetViaWorkload {
    pub subnet: String,
    pub workload: String,
}

/// Snapshot of a workload controller as observed by a local informer.
///
/// Only populated by the local watcher driver; the remote driver receives
/// ready-made state from the manager.
#[derive(Debug, Clone)]
pub struct WorkloadObject {
    pub kind: WorkloadKind,
    pub name: String,
    pub uid: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    /// Set when the controller reports a failure condition (e.g. progress
    /// deadline exceeded).
    pub failed: bool,
}

impl WorkloadObject {
    /// Derive the rollout state from the observed replica counts.
    pub fn state(&self) -> WorkloadState {
        if self.failed {
            WorkloadState::Failed
        } else if self.ready_replicas >= self.desired_replicas
            && self.updated_replicas >= self.desired_replicas
        {
            WorkloadState::Available
        } else {
            WorkloadState::Progressing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(WorkloadKind::from_name("Deployment"), WorkloadKind::Deployment);
        assert_eq!(WorkloadKind::from_name("replicaset"), WorkloadKind::ReplicaSet);
        assert_eq!(WorkloadKind::from_name("StatefulSet"), WorkloadKind::StatefulSet);
        assert_eq!(WorkloadKind::from_name("rollout"), WorkloadKind::Rollout);
        assert_eq!(WorkloadKind::from_name("cronjob"), WorkloadKind::Unspecified);
    }

    #[test]
    fn test_kind_wire_name() {
        assert_eq!(WorkloadKind::Deployment.to_string(), "DEPLOYMENT");
        assert_eq!(WorkloadKind::Unspecified.to_string(), "UNSPECIFIED");
    }

    #[test]
    fn test_daemon_identifier_encoding() {
        let id = DaemonIdentifier::new("My Conn", "gke_proj/eu-west1", "Default", false);
        assert_eq!(id.encoded(), "my-conn-gke-proj-eu-west1-default");

        let in_cn = DaemonIdentifier::new("c", "ctx", "ns", true);
        assert_eq!(in_cn.encoded(), "c-ctx-ns-cn");
    }

    #[test]
    fn test_daemon_identifier_encoding_is_stable() {
        let a = DaemonIdentifier::new("conn", "ctx", "ns", false);
        let b = DaemonIdentifier::new("conn", "ctx", "ns", false);
        assert_eq!(a.encoded(), b.encoded());
    }

    #[test]
    fn test_workload_object_state() {
        let mut obj = WorkloadObject {
            kind: WorkloadKind::Deployment,
            name: "web".to_string(),
            uid: "u1".to_string(),
            desired_replicas: 2,
            ready_replicas: 2,
            updated_replicas: 2,
            failed: false,
        };
        assert_eq!(obj.state(), WorkloadState::Available);

        obj.ready_replicas = 1;
        assert_eq!(obj.state(), WorkloadState::Progressing);

        obj.failed = true;
        assert_eq!(obj.state(), WorkloadState::Failed);
    }
}
