//! Cluster collaborator traits
//!
//! The session core never talks to the Kubernetes API directly; the
//! front-end supplies an implementation of [`ClusterApi`] bound to the
//! kubeconfig it constructed.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ClusterError;
use crate::types::{WorkloadKind, WorkloadObject};

/// Change observed on a single watched config map.
#[derive(Debug, Clone)]
pub enum ConfigMapEvent {
    /// The map was added or modified; carries the full data section.
    Applied(BTreeMap<String, String>),
    /// The map was deleted.
    Deleted,
}

/// Change observed by a local workload informer.
#[derive(Debug, Clone)]
pub enum LocalWorkloadEvent {
    Applied(WorkloadObject),
    Deleted(WorkloadObject),
}

/// Server-side watch of one config map. The stream ending means the watch
/// terminated; callers restart it until cancelled.
pub type ConfigMapWatch = Pin<Box<dyn Stream<Item = ConfigMapEvent> + Send>>;

/// Merged event channel of the per-kind informers for one namespace. Events
/// arrive in batches; a terminating `None` ends the watch cleanly.
pub type LocalWorkloadStream = Pin<Box<dyn Stream<Item = Vec<LocalWorkloadEvent>> + Send>>;

/// Access to the cluster this session is bound to.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Kubeconfig context name.
    fn context(&self) -> &str;

    /// API server URL.
    fn server(&self) -> &str;

    /// Connected namespace.
    fn namespace(&self) -> &str;

    /// Stable identifier of the cluster (typically the kube-system UID).
    fn cluster_id(&self) -> &str;

    /// Whether a service with the given name exists in the namespace.
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    /// Fetch a config map's data section. `None` when the map is absent.
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ClusterError>;

    /// Replace a config map's data section. `None` clears it.
    async fn update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: Option<BTreeMap<String, String>>,
    ) -> Result<(), ClusterError>;

    /// Open a single-object watch on a config map.
    async fn watch_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMapWatch, ClusterError>;

    /// Start in-process informers for the given workload kinds in a
    /// namespace and subscribe to their merged event channel.
    async fn watch_workloads(
        &self,
        namespace: &str,
        kinds: &[WorkloadKind],
    ) -> Result<LocalWorkloadStream, ClusterError>;
}
