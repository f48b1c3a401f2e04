//! Wire surface of the in-cluster traffic manager
//!
//! The transport itself (a gRPC channel over a kubectl-style port-forward)
//! is established by a collaborator and handed in as an implementation of
//! [`ManagerApi`]; this module defines the typed calls the session core
//! consumes and the gRPC status vocabulary their errors use.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tonic::Status;

use tether_core::types::{AgentState, SessionRef, WorkloadKind, WorkloadState};

/// Per-call options applied to every manager call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Maximum message size accepted from the manager, in bytes.
    pub max_receive_size: Option<u64>,
}

/// Result of the version-info probe.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Product name. Older managers report an empty string.
    pub name: String,
    /// Version string, usually prefixed with `v`.
    pub version: String,
}

/// Identity presented when arriving as a client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// `user@host`, unless overridden by the front-end.
    pub name: String,
    pub namespace: String,
    pub install_id: String,
    pub product: String,
    pub version: String,
}

/// Raw `client.yaml` payload reported by the manager.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigPayload {
    pub config_yaml: Vec<u8>,
}

/// Workload rollout state as encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Unspecified,
    Progressing,
    Available,
    Failed,
    NotFound,
}

impl From<RemoteState> for WorkloadState {
    fn from(s: RemoteState) -> Self {
        match s {
            RemoteState::Unspecified => WorkloadState::Unknown,
            RemoteState::Progressing => WorkloadState::Progressing,
            RemoteState::Available => WorkloadState::Available,
            RemoteState::Failed => WorkloadState::Failed,
            RemoteState::NotFound => WorkloadState::NotFound,
        }
    }
}

/// Workload as delivered on the manager's workload-event stream.
#[derive(Debug, Clone)]
pub struct RemoteWorkload {
    pub kind: WorkloadKind,
    pub name: String,
    pub uid: String,
    pub state: RemoteState,
    pub agent_state: AgentState,
    pub intercept_clients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadEventType {
    Added,
    Modified,
    Deleted,
}

/// One entry of a workload event batch.
#[derive(Debug, Clone)]
pub struct WorkloadEvent {
    pub event_type: WorkloadEventType,
    pub workload: RemoteWorkload,
}

/// Traffic agent as delivered on the agents stream.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub namespace: String,
    pub version: String,
}

/// Desired redirection of a remote workload to a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptSpec {
    pub name: String,
    /// Client id that owns the intercept.
    pub client: String,
    /// Name of the agent (and thereby workload) being intercepted.
    pub agent: String,
    pub namespace: String,
    pub target_host: String,
    pub target_port: u16,
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDisposition {
    Unspecified,
    Waiting,
    Active,
    Removed,
    AgentError,
}

/// Intercept as reported by the manager's intercept watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptInfo {
    pub id: String,
    pub spec: InterceptSpec,
    pub disposition: InterceptDisposition,
    pub message: String,
}

/// Request from the cluster to open an outbound connection on its behalf.
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub conn_id: String,
    pub address: String,
    pub protocol: String,
}

pub type WorkloadEventStream =
    Pin<Box<dyn Stream<Item = Result<Vec<WorkloadEvent>, Status>> + Send>>;
pub type AgentInfoStream = Pin<Box<dyn Stream<Item = Result<Vec<AgentInfo>, Status>> + Send>>;
pub type InterceptInfoStream =
    Pin<Box<dyn Stream<Item = Result<Vec<InterceptInfo>, Status>> + Send>>;
pub type DialRequestStream = Pin<Box<dyn Stream<Item = Result<DialRequest, Status>> + Send>>;

/// Typed channel to the in-cluster traffic manager.
///
/// Server streams are lazy and restartable: consumers re-invoke the watch
/// call after a stream error, the manager resynchronizes with a fresh
/// snapshot batch.
#[async_trait]
pub trait ManagerApi: Send + Sync {
    async fn version_info(&self, opts: &CallOptions) -> Result<VersionInfo, Status>;

    async fn arrive_as_client(
        &self,
        client: ClientInfo,
        opts: &CallOptions,
    ) -> Result<SessionRef, Status>;

    async fn remain(&self, session: &SessionRef, opts: &CallOptions) -> Result<(), Status>;

    async fn depart(&self, session: &SessionRef, opts: &CallOptions) -> Result<(), Status>;

    async fn get_client_config(&self, opts: &CallOptions)
        -> Result<ClientConfigPayload, Status>;

    async fn get_known_workload_kinds(
        &self,
        session: &SessionRef,
        opts: &CallOptions,
    ) -> Result<Vec<WorkloadKind>, Status>;

    async fn watch_workloads(
        &self,
        session: &SessionRef,
        namespace: &str,
        opts: &CallOptions,
    ) -> Result<WorkloadEventStream, Status>;

    async fn watch_agents(
        &self,
        session: &SessionRef,
        opts: &CallOptions,
    ) -> Result<AgentInfoStream, Status>;

    async fn watch_intercepts(
        &self,
        session: &SessionRef,
        opts: &CallOptions,
    ) -> Result<InterceptInfoStream, Status>;

    async fn watch_dial_requests(
        &self,
        session: &SessionRef,
        opts: &CallOptions,
    ) -> Result<DialRequestStream, Status>;

    async fn create_intercept(
        &self,
        session: &SessionRef,
        spec: InterceptSpec,
        opts: &CallOptions,
    ) -> Result<InterceptInfo, Status>;

    async fn remove_intercept(
        &self,
        session: &SessionRef,
        name: &str,
        opts: &CallOptions,
    ) -> Result<(), Status>;

    /// Tear down the underlying transport. Idempotent.
    async fn close(&self);
}
