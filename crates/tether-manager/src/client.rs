//! Client wrapper around the manager transport
//!
//! Adds what the raw channel does not have: the parsed manager version, the
//! product-name default, compatibility fallbacks for older managers, and the
//! mapping of designated status codes onto the error taxonomy.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tonic::{Code, Status};

use tether_core::config::ClientConfig;
use tether_core::error::CategorizedError;
use tether_core::types::{SessionRef, WorkloadKind};

use crate::api::{CallOptions, ClientInfo, ManagerApi};

/// Semantic version reported by the manager, `v` prefix stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManagerVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ManagerVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ManagerVersion {
    type Err = CategorizedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix('v').unwrap_or(s);
        // Ignore any pre-release or build suffix on the patch component.
        let core = bare
            .split_once(['-', '+'])
            .map(|(head, _)| head)
            .unwrap_or(bare);
        let mut parts = core.splitn(3, '.');
        let mut next = |what: &str| -> Result<u64, CategorizedError> {
            parts
                .next()
                .unwrap_or("")
                .parse::<u64>()
                .map_err(|_| {
                    CategorizedError::other(format!("unable to parse manager version {s:?}: bad {what}"))
                })
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}

impl fmt::Display for ManagerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Legacy workload kinds assumed when the manager predates
/// `get-known-workload-kinds`.
const LEGACY_WORKLOAD_KINDS: [WorkloadKind; 3] = [
    WorkloadKind::Deployment,
    WorkloadKind::ReplicaSet,
    WorkloadKind::StatefulSet,
];

/// A connected, version-probed traffic-manager client.
#[derive(Clone)]
pub struct ManagerClient {
    api: Arc<dyn ManagerApi>,
    name: String,
    version: ManagerVersion,
    opts: CallOptions,
}

impl ManagerClient {
    /// Probe the transport's version info and wrap it.
    pub async fn connect(
        api: Arc<dyn ManagerApi>,
        opts: CallOptions,
    ) -> Result<Self, CategorizedError> {
        let vi = api
            .version_info(&opts)
            .await
            .map_err(|st| CategorizedError::other(format!("manager version probe failed: {st}")))?;
        let version = vi.version.parse::<ManagerVersion>()?;
        let name = if vi.name.is_empty() {
            // Older managers don't report a product name.
            "Traffic Manager".to_string()
        } else {
            vi.name
        };
        Ok(Self {
            api,
            name,
            version,
            opts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> ManagerVersion {
        self.version
    }

    pub fn call_options(&self) -> &CallOptions {
        &self.opts
    }

    /// Raw access for the watcher tasks.
    pub fn api(&self) -> &Arc<dyn ManagerApi> {
        &self.api
    }

    /// Whether the manager drives workload watches itself (2.21 and later);
    /// older managers leave watching to a local informer.
    pub fn has_remote_workload_watch(&self) -> bool {
        self.version.major > 2 || (self.version.major == 2 && self.version.minor > 20)
    }

    /// Apply a merged configuration's gRPC options to subsequent calls.
    pub fn apply_config(&mut self, config: &ClientConfig) {
        self.opts.max_receive_size = config.grpc.max_receive_size;
    }

    /// Announce this client to the manager and obtain a session.
    ///
    /// `FailedPrecondition` carries a message meant for the user and is
    /// surfaced verbatim in the user category.
    pub async fn arrive_as_client(&self, client: ClientInfo) -> Result<SessionRef, CategorizedError> {
        self.api
            .arrive_as_client(client, &self.opts)
            .await
            .map_err(|st| {
                if st.code() == Code::FailedPrecondition {
                    CategorizedError::user(st.message().to_string())
                } else {
                    CategorizedError::other(format!("manager.ArriveAsClient: {st}"))
                }
            })
    }

    pub async fn remain(&self, session: &SessionRef) -> Result<(), Status> {
        self.api.remain(session, &self.opts).await
    }

    pub async fn depart(&self, session: &SessionRef) -> Result<(), Status> {
        self.api.depart(session, &self.opts).await
    }

    /// Fetch the manager's client configuration defaults. Any failure,
    /// including an unparsable payload, yields `None` and thereby the
    /// built-in defaults; only unexpected errors are logged.
    pub async fn get_client_config(&self) -> Option<ClientConfig> {
        let payload = match self.api.get_client_config(&self.opts).await {
            Ok(payload) => payload,
            Err(st) => {
                if st.code() != Code::Unimplemented {
                    tracing::warn!("failed to get remote config from traffic manager: {st}");
                }
                return None;
            }
        };
        match serde_yaml::from_slice::<ClientConfig>(&payload.config_yaml) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("client configuration from cluster is invalid: {e}");
                None
            }
        }
    }

    /// Workload kinds the manager knows how to watch. Managers predating the
    /// call yield the legacy set.
    pub async fn get_known_workload_kinds(
        &self,
        session: &SessionRef,
    ) -> Result<Vec<WorkloadKind>, Status> {
        match self.api.get_known_workload_kinds(session, &self.opts).await {
            Ok(kinds) => Ok(kinds),
            Err(st) if st.code() == Code::Unimplemented => Ok(LEGACY_WORKLOAD_KINDS.to_vec()),
            Err(st) => Err(st),
        }
    }

    pub async fn remove_intercept(
        &self,
        session: &SessionRef,
        name: &str,
    ) -> Result<(), Status> {
        self.api.remove_intercept(session, name, &self.opts).await
    }

    pub async fn close(&self) {
        self.api.close().await;
    }
}
