//! Port-forward and dial collaborators
//!
//! The payload transport of an intercept or ingest is out of scope for the
//! session core; these traits are the seams the front-end plugs its
//! forwarder implementation into. The core owns the handles and thereby the
//! forward lifetimes.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tether_manager::api::{DialRequest, InterceptInfo};

/// Handle to an established port-forward pump. Dropping the handle stops
/// the pump.
#[derive(Debug)]
pub struct PortForwardHandle {
    cancel: CancellationToken,
}

impl PortForwardHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PortForwardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Key of an active ingest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngestKey {
    pub workload: String,
    pub container: String,
    pub local_port: u16,
}

/// Establishes the actual forwards for intercepts and ingests.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Start forwarding an active intercept's traffic to the local target.
    async fn establish(&self, intercept: &InterceptInfo) -> anyhow::Result<PortForwardHandle>;

    /// Start a local port-forward that lets local code address the workload
    /// container as if local.
    async fn ingest(&self, key: &IngestKey) -> anyhow::Result<PortForwardHandle>;
}

/// Services dial requests issued by the cluster.
#[async_trait]
pub trait DialHandler: Send + Sync {
    async fn handle(&self, request: DialRequest) -> anyhow::Result<()>;
}
