//! Root daemon link
//!
//! The privileged root daemon owns the host TUN device and DNS resolver. It
//! must observe exactly the same session identity as this process; the
//! handshake verifies that and recovers once from a stale root session.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tonic::Status;

use tether_core::types::{SessionRef, SubnetViaWorkload};

/// Network configuration handed to the root daemon on connect.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub session: SessionRef,
    /// Merged client configuration, JSON-serialized.
    pub client_config: Vec<u8>,
    pub home_dir: String,
    /// Connected namespace.
    pub namespace: String,
    pub subnet_via_workloads: Vec<SubnetViaWorkload>,
    pub kube_flags: HashMap<String, String>,
    pub kubeconfig_data: Vec<u8>,
    /// Context of the external kubeconfig that routes cluster
    /// authentication through the user daemon, when enabled.
    pub external_kube_context: Option<String>,
}

/// Outbound-network state reported by the root daemon.
#[derive(Debug, Clone, Default)]
pub struct OutboundConfig {
    pub session: Option<SessionRef>,
}

#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    pub outbound_config: Option<OutboundConfig>,
    pub version: String,
}

/// RPC surface of the root daemon. Implemented both by the in-process root
/// session and by the local-socket client; the front-end supplies whichever
/// applies.
#[async_trait]
pub trait RootDaemonApi: Send + Sync {
    async fn connect(&self, config: NetworkConfig) -> Result<DaemonStatus, Status>;

    async fn disconnect(&self) -> Result<(), Status>;

    /// Wait until the TUN device and DNS are serving the cluster network.
    async fn wait_for_network(&self) -> Result<(), Status>;

    async fn set_dns_top_level_domains(&self, domains: Vec<String>) -> Result<(), Status>;

    async fn status(&self) -> Result<DaemonStatus, Status>;
}

/// Establish id agreement with the root daemon, then wait for its network.
///
/// A mismatching session id means the root daemon is still running a stale
/// session (a previous daemon crashed without disconnecting): disconnect and
/// retry the connect exactly once; a second mismatch is fatal.
pub(crate) async fn connect_root_daemon(
    rd: &dyn RootDaemonApi,
    config: NetworkConfig,
    api_timeout: Duration,
) -> anyhow::Result<()> {
    tracing::info!("connecting to root daemon...");
    for attempt in 1.. {
        let status = rd
            .connect(config.clone())
            .await
            .context("failed to connect to root daemon")?;
        let session = status
            .outbound_config
            .and_then(|oc| oc.session)
            .context("root daemon's outbound config has no session")?;
        if session.session_id == config.session.session_id {
            break;
        }
        if attempt == 2 {
            anyhow::bail!("unable to reconnect to root daemon");
        }
        tracing::debug!("root daemon ran a stale session, disconnecting it");
        rd.disconnect()
            .await
            .context("failed to disconnect from the root daemon")?;
    }

    // The root daemon interacts with the cluster-side manager to set up its
    // TUN device and DNS; the manager is known to respond at this point.
    tokio::time::timeout(api_timeout, rd.wait_for_network())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for the root daemon network"))?
        .map_err(|st| anyhow::anyhow!("failed to connect to root daemon: {}", st.message()))?;
    tracing::debug!("connected to root daemon");
    Ok(())
}

/// Push the DNS top-level domains for the given namespaces, always
/// including the literal `svc` element.
pub(crate) async fn post_daemon_domains(rd: &dyn RootDaemonApi, namespaces: &[String]) {
    const SVC_DOMAIN: &str = "svc";

    let mut domains: Vec<String> = namespaces.to_vec();
    if !domains.iter().any(|d| d == SVC_DOMAIN) {
        domains.push(SVC_DOMAIN.to_string());
    }
    tracing::debug!("posting top-level domains {domains:?} to root daemon");
    if let Err(st) = rd.set_dns_top_level_domains(domains.clone()).await {
        tracing::error!("error posting domains {domains:?} to root daemon: {st}");
        return;
    }
    tracing::debug!("domains posted successfully");
}
