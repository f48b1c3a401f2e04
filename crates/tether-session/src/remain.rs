//! Session liveness
//!
//! A 5 second heartbeat keeps the manager's session alive and is the one
//! place session expiry is detected. The loop also owns the epilogue: a
//! detached, bounded depart, the cache cleanup, and the transport close.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tether_core::cache::SessionCache;
use tether_core::error::SessionError;
use tether_core::types::{DaemonIdentifier, SessionRef};
use tether_manager::ManagerClient;

use crate::session::SessionBehavior;

const REMAIN_TICK: Duration = Duration::from_secs(5);
const DEPART_TIMEOUT: Duration = Duration::from_secs(3);

/// Tick until expiry or cancellation, then depart.
///
/// `Expired` is the single designated way to cause a session restart; every
/// other heartbeat failure has already been logged and swallowed by
/// [`SessionBehavior::remain`].
pub(crate) async fn remain_loop(
    cancel: CancellationToken,
    behavior: Arc<dyn SessionBehavior>,
    manager: ManagerClient,
    session: SessionRef,
    cache: SessionCache,
    daemon_id: DaemonIdentifier,
) -> Result<(), SessionError> {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + REMAIN_TICK,
        REMAIN_TICK,
    );

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = ticker.tick() => {
                if let Err(e) = behavior.remain().await {
                    break Err(e);
                }
            }
        }
    };

    // Orderly shutdown, detached from the session context: the manager must
    // hear the depart even though everything else is tearing down.
    match tokio::time::timeout(DEPART_TIMEOUT, manager.depart(&session)).await {
        Ok(Ok(())) => {
            // Depart succeeded so the manager has dropped the session; drop
            // the cached identity too.
            if let Err(e) = cache.delete(&daemon_id).await {
                tracing::error!("failed to delete session from user cache: {e}");
            }
        }
        Ok(Err(st)) => tracing::error!("failed to depart from manager: {st}"),
        Err(_) => tracing::error!("failed to depart from manager: timed out"),
    }
    manager.close().await;
    result
}
