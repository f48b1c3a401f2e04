//! Intercept and ingest registry
//!
//! One mutex guards the agent snapshot, the intercepts, the API matchers and
//! servers, the intercept waiters and the cached ingress info. Ingests live
//! in their own concurrent map. The mutex is never held across an RPC call;
//! port-forwards are established outside the lock and attached afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tether_manager::api::{AgentInfo, InterceptDisposition, InterceptInfo};

use crate::forward::{IngestKey, PortForwardHandle};

/// Ingest as exported to list/status callers.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestInfo {
    pub workload: String,
    pub container: String,
    pub local_port: u16,
}

/// An active ingest and the forward that serves it.
pub struct Ingest {
    pub key: IngestKey,
    pub handle: PortForwardHandle,
}

impl Ingest {
    pub fn response(&self) -> IngestInfo {
        IngestInfo {
            workload: self.key.workload.clone(),
            container: self.key.container.clone(),
            local_port: self.key.local_port,
        }
    }
}

/// Matches inbound API-server requests onto an intercept.
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    /// Path prefix the request must carry. Empty matches every path.
    pub path_prefix: String,
    /// Headers that must all be present with equal values.
    pub headers: HashMap<String, String>,
}

impl RequestMatcher {
    pub fn matches(&self, path: &str, headers: &HashMap<String, String>) -> bool {
        if !path.starts_with(&self.path_prefix) {
            return false;
        }
        self.headers
            .iter()
            .all(|(k, v)| headers.get(k).is_some_and(|hv| hv == v))
    }
}

/// Request matcher plus intercept metadata, keyed by intercept id.
#[derive(Debug, Clone, Default)]
pub struct ApiMatcher {
    pub request: RequestMatcher,
    pub metadata: HashMap<String, String>,
}

/// One API server per listening port. Dropping it stops the server task.
pub struct ApiServer {
    pub port: u16,
    cancel: CancellationToken,
}

impl ApiServer {
    pub fn new(port: u16, cancel: CancellationToken) -> Self {
        Self { port, cancel }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Ingress target cached for intercept creation.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressInfo {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// An intercept plus the forward that pumps it, if any.
pub struct InterceptEntry {
    pub info: InterceptInfo,
    pub handle: Option<PortForwardHandle>,
}

#[derive(Default)]
struct RegistryInner {
    /// Latest snapshot delivered by the agents watcher.
    agents: Vec<AgentInfo>,
    /// Current intercepts, keyed by intercept id.
    intercepts: HashMap<String, InterceptEntry>,
    /// API matchers, keyed by intercept id.
    matchers: HashMap<String, ApiMatcher>,
    /// API servers, keyed by listening port.
    api_servers: HashMap<u16, ApiServer>,
    /// Short-lived waiters keyed by intercept name, resolved when a matching
    /// intercept appears.
    waiters: HashMap<String, oneshot::Sender<InterceptInfo>>,
    ingress_info: Option<IngressInfo>,
}

/// Shared registry of intercept/ingest state.
pub struct InterceptRegistry {
    inner: Mutex<RegistryInner>,
    ingests: DashMap<IngestKey, Arc<Ingest>>,
}

/// Outcome of merging an intercept snapshot, handed to the watcher for the
/// work that must happen outside the lock.
pub(crate) struct InterceptDelta {
    /// Newly appeared active intercepts that still need a port-forward.
    pub to_forward: Vec<InterceptInfo>,
    /// Waiters resolved by this snapshot, with the info to send.
    pub resolved: Vec<(oneshot::Sender<InterceptInfo>, InterceptInfo)>,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            ingests: DashMap::new(),
        }
    }

    /// Replace the agent snapshot.
    pub fn set_agents(&self, agents: Vec<AgentInfo>) {
        self.inner.lock().unwrap().agents = agents;
    }

    /// Installed agent versions by workload name, limited to the given
    /// namespaces.
    pub fn agent_versions(&self, namespaces: &[String]) -> HashMap<String, String> {
        let inner = self.inner.lock().unwrap();
        inner
            .agents
            .iter()
            .filter(|a| namespaces.iter().any(|ns| *ns == a.namespace))
            .map(|a| (a.name.clone(), a.version.clone()))
            .collect()
    }

    /// Merge a snapshot from the intercept watcher. Entries keep their
    /// established forward; removed intercepts drop theirs. Forward
    /// establishment and waiter resolution happen in the returned delta,
    /// outside the lock.
    pub(crate) fn apply_intercept_snapshot(
        &self,
        snapshot: Vec<InterceptInfo>,
        own_client: &str,
    ) -> InterceptDelta {
        let mut inner = self.inner.lock().unwrap();
        let mut delta = InterceptDelta {
            to_forward: Vec::new(),
            resolved: Vec::new(),
        };
        let mut next: HashMap<String, InterceptEntry> = HashMap::new();
        for info in snapshot {
            if let Some(tx) = inner.waiters.remove(&info.spec.name) {
                delta.resolved.push((tx, info.clone()));
            }
            let handle = inner
                .intercepts
                .remove(&info.id)
                .and_then(|entry| entry.handle);
            if handle.is_none()
                && info.disposition == InterceptDisposition::Active
                && info.spec.client == own_client
            {
                delta.to_forward.push(info.clone());
            }
            next.insert(info.id.clone(), InterceptEntry { info, handle });
        }
        // Whatever remains in the old map is gone; dropping the entries
        // stops their forwards.
        let stale: Vec<String> = inner.intercepts.keys().cloned().collect();
        for id in stale {
            inner.matchers.remove(&id);
        }
        inner.intercepts = next;
        delta
    }

    /// Attach an established forward, unless the intercept vanished while it
    /// was being set up.
    pub(crate) fn attach_forward(&self, id: &str, handle: PortForwardHandle) {
        let mut inner = self.inner.lock().unwrap();
        match inner.intercepts.get_mut(id) {
            Some(entry) => entry.handle = Some(handle),
            None => drop(handle),
        }
    }

    /// Register a waiter for an intercept that is about to be created.
    /// Resolved (and deleted) when the watcher delivers a matching entry.
    pub fn wait_for_intercept(&self, name: &str) -> oneshot::Receiver<InterceptInfo> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap()
            .waiters
            .insert(name.to_string(), tx);
        rx
    }

    /// Delete a waiter after caller cancellation or timeout.
    pub fn abandon_waiter(&self, name: &str) {
        self.inner.lock().unwrap().waiters.remove(name);
    }

    /// Current intercept infos.
    pub fn current_intercepts(&self) -> Vec<InterceptInfo> {
        let inner = self.inner.lock().unwrap();
        inner.intercepts.values().map(|e| e.info.clone()).collect()
    }

    /// Intercepts grouped by agent name, limited to the given namespaces.
    pub fn intercepts_by_agent(&self, namespaces: &[String]) -> HashMap<String, Vec<InterceptInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut map: HashMap<String, Vec<InterceptInfo>> = HashMap::new();
        for entry in inner.intercepts.values() {
            let spec = &entry.info.spec;
            if namespaces.iter().any(|ns| *ns == spec.namespace) {
                map.entry(spec.agent.clone()).or_default().push(entry.info.clone());
            }
        }
        map
    }

    /// Drop the intercept with the given name, stopping its forward.
    pub fn remove_intercept_named(&self, name: &str) -> Option<InterceptInfo> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner
            .intercepts
            .iter()
            .find(|(_, e)| e.info.spec.name == name)
            .map(|(id, _)| id.clone())?;
        inner.matchers.remove(&id);
        inner.intercepts.remove(&id).map(|e| e.info)
    }

    pub fn set_api_matcher(&self, intercept_id: &str, matcher: ApiMatcher) {
        self.inner
            .lock()
            .unwrap()
            .matchers
            .insert(intercept_id.to_string(), matcher);
    }

    pub fn api_matcher(&self, intercept_id: &str) -> Option<ApiMatcher> {
        self.inner.lock().unwrap().matchers.get(intercept_id).cloned()
    }

    /// Track an API server for its port; replaces (and thereby stops) any
    /// previous server on that port.
    pub fn set_api_server(&self, server: ApiServer) {
        self.inner.lock().unwrap().api_servers.insert(server.port, server);
    }

    pub fn set_ingress_info(&self, info: Option<IngressInfo>) {
        self.inner.lock().unwrap().ingress_info = info;
    }

    pub fn ingress_info(&self) -> Option<IngressInfo> {
        self.inner.lock().unwrap().ingress_info.clone()
    }

    /// Add an active ingest. False when the key is already in use.
    pub fn add_ingest(&self, ingest: Ingest) -> bool {
        let key = ingest.key.clone();
        match self.ingests.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Arc::new(ingest));
                true
            }
        }
    }

    /// Remove an ingest, stopping its forward.
    pub fn remove_ingest(&self, key: &IngestKey) -> Option<IngestInfo> {
        self.ingests.remove(key).map(|(_, ig)| ig.response())
    }

    /// Current ingests grouped by workload name.
    pub fn ingests_by_workload(&self) -> HashMap<String, Vec<IngestInfo>> {
        let mut map: HashMap<String, Vec<IngestInfo>> = HashMap::new();
        for entry in self.ingests.iter() {
            map.entry(entry.key().workload.clone())
                .or_default()
                .push(entry.value().response());
        }
        map
    }

    pub fn current_ingests(&self) -> Vec<IngestInfo> {
        self.ingests.iter().map(|e| e.value().response()).collect()
    }

    /// Drop everything: intercept forwards, matchers, servers, waiters and
    /// ingests. Used by uninstall-all.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.intercepts.clear();
        inner.matchers.clear();
        inner.api_servers.clear();
        inner.waiters.clear();
        inner.ingress_info = None;
        drop(inner);
        self.ingests.clear();
    }
}

impl Default for InterceptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_manager::api::InterceptSpec;

    fn intercept(id: &str, name: &str, agent: &str, namespace: &str) -> InterceptInfo {
        InterceptInfo {
            id: id.to_string(),
            spec: InterceptSpec {
                name: name.to_string(),
                client: "jane@laptop".to_string(),
                agent: agent.to_string(),
                namespace: namespace.to_string(),
                target_host: "127.0.0.1".to_string(),
                target_port: 8080,
                service_name: None,
            },
            disposition: InterceptDisposition::Active,
            message: String::new(),
        }
    }

    #[test]
    fn test_snapshot_merge_keeps_handles_and_flags_new() {
        let registry = InterceptRegistry::new();
        let delta =
            registry.apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "jane@laptop");
        assert_eq!(delta.to_forward.len(), 1);

        registry.attach_forward("i1", PortForwardHandle::new(CancellationToken::new()));

        // Same intercept again: handle kept, nothing new to forward.
        let delta =
            registry.apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "jane@laptop");
        assert!(delta.to_forward.is_empty());

        // Intercept gone: entry dropped.
        let delta = registry.apply_intercept_snapshot(vec![], "jane@laptop");
        assert!(delta.to_forward.is_empty());
        assert!(registry.current_intercepts().is_empty());
    }

    #[test]
    fn test_foreign_client_intercepts_are_not_forwarded() {
        let registry = InterceptRegistry::new();
        let delta = registry
            .apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "joe@desktop");
        assert!(delta.to_forward.is_empty());
        assert_eq!(registry.current_intercepts().len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_resolution() {
        let registry = InterceptRegistry::new();
        let rx = registry.wait_for_intercept("web");

        let delta =
            registry.apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "jane@laptop");
        for (tx, info) in delta.resolved {
            let _ = tx.send(info);
        }
        let info = rx.await.unwrap();
        assert_eq!(info.id, "i1");

        // Waiter is gone once resolved.
        let delta =
            registry.apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "jane@laptop");
        assert!(delta.resolved.is_empty());
    }

    #[test]
    fn test_abandoned_waiter_is_deleted() {
        let registry = InterceptRegistry::new();
        let _rx = registry.wait_for_intercept("web");
        registry.abandon_waiter("web");
        let delta =
            registry.apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "jane@laptop");
        assert!(delta.resolved.is_empty());
    }

    #[test]
    fn test_intercepts_by_agent_respects_namespaces() {
        let registry = InterceptRegistry::new();
        registry.apply_intercept_snapshot(
            vec![
                intercept("i1", "web", "web", "default"),
                intercept("i2", "api", "api", "other"),
            ],
            "jane@laptop",
        );
        let map = registry.intercepts_by_agent(&["default".to_string()]);
        assert!(map.contains_key("web"));
        assert!(!map.contains_key("api"));
    }

    #[test]
    fn test_ingest_lifecycle() {
        let registry = InterceptRegistry::new();
        let key = IngestKey {
            workload: "web".to_string(),
            container: "app".to_string(),
            local_port: 8080,
        };
        assert!(registry.add_ingest(Ingest {
            key: key.clone(),
            handle: PortForwardHandle::new(CancellationToken::new()),
        }));
        // Duplicate key is refused.
        assert!(!registry.add_ingest(Ingest {
            key: key.clone(),
            handle: PortForwardHandle::new(CancellationToken::new()),
        }));

        let by_workload = registry.ingests_by_workload();
        assert_eq!(by_workload["web"].len(), 1);

        assert!(registry.remove_ingest(&key).is_some());
        assert!(registry.remove_ingest(&key).is_none());
    }

    #[test]
    fn test_clear_all() {
        let registry = InterceptRegistry::new();
        registry.apply_intercept_snapshot(vec![intercept("i1", "web", "web", "default")], "jane@laptop");
        registry.add_ingest(Ingest {
            key: IngestKey {
                workload: "web".to_string(),
                container: "app".to_string(),
                local_port: 8080,
            },
            handle: PortForwardHandle::new(CancellationToken::new()),
        });
        registry.clear_all();
        assert!(registry.current_intercepts().is_empty());
        assert!(registry.current_ingests().is_empty());
    }

    #[test]
    fn test_request_matcher() {
        let mut headers = HashMap::new();
        headers.insert("x-tether-id".to_string(), "i1".to_string());
        let matcher = RequestMatcher {
            path_prefix: "/api".to_string(),
            headers: headers.clone(),
        };
        assert!(matcher.matches("/api/v1/users", &headers));
        assert!(!matcher.matches("/healthz", &headers));
        assert!(!matcher.matches("/api/v1/users", &HashMap::new()));
    }
}
