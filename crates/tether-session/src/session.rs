//! The session supervisor
//!
//! Owns every component for the lifetime of one cluster connection:
//! constructs them during connect, runs the long-lived tasks as a group, and
//! guarantees the epilogue regardless of how the session ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::cache::{SessionCache, SessionRecord};
use tether_core::config::ClientConfig;
use tether_core::error::{
    CategorizedError, ConnectError, ConnectErrorKind, SessionError,
};
use tether_core::traits::cluster::ClusterApi;
use tether_core::types::{DaemonIdentifier, SessionRef, SubnetViaWorkload};
use tether_manager::api::{CallOptions, ClientInfo, InterceptInfo, InterceptSpec};
use tether_manager::ManagerClient;
use tonic::Code;

use crate::configwatch::{ConfigWatcher, CONFIG_MAP_NAME};
use crate::connect::{Collaborators, ConnectInfo, ConnectInfoError, ConnectRequest};
use crate::forward::{DialHandler, IngestKey, PortForwarder};
use crate::registry::{Ingest, IngestInfo, InterceptRegistry};
use crate::remain::remain_loop;
use crate::rootd::{connect_root_daemon, post_daemon_domains, NetworkConfig, RootDaemonApi};
use crate::tasks::{run_with_retry, TaskGroup};
use crate::workloads::{
    collect_infos, local_workloads_watcher, remote_workloads_watcher, FirstBatchSignal,
    SnapshotFilter, WorkloadInfo, WorkloadView,
};

const PRODUCT: &str = "tether";

/// Uninstall shapes accepted by [`Session::uninstall`].
#[derive(Debug, Clone)]
pub enum UninstallRequest {
    /// Remove the named agents in one namespace (the connected namespace
    /// when empty).
    NamedAgents {
        namespace: String,
        agents: Vec<String>,
    },
    /// Remove all agents in one namespace, or in every mapped namespace
    /// when `None`.
    AllAgents { namespace: Option<String> },
}

/// Capability set the supervisor dereferences instead of reaching through
/// its own methods, so callers may substitute a wrapper to intercept them.
/// The default realization is the session itself.
#[async_trait]
pub trait SessionBehavior: Send + Sync {
    /// One heartbeat. `Expired` requests a session restart; everything else
    /// must be swallowed after logging.
    async fn remain(&self) -> Result<(), SessionError>;

    /// Spawn the session's long-lived tasks into the group.
    fn start_services(&self, group: &mut TaskGroup);
}

struct SessionState {
    mapped_namespaces: Vec<String>,
    subnet_via_workloads: Vec<SubnetViaWorkload>,
}

/// One established membership in the cluster's traffic manager.
pub struct Session {
    cluster: Arc<dyn ClusterApi>,
    root_daemon: Arc<dyn RootDaemonApi>,
    manager: ManagerClient,
    cache: SessionCache,

    install_id: String,
    client_id: String,
    daemon_id: DaemonIdentifier,
    session_ref: SessionRef,

    /// Connect-time snapshot of the effective configuration.
    config: ClientConfig,
    manager_namespace: String,
    kube_flags: HashMap<String, String>,
    is_pod_daemon: bool,

    view: WorkloadView,
    registry: Arc<InterceptRegistry>,
    config_watcher: Arc<ConfigWatcher>,
    forwarder: Arc<dyn PortForwarder>,
    dialer: Arc<dyn DialHandler>,

    state: Mutex<SessionState>,
    cancel: CancellationToken,
    done: CancellationToken,
    self_ref: RwLock<Weak<dyn SessionBehavior>>,
}

impl Session {
    /// Establish a session. On failure, everything acquired so far has been
    /// released; panics anywhere on this path are recovered and reported as
    /// a daemon failure.
    pub async fn connect(
        request: ConnectRequest,
        collaborators: Collaborators,
    ) -> Result<Arc<Session>, ConnectError> {
        match std::panic::AssertUnwindSafe(Self::connect_inner(request, collaborators))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic);
                tracing::error!("panic during connect: {msg}");
                Err(ConnectError::daemon(format!("panic during connect: {msg}")))
            }
        }
    }

    async fn connect_inner(
        request: ConnectRequest,
        collaborators: Collaborators,
    ) -> Result<Arc<Session>, ConnectError> {
        tracing::info!("-- starting new session");
        let cluster = Arc::clone(&collaborators.cluster);
        tracing::info!(
            "connected to context {}, namespace {} ({})",
            cluster.context(),
            cluster.namespace(),
            cluster.server()
        );

        tracing::info!("connecting to traffic manager...");
        let connect_timeout = collaborators
            .local_config
            .timeouts
            .traffic_manager_connect();
        let bound = tokio::time::timeout(
            connect_timeout,
            Self::connect_mgr(&request, &collaborators),
        )
        .await;
        let (manager, session_ref, client_id, daemon_id) = match bound {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                tracing::error!("unable to connect to session: {}", e.message);
                return Err(e);
            }
            Err(_) => {
                return Err(ConnectError::traffic_manager(
                    "timed out connecting to the traffic manager",
                ))
            }
        };

        // Merge the manager's reported defaults, giving priority to the
        // local configuration; never-proxy is unioned inside the merge.
        let mut manager = manager;
        let mut config = collaborators.local_config.clone();
        if let Some(remote) = manager.get_client_config().await {
            config = config.merge_remote(remote);
        }
        manager.apply_config(&config);

        let mut mapped = request.requested_namespaces();
        if mapped.is_empty() {
            mapped = config.cluster.mapped_namespaces.clone();
        }
        mapped.sort();
        mapped.dedup();

        let mut network_config = NetworkConfig {
            session: session_ref.clone(),
            client_config: serde_json::to_vec(&config).unwrap_or_default(),
            home_dir: dirs::home_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            namespace: cluster.namespace().to_string(),
            subnet_via_workloads: request.subnet_via_workloads.clone(),
            kube_flags: request.kube_flags.clone(),
            kubeconfig_data: request.kubeconfig_data.clone(),
            external_kube_context: None,
        };
        if config.cluster.connect_from_root_daemon() && !request.is_pod_daemon {
            if let Some(bridge) = &collaborators.auth_bridge {
                // The root daemon must not execute the user's credential
                // helpers; route its cluster authentication through us.
                match bridge.external_kube_context().await {
                    Ok(context) => network_config.external_kube_context = Some(context),
                    Err(e) => {
                        manager.close().await;
                        return Err(ConnectError::daemon(format!("{e:#}")));
                    }
                }
            }
        }

        let root_daemon = match collaborators.root_daemon.open().await {
            Ok(rd) => rd,
            Err(e) => {
                manager.close().await;
                return Err(ConnectError::daemon(format!("{e:#}")));
            }
        };
        if let Err(e) = connect_root_daemon(
            root_daemon.as_ref(),
            network_config,
            config.timeouts.traffic_manager_api(),
        )
        .await
        {
            manager.close().await;
            return Err(ConnectError::daemon(format!("{e:#}")));
        }
        tracing::debug!("finished connecting to traffic manager");

        let session = Arc::new(Session {
            cluster,
            root_daemon,
            manager,
            cache: collaborators.cache,
            install_id: collaborators.install_id,
            client_id,
            daemon_id,
            session_ref,
            config,
            manager_namespace: request.manager_namespace.clone(),
            kube_flags: request.kube_flags,
            is_pod_daemon: request.is_pod_daemon,
            view: WorkloadView::new(),
            registry: Arc::new(InterceptRegistry::new()),
            config_watcher: Arc::new(ConfigWatcher::new(request.manager_namespace)),
            forwarder: collaborators.forwarder,
            dialer: collaborators.dialer,
            state: Mutex::new(SessionState {
                mapped_namespaces: mapped,
                subnet_via_workloads: request.subnet_via_workloads,
            }),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            self_ref: RwLock::new(Weak::<Session>::new() as Weak<dyn SessionBehavior>),
        });
        session.set_self(Arc::clone(&session) as Arc<dyn SessionBehavior>);

        // Whenever the namespace set changes, the DNS resolver must follow;
        // post the initial set now.
        session.update_daemon_namespaces().await;
        Ok(session)
    }

    /// Stages 3 and 4: manager bind and session identity acquisition.
    async fn connect_mgr(
        request: &ConnectRequest,
        collaborators: &Collaborators,
    ) -> Result<(ManagerClient, SessionRef, String, DaemonIdentifier), ConnectError> {
        let cluster = &collaborators.cluster;
        check_traffic_manager_service(cluster.as_ref(), &request.manager_namespace)
            .await
            .map_err(|e| ConnectError::categorized(ConnectErrorKind::TrafficManagerFailed, &e))?;

        let api = collaborators
            .manager_connector
            .connect(&request.manager_namespace)
            .await
            .map_err(|e| ConnectError::traffic_manager(format!("{e:#}")))?;
        let opts = CallOptions {
            max_receive_size: collaborators.local_config.grpc.max_receive_size,
        };
        let manager = ManagerClient::connect(api, opts)
            .await
            .map_err(|e| ConnectError::categorized(ConnectErrorKind::TrafficManagerFailed, &e))?;

        let client_id = match &request.client_id {
            Some(id) => id.clone(),
            None => format!(
                "{}@{}",
                whoami::username(),
                gethostname::gethostname().to_string_lossy()
            ),
        };
        let daemon_id = DaemonIdentifier::new(
            &request.name,
            cluster.context(),
            cluster.namespace(),
            request.in_container,
        );

        let cached = collaborators
            .cache
            .load(&daemon_id)
            .await
            .map_err(ConnectError::traffic_manager)?;
        if let Some(record) = cached {
            // Probe whether the manager still knows the session.
            if manager.remain(&record.session).await.is_ok() {
                tracing::debug!(
                    "traffic-manager port-forward established, client was already known to the traffic-manager as {:?}",
                    record.client_id
                );
                return Ok((manager, record.session, record.client_id, daemon_id));
            }
        }

        tracing::debug!(
            "traffic-manager port-forward established, making client known to the traffic-manager as {client_id:?}"
        );
        let session_ref = manager
            .arrive_as_client(ClientInfo {
                name: client_id.clone(),
                namespace: cluster.namespace().to_string(),
                install_id: collaborators.install_id.clone(),
                product: PRODUCT.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await
            .map_err(|e| ConnectError::categorized(ConnectErrorKind::TrafficManagerFailed, &e))?;
        collaborators
            .cache
            .save(
                &daemon_id,
                &SessionRecord {
                    daemon_id: daemon_id.encoded(),
                    session: session_ref.clone(),
                    client_id: client_id.clone(),
                },
            )
            .await
            .map_err(ConnectError::traffic_manager)?;
        Ok((manager, session_ref, client_id, daemon_id))
    }

    /// For internal use by extensions.
    pub fn set_self(&self, behavior: Arc<dyn SessionBehavior>) {
        *self.self_ref.write().unwrap() = Arc::downgrade(&behavior);
    }

    /// Run the session's services until expiry, failure or cancellation,
    /// then run the epilogue unconditionally.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut group = TaskGroup::new(self.cancel.clone());
        match self.self_ref.read().unwrap().upgrade() {
            Some(behavior) => behavior.start_services(&mut group),
            None => self.start_services(&mut group),
        }
        let result = group.wait().await;
        self.epilogue().await;
        result
    }

    async fn epilogue(&self) {
        let _ = self.root_daemon.disconnect().await;
        tracing::info!("-- session ended");
        self.done.cancel();
    }

    /// Request the session to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the epilogue has completed.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    pub fn manager(&self) -> &ManagerClient {
        &self.manager
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn install_id(&self) -> &str {
        &self.install_id
    }

    pub fn daemon_id(&self) -> &DaemonIdentifier {
        &self.daemon_id
    }

    pub fn session_ref(&self) -> &SessionRef {
        &self.session_ref
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn config_watcher(&self) -> &Arc<ConfigWatcher> {
        &self.config_watcher
    }

    /// Resolve a requested namespace against the mapped set. Empty resolves
    /// to the connected namespace; an unmapped namespace resolves to none.
    pub fn actual_namespace(&self, namespace: &str) -> Option<String> {
        let ns = if namespace.is_empty() {
            self.cluster.namespace()
        } else {
            namespace
        };
        let state = self.state.lock().unwrap();
        if state.mapped_namespaces.is_empty()
            || state.mapped_namespaces.iter().any(|m| m == ns)
        {
            Some(ns.to_string())
        } else {
            None
        }
    }

    /// The namespaces this session currently exposes.
    pub fn current_namespaces(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        if !state.mapped_namespaces.is_empty() {
            return state.mapped_namespaces.clone();
        }
        drop(state);
        let mut nss = self.view.namespaces();
        let connected = self.cluster.namespace().to_string();
        if !nss.contains(&connected) {
            nss.push(connected);
            nss.sort();
        }
        nss
    }

    /// Replace the mapped-namespace set. Retires watchers for namespaces no
    /// longer mapped and re-posts the DNS domains. False when unchanged.
    pub async fn set_mapped_namespaces(&self, mut namespaces: Vec<String>) -> bool {
        namespaces.sort();
        namespaces.dedup();
        {
            let mut state = self.state.lock().unwrap();
            if state.mapped_namespaces == namespaces {
                return false;
            }
            state.mapped_namespaces = namespaces.clone();
        }
        self.view.retain_namespaces(&namespaces);
        self.update_daemon_namespaces().await;
        true
    }

    /// Post the current namespace set plus the literal `svc` element to the
    /// root daemon's DNS resolver.
    async fn update_daemon_namespaces(&self) {
        post_daemon_domains(self.root_daemon.as_ref(), &self.current_namespaces()).await;
    }

    /// Start exactly one watcher per namespace that has none, then wait for
    /// every requested namespace to have delivered its initial sync.
    pub async fn ensure_watchers(&self, namespaces: &[String]) {
        tracing::debug!("ensure watchers {namespaces:?}");
        let mut pending = Vec::new();
        for ns in namespaces {
            let cancel = self.cancel.child_token();
            if !self.view.mark_watched(ns, cancel.clone()) {
                continue;
            }
            let (synced, rx) = FirstBatchSignal::pair();
            pending.push(rx);
            if self.manager.has_remote_workload_watch() {
                tokio::spawn(remote_workloads_watcher(
                    cancel,
                    self.manager.clone(),
                    self.session_ref.clone(),
                    ns.clone(),
                    self.view.clone(),
                    synced,
                ));
            } else {
                tokio::spawn(local_workloads_watcher(
                    cancel,
                    self.manager.clone(),
                    self.session_ref.clone(),
                    Arc::clone(&self.cluster),
                    ns.clone(),
                    self.view.clone(),
                    synced,
                ));
            }
            tracing::debug!("watcher for namespace {ns} started");
        }
        for rx in pending {
            let _ = rx.await;
        }
        tracing::debug!("watchers for {namespaces:?} synced");
    }

    /// Point-in-time list of workloads in the given namespaces, folded with
    /// the current intercepts, ingests and installed agents.
    pub async fn workload_info_snapshot(
        &self,
        namespaces: &[String],
        filter: SnapshotFilter,
    ) -> Vec<WorkloadInfo> {
        let mut nss: Vec<String> = Vec::new();
        for ns in namespaces {
            if let Some(actual) = self.actual_namespace(ns) {
                if !nss.contains(&actual) {
                    nss.push(actual);
                }
            }
        }
        if nss.is_empty() {
            tracing::debug!("no namespaces are mapped");
            return Vec::new();
        }
        self.ensure_watchers(&nss).await;

        let intercepts = self.registry.intercepts_by_agent(&nss);
        let ingests = self.registry.ingests_by_workload();
        let agent_versions = self.registry.agent_versions(&nss);
        collect_infos(
            &self.view,
            &nss,
            &intercepts,
            &ingests,
            &agent_versions,
            filter,
        )
    }

    /// Stream snapshots into the sink: one synchronously on subscription,
    /// then at most one per wake until the caller's token is cancelled.
    pub async fn watch_workloads(
        &self,
        cancel: CancellationToken,
        namespaces: Vec<String>,
        sink: mpsc::Sender<Vec<WorkloadInfo>>,
    ) {
        let mut subscription = self.view.subscribe();
        if sink
            .send(
                self.workload_info_snapshot(&namespaces, SnapshotFilter::EVERYTHING)
                    .await,
            )
            .await
            .is_err()
        {
            return;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                woken = subscription.woken() => {
                    if !woken {
                        return;
                    }
                    let snapshot = self
                        .workload_info_snapshot(&namespaces, SnapshotFilter::EVERYTHING)
                        .await;
                    if sink.send(snapshot).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Create an intercept and wait for the intercept watcher to deliver the
    /// matching entry.
    pub async fn add_intercept(
        &self,
        spec: InterceptSpec,
    ) -> Result<InterceptInfo, CategorizedError> {
        let name = spec.name.clone();
        let waiter = self.registry.wait_for_intercept(&name);
        let created = self
            .manager
            .api()
            .create_intercept(&self.session_ref, spec, self.manager.call_options())
            .await;
        if let Err(st) = created {
            self.registry.abandon_waiter(&name);
            return Err(if st.code() == Code::FailedPrecondition {
                CategorizedError::user(st.message().to_string())
            } else {
                CategorizedError::other(format!("manager.CreateIntercept: {st}"))
            });
        }
        match tokio::time::timeout(self.config.timeouts.traffic_manager_api(), waiter).await {
            Ok(Ok(info)) => Ok(info),
            _ => {
                self.registry.abandon_waiter(&name);
                Err(CategorizedError::other(format!(
                    "timed out waiting for intercept {name} to become active"
                )))
            }
        }
    }

    /// Remove an intercept by name, both locally and in the manager.
    pub async fn remove_intercept(&self, name: &str) -> Result<(), CategorizedError> {
        self.registry.remove_intercept_named(name);
        self.manager
            .remove_intercept(&self.session_ref, name)
            .await
            .map_err(|st| CategorizedError::other(format!("manager.RemoveIntercept: {st}")))
    }

    /// Establish an ingest forward for a workload container.
    pub async fn add_ingest(&self, key: IngestKey) -> Result<IngestInfo, CategorizedError> {
        let handle = self
            .forwarder
            .ingest(&key)
            .await
            .map_err(|e| CategorizedError::other(format!("{e:#}")))?;
        let ingest = Ingest {
            key: key.clone(),
            handle,
        };
        let info = ingest.response();
        if !self.registry.add_ingest(ingest) {
            return Err(CategorizedError::user(format!(
                "already ingesting {}/{} on port {}",
                key.workload, key.container, key.local_port
            )));
        }
        Ok(info)
    }

    pub fn remove_ingest(&self, key: &IngestKey) -> Result<IngestInfo, CategorizedError> {
        self.registry.remove_ingest(key).ok_or_else(|| {
            CategorizedError::user(format!(
                "not ingesting {}/{} on port {}",
                key.workload, key.container, key.local_port
            ))
        })
    }

    /// Drop every intercept and ingest owned by this session.
    pub async fn clear_ingests_and_intercepts(&self) {
        for intercept in self.registry.current_intercepts() {
            if let Err(st) = self
                .manager
                .remove_intercept(&self.session_ref, &intercept.spec.name)
                .await
            {
                tracing::error!(
                    "failed to remove intercept {}: {st}",
                    intercept.spec.name
                );
            }
        }
        self.registry.clear_all();
    }

    /// Uninstall traffic agents by clearing their entries in the agent
    /// config map. Done here rather than in the manager so RBAC can deny it
    /// per client.
    pub async fn uninstall(&self, request: UninstallRequest) -> Result<(), CategorizedError> {
        match request {
            UninstallRequest::NamedAgents { namespace, agents } => {
                self.uninstall_named(&namespace, &agents).await
            }
            UninstallRequest::AllAgents { namespace } => {
                self.clear_ingests_and_intercepts().await;
                match namespace {
                    Some(ns) => {
                        let ns = self.resolve_uninstall_namespace(&ns)?;
                        self.clear_agents_config_map(&ns).await
                    }
                    None => {
                        for ns in self.current_namespaces() {
                            self.clear_agents_config_map(&ns).await?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn resolve_uninstall_namespace(&self, namespace: &str) -> Result<String, CategorizedError> {
        self.actual_namespace(namespace).ok_or_else(|| {
            let shown = if namespace.is_empty() {
                self.cluster.namespace()
            } else {
                namespace
            };
            CategorizedError::user(format!("namespace {shown} is not mapped"))
        })
    }

    async fn uninstall_named(
        &self,
        namespace: &str,
        agents: &[String],
    ) -> Result<(), CategorizedError> {
        let namespace = self.resolve_uninstall_namespace(namespace)?;
        let data = self
            .cluster
            .get_config_map(&namespace, CONFIG_MAP_NAME)
            .await
            .map_err(|e| CategorizedError::other(e.to_string()))?;
        let Some(mut data) = data else {
            // No config map, no agents to remove.
            return Ok(());
        };

        let intercepts = self.registry.current_intercepts();
        let mut changed = false;
        for agent in agents {
            if let Some(intercept) = intercepts
                .iter()
                .find(|ic| ic.spec.namespace == namespace && ic.spec.agent == *agent)
            {
                let _ = self.remove_intercept(&intercept.spec.name).await;
            }
            // Names with no entry are silently accepted.
            if data.remove(agent).is_some() {
                changed = true;
            }
        }
        if changed {
            self.cluster
                .update_config_map(&namespace, CONFIG_MAP_NAME, Some(data))
                .await
                .map_err(|e| CategorizedError::other(e.to_string()))?;
        }
        Ok(())
    }

    async fn clear_agents_config_map(&self, namespace: &str) -> Result<(), CategorizedError> {
        let data = self
            .cluster
            .get_config_map(namespace, CONFIG_MAP_NAME)
            .await
            .map_err(|e| CategorizedError::other(e.to_string()))?;
        match data {
            Some(data) if !data.is_empty() => self
                .cluster
                .update_config_map(namespace, CONFIG_MAP_NAME, None)
                .await
                .map_err(|e| CategorizedError::other(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Re-validate an incoming connect against the running session.
    pub async fn update_status(&self, request: &ConnectRequest) -> ConnectInfo {
        if !self.is_pod_daemon && !self.parameters_equal(request) {
            return ConnectInfo {
                error: ConnectInfoError::MustRestart,
                cluster_context: self.cluster.context().to_string(),
                cluster_server: self.cluster.server().to_string(),
                cluster_id: self.cluster.cluster_id().to_string(),
                ..Default::default()
            };
        }

        let mut namespaces = request.requested_namespaces();
        if namespaces.is_empty() {
            namespaces = self.config.cluster.mapped_namespaces.clone();
        }
        if self.set_mapped_namespaces(namespaces).await {
            self.registry.set_ingress_info(None);
        }
        self.state.lock().unwrap().subnet_via_workloads = request.subnet_via_workloads.clone();
        self.status().await
    }

    /// Whether the request's environment and kube parameters match the ones
    /// this session was built with.
    fn parameters_equal(&self, request: &ConnectRequest) -> bool {
        let env_eq = request.environment.iter().all(|(k, v)| {
            match k.strip_prefix('-') {
                // Leading dash: the variable must be unset here.
                Some(name) => std::env::var_os(name).is_none(),
                None => std::env::var(k).map(|ov| ov == *v).unwrap_or(false),
            }
        });
        if !env_eq {
            return false;
        }
        if !request.kube_context.is_empty() && request.kube_context != self.cluster.context() {
            return false;
        }
        if !request.kube_server.is_empty() && request.kube_server != self.cluster.server() {
            return false;
        }
        request.kube_flags == self.kube_flags
    }

    /// Status as reported to a client that finds the daemon already
    /// connected.
    pub async fn status(&self) -> ConnectInfo {
        self.status_report(false).await
    }

    /// Status as reported by the connect that created the session.
    pub async fn initial_status(&self) -> ConnectInfo {
        self.status_report(true).await
    }

    async fn status_report(&self, initial: bool) -> ConnectInfo {
        let (subnets, mapped) = {
            let state = self.state.lock().unwrap();
            (
                state.subnet_via_workloads.clone(),
                !state.mapped_namespaces.is_empty(),
            )
        };
        let daemon_status = match self.root_daemon.status().await {
            Ok(status) => Some(status),
            Err(st) => {
                return ConnectInfo::from_error(&ConnectError::daemon(st.message().to_string()))
            }
        };
        ConnectInfo {
            error: if initial {
                ConnectInfoError::Unspecified
            } else {
                ConnectInfoError::AlreadyConnected
            },
            error_text: String::new(),
            error_category: Default::default(),
            cluster_context: self.cluster.context().to_string(),
            cluster_server: self.cluster.server().to_string(),
            cluster_id: self.cluster.cluster_id().to_string(),
            connection_name: self.daemon_id.name.clone(),
            namespace: self.cluster.namespace().to_string(),
            kube_flags: self.kube_flags.clone(),
            session: Some(self.session_ref.clone()),
            manager_namespace: self.manager_namespace.clone(),
            manager_name: self.manager.name().to_string(),
            manager_version: format!("v{}", self.manager.version()),
            intercepts: self.registry.current_intercepts(),
            ingests: self.registry.current_ingests(),
            subnet_via_workloads: subnets,
            mapped_namespaces: if mapped {
                Some(self.current_namespaces())
            } else {
                None
            },
            daemon_status,
        }
    }
}

#[async_trait]
impl SessionBehavior for Session {
    async fn remain(&self) -> Result<(), SessionError> {
        let bound = self.config.timeouts.traffic_manager_api();
        match tokio::time::timeout(bound, self.manager.remain(&self.session_ref)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(st)) if st.code() == Code::NotFound || st.code() == Code::Unavailable => {
                // The session has expired. The owner session must be
                // cancelled and reconnected.
                Err(SessionError::Expired)
            }
            Ok(Err(st)) => {
                tracing::error!("error calling Remain: {st}");
                Ok(())
            }
            Err(_) => {
                tracing::error!("error calling Remain: timed out after {bound:?}");
                Ok(())
            }
        }
    }

    fn start_services(&self, group: &mut TaskGroup) {
        let Some(behavior) = self.self_ref.read().unwrap().upgrade() else {
            tracing::error!("session self handle is gone, services not started");
            return;
        };
        let cancel = group.cancel_token();

        group.go(
            "remain",
            remain_loop(
                cancel.clone(),
                behavior,
                self.manager.clone(),
                self.session_ref.clone(),
                self.cache.clone(),
                self.daemon_id.clone(),
            ),
        );

        let manager = self.manager.clone();
        let session_ref = self.session_ref.clone();
        let registry = Arc::clone(&self.registry);
        let agents_cancel = cancel.clone();
        group.go("agents-watch", async move {
            watch_agents_loop(agents_cancel, manager, session_ref, registry).await;
            Ok(())
        });

        let manager = self.manager.clone();
        let session_ref = self.session_ref.clone();
        let registry = Arc::clone(&self.registry);
        let forwarder = Arc::clone(&self.forwarder);
        let client_id = self.client_id.clone();
        let intercepts_cancel = cancel.clone();
        group.go("intercept-port-forward", async move {
            watch_intercepts_loop(
                intercepts_cancel,
                manager,
                session_ref,
                registry,
                forwarder,
                client_id,
            )
            .await;
            Ok(())
        });

        let manager = self.manager.clone();
        let session_ref = self.session_ref.clone();
        let dialer = Arc::clone(&self.dialer);
        let dial_cancel = cancel.clone();
        group.go("dial-request-watch", async move {
            watch_dial_requests_loop(dial_cancel, manager, session_ref, dialer).await;
            Ok(())
        });

        let watcher = Arc::clone(&self.config_watcher);
        let cluster = Arc::clone(&self.cluster);
        group.go("config-watch", async move {
            watcher.run(cluster, cancel).await;
            Ok(())
        });
    }
}

/// Pre-check that the `traffic-manager` service exists before dialing it.
async fn check_traffic_manager_service(
    cluster: &dyn ClusterApi,
    namespace: &str,
) -> Result<(), CategorizedError> {
    tracing::debug!("checking that traffic-manager exists");
    match cluster.service_exists(namespace, "traffic-manager").await {
        Ok(true) => Ok(()),
        Ok(false) => Err(CategorizedError::user(format!(
            "traffic manager not found in namespace {namespace}, if it is not installed, \
             please run '{PRODUCT} helm install'. If it is installed, try connecting with a \
             --manager-namespace that points at the namespace it is installed in."
        ))),
        Err(e) => Err(CategorizedError::user(format!(
            "unable to get service traffic-manager in {namespace}: {e}"
        ))),
    }
}

/// Keep the registry's agent snapshot current.
async fn watch_agents_loop(
    cancel: CancellationToken,
    manager: ManagerClient,
    session: SessionRef,
    registry: Arc<InterceptRegistry>,
) {
    run_with_retry(&cancel.clone(), "agents-watch", move || {
        let cancel = cancel.clone();
        let manager = manager.clone();
        let session = session.clone();
        let registry = Arc::clone(&registry);
        async move {
            let mut stream = manager
                .api()
                .watch_agents(&session, manager.call_options())
                .await?;
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                match item {
                    None => anyhow::bail!("agent info stream closed"),
                    Some(Err(st)) => anyhow::bail!("agent info stream: {st}"),
                    Some(Ok(agents)) => registry.set_agents(agents),
                }
            }
        }
    })
    .await;
}

/// Track the manager's intercept snapshots, resolve waiters, and keep the
/// port-forwards in step with the active intercepts owned by this client.
async fn watch_intercepts_loop(
    cancel: CancellationToken,
    manager: ManagerClient,
    session: SessionRef,
    registry: Arc<InterceptRegistry>,
    forwarder: Arc<dyn PortForwarder>,
    client_id: String,
) {
    run_with_retry(&cancel.clone(), "intercept-port-forward", move || {
        let cancel = cancel.clone();
        let manager = manager.clone();
        let session = session.clone();
        let registry = Arc::clone(&registry);
        let forwarder = Arc::clone(&forwarder);
        let client_id = client_id.clone();
        async move {
            let mut stream = manager
                .api()
                .watch_intercepts(&session, manager.call_options())
                .await?;
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                let snapshot = match item {
                    None => anyhow::bail!("intercept info stream closed"),
                    Some(Err(st)) => anyhow::bail!("intercept info stream: {st}"),
                    Some(Ok(snapshot)) => snapshot,
                };
                let delta = registry.apply_intercept_snapshot(snapshot, &client_id);
                for (waiter, info) in delta.resolved {
                    let _ = waiter.send(info);
                }
                for info in delta.to_forward {
                    match forwarder.establish(&info).await {
                        Ok(handle) => registry.attach_forward(&info.id, handle),
                        Err(e) => tracing::error!(
                            "failed to establish port-forward for intercept {}: {e:#}",
                            info.spec.name
                        ),
                    }
                }
            }
        }
    })
    .await;
}

/// Hand cluster dial requests to the dialer collaborator.
async fn watch_dial_requests_loop(
    cancel: CancellationToken,
    manager: ManagerClient,
    session: SessionRef,
    dialer: Arc<dyn DialHandler>,
) {
    run_with_retry(&cancel.clone(), "dial-request-watch", move || {
        let cancel = cancel.clone();
        let manager = manager.clone();
        let session = session.clone();
        let dialer = Arc::clone(&dialer);
        async move {
            let mut stream = manager
                .api()
                .watch_dial_requests(&session, manager.call_options())
                .await?;
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                match item {
                    None => anyhow::bail!("dial request stream closed"),
                    Some(Err(st)) => anyhow::bail!("dial request stream: {st}"),
                    Some(Ok(request)) => {
                        if let Err(e) = dialer.handle(request).await {
                            tracing::error!("dial request failed: {e:#}");
                        }
                    }
                }
            }
        }
    })
    .await;
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
