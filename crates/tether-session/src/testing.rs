//! Mock collaborators for tests
//!
//! In-memory realizations of the manager, cluster and root-daemon seams
//! that record calls and let fixtures feed the watch streams.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Code, Status};

use tether_core::error::ClusterError;
use tether_core::traits::cluster::{
    ClusterApi, ConfigMapEvent, ConfigMapWatch, LocalWorkloadEvent, LocalWorkloadStream,
};
use tether_core::types::{SessionRef, WorkloadKind};
use tether_manager::api::{
    AgentInfo, AgentInfoStream, CallOptions, ClientConfigPayload, ClientInfo, DialRequest,
    DialRequestStream, InterceptDisposition, InterceptInfo, InterceptInfoStream, InterceptSpec,
    ManagerApi, VersionInfo, WorkloadEvent, WorkloadEventStream,
};

use crate::connect::{ManagerConnector, RootDaemonConnector};
use crate::forward::{DialHandler, IngestKey, PortForwardHandle, PortForwarder};
use crate::rootd::{DaemonStatus, NetworkConfig, OutboundConfig, RootDaemonApi};

type Feed<T> = Mutex<FeedState<T>>;

struct FeedState<T> {
    /// Items replayed to every new subscriber.
    backlog: Vec<T>,
    senders: Vec<mpsc::UnboundedSender<Result<T, Status>>>,
}

impl<T: Clone> FeedState<T> {
    fn new() -> Self {
        Self {
            backlog: Vec::new(),
            senders: Vec::new(),
        }
    }

    fn push(&mut self, item: T) {
        self.backlog.push(item.clone());
        self.senders.retain(|tx| tx.send(Ok(item.clone())).is_ok());
    }

    fn subscribe(&mut self, initial: Option<T>) -> mpsc::UnboundedReceiver<Result<T, Status>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = if self.backlog.is_empty() {
            initial.into_iter().collect()
        } else {
            self.backlog.clone()
        };
        for item in backlog {
            let _ = tx.send(Ok(item));
        }
        self.senders.push(tx);
        rx
    }
}

/// Scripted in-memory traffic manager.
pub struct RecordingManagerApi {
    version: Mutex<VersionInfo>,
    session_counter: AtomicU32,
    arrive_calls: AtomicU32,
    remain_calls: AtomicU32,
    depart_calls: AtomicU32,
    closed: AtomicBool,
    workload_watch_calls: AtomicU32,
    arrived: Mutex<Vec<ClientInfo>>,
    fail_arrive: Mutex<Option<(Code, String)>>,
    /// Scripted remain outcomes; when exhausted, `default_remain` applies.
    remain_script: Mutex<VecDeque<Option<Code>>>,
    default_remain: Mutex<Option<Code>>,
    client_config_yaml: Mutex<Option<Vec<u8>>>,
    known_kinds: Mutex<Option<Vec<WorkloadKind>>>,
    workloads: Mutex<HashMap<String, FeedState<Vec<WorkloadEvent>>>>,
    agents: Feed<Vec<AgentInfo>>,
    intercepts: Feed<Vec<InterceptInfo>>,
    dials: Feed<DialRequest>,
    created_intercepts: Mutex<Vec<InterceptSpec>>,
    removed_intercepts: Mutex<Vec<String>>,
}

impl RecordingManagerApi {
    pub fn new(version: &str) -> Arc<Self> {
        Arc::new(Self {
            version: Mutex::new(VersionInfo {
                name: "Traffic Manager".to_string(),
                version: format!("v{}", version.trim_start_matches('v')),
            }),
            session_counter: AtomicU32::new(0),
            arrive_calls: AtomicU32::new(0),
            remain_calls: AtomicU32::new(0),
            depart_calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            workload_watch_calls: AtomicU32::new(0),
            arrived: Mutex::new(Vec::new()),
            fail_arrive: Mutex::new(None),
            remain_script: Mutex::new(VecDeque::new()),
            default_remain: Mutex::new(None),
            client_config_yaml: Mutex::new(None),
            known_kinds: Mutex::new(Some(vec![
                WorkloadKind::Deployment,
                WorkloadKind::ReplicaSet,
                WorkloadKind::StatefulSet,
                WorkloadKind::Rollout,
            ])),
            workloads: Mutex::new(HashMap::new()),
            agents: Mutex::new(FeedState::new()),
            intercepts: Mutex::new(FeedState::new()),
            dials: Mutex::new(FeedState::new()),
            created_intercepts: Mutex::new(Vec::new()),
            removed_intercepts: Mutex::new(Vec::new()),
        })
    }

    pub fn arrive_calls(&self) -> u32 {
        self.arrive_calls.load(Ordering::SeqCst)
    }

    pub fn remain_calls(&self) -> u32 {
        self.remain_calls.load(Ordering::SeqCst)
    }

    pub fn depart_calls(&self) -> u32 {
        self.depart_calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of times a workload watch stream was opened.
    pub fn workload_watch_calls(&self) -> u32 {
        self.workload_watch_calls.load(Ordering::SeqCst)
    }

    pub fn arrived_clients(&self) -> Vec<ClientInfo> {
        self.arrived.lock().unwrap().clone()
    }

    pub fn removed_intercepts(&self) -> Vec<String> {
        self.removed_intercepts.lock().unwrap().clone()
    }

    /// Fail the next arrive call with the given status.
    pub fn fail_next_arrive(&self, code: Code, message: &str) {
        *self.fail_arrive.lock().unwrap() = Some((code, message.to_string()));
    }

    /// Script the outcome of the next remain calls; `None` means OK.
    pub fn script_remain(&self, outcomes: impl IntoIterator<Item = Option<Code>>) {
        self.remain_script.lock().unwrap().extend(outcomes);
    }

    /// Outcome applied to remain calls once the script is exhausted.
    pub fn set_default_remain(&self, code: Option<Code>) {
        *self.default_remain.lock().unwrap() = code;
    }

    pub fn set_client_config_yaml(&self, yaml: &str) {
        *self.client_config_yaml.lock().unwrap() = Some(yaml.as_bytes().to_vec());
    }

    /// `None` makes get-known-workload-kinds report `Unimplemented`.
    pub fn set_known_kinds(&self, kinds: Option<Vec<WorkloadKind>>) {
        *self.known_kinds.lock().unwrap() = kinds;
    }

    /// Feed a batch into the workload stream of a namespace. Batches are
    /// replayed to watchers arriving later.
    pub fn push_workloads(&self, namespace: &str, events: Vec<WorkloadEvent>) {
        self.workloads
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_insert_with(FeedState::new)
            .push(events);
    }

    pub fn push_agents(&self, agents: Vec<AgentInfo>) {
        self.agents.lock().unwrap().push(agents);
    }

    pub fn push_intercepts(&self, intercepts: Vec<InterceptInfo>) {
        self.intercepts.lock().unwrap().push(intercepts);
    }

    pub fn push_dial_request(&self, request: DialRequest) {
        self.dials.lock().unwrap().push(request);
    }
}

#[async_trait]
impl ManagerApi for RecordingManagerApi {
    async fn version_info(&self, _opts: &CallOptions) -> Result<VersionInfo, Status> {
        Ok(self.version.lock().unwrap().clone())
    }

    async fn arrive_as_client(
        &self,
        client: ClientInfo,
        _opts: &CallOptions,
    ) -> Result<SessionRef, Status> {
        self.arrive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((code, message)) = self.fail_arrive.lock().unwrap().take() {
            return Err(Status::new(code, message));
        }
        self.arrived.lock().unwrap().push(client);
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionRef::new(format!("sess-{n}")))
    }

    async fn remain(&self, _session: &SessionRef, _opts: &CallOptions) -> Result<(), Status> {
        self.remain_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.remain_script.lock().unwrap().pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => *self.default_remain.lock().unwrap(),
        };
        match outcome {
            None => Ok(()),
            Some(code) => Err(Status::new(code, "remain rejected")),
        }
    }

    async fn depart(&self, _session: &SessionRef, _opts: &CallOptions) -> Result<(), Status> {
        self.depart_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_client_config(
        &self,
        _opts: &CallOptions,
    ) -> Result<ClientConfigPayload, Status> {
        match self.client_config_yaml.lock().unwrap().clone() {
            Some(config_yaml) => Ok(ClientConfigPayload { config_yaml }),
            None => Err(Status::unimplemented("GetClientConfig")),
        }
    }

    async fn get_known_workload_kinds(
        &self,
        _session: &SessionRef,
        _opts: &CallOptions,
    ) -> Result<Vec<WorkloadKind>, Status> {
        match self.known_kinds.lock().unwrap().clone() {
            Some(kinds) => Ok(kinds),
            None => Err(Status::unimplemented("GetKnownWorkloadKinds")),
        }
    }

    async fn watch_workloads(
        &self,
        _session: &SessionRef,
        namespace: &str,
        _opts: &CallOptions,
    ) -> Result<WorkloadEventStream, Status> {
        self.workload_watch_calls.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .workloads
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_insert_with(FeedState::new)
            // An empty namespace still yields an initial sync batch.
            .subscribe(Some(Vec::new()));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn watch_agents(
        &self,
        _session: &SessionRef,
        _opts: &CallOptions,
    ) -> Result<AgentInfoStream, Status> {
        let rx = self.agents.lock().unwrap().subscribe(None);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn watch_intercepts(
        &self,
        _session: &SessionRef,
        _opts: &CallOptions,
    ) -> Result<InterceptInfoStream, Status> {
        let rx = self.intercepts.lock().unwrap().subscribe(Some(Vec::new()));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn watch_dial_requests(
        &self,
        _session: &SessionRef,
        _opts: &CallOptions,
    ) -> Result<DialRequestStream, Status> {
        let rx = self.dials.lock().unwrap().subscribe(None);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn create_intercept(
        &self,
        _session: &SessionRef,
        spec: InterceptSpec,
        _opts: &CallOptions,
    ) -> Result<InterceptInfo, Status> {
        let mut created = self.created_intercepts.lock().unwrap();
        created.push(spec.clone());
        Ok(InterceptInfo {
            id: format!("icept-{}", created.len()),
            spec,
            disposition: InterceptDisposition::Waiting,
            message: String::new(),
        })
    }

    async fn remove_intercept(
        &self,
        _session: &SessionRef,
        name: &str,
        _opts: &CallOptions,
    ) -> Result<(), Status> {
        self.removed_intercepts.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out an already-connected mock manager transport.
pub struct StaticManagerConnector(pub Arc<RecordingManagerApi>);

#[async_trait]
impl ManagerConnector for StaticManagerConnector {
    async fn connect(&self, _manager_namespace: &str) -> anyhow::Result<Arc<dyn ManagerApi>> {
        Ok(Arc::clone(&self.0) as Arc<dyn ManagerApi>)
    }
}

type LocalFeed = FeedState<Vec<LocalWorkloadEvent>>;

/// In-memory cluster: services, config maps and informer feeds.
pub struct MockCluster {
    context: String,
    server: String,
    namespace: String,
    cluster_id: String,
    services: Mutex<HashSet<(String, String)>>,
    config_maps: Mutex<HashMap<(String, String), BTreeMap<String, String>>>,
    config_map_watchers: Mutex<Vec<mpsc::UnboundedSender<ConfigMapEvent>>>,
    local_workloads: Mutex<HashMap<String, LocalFeed>>,
}

impl MockCluster {
    pub fn new(context: &str, namespace: &str) -> Arc<Self> {
        Arc::new(Self {
            context: context.to_string(),
            server: format!("https://{context}.test:6443"),
            namespace: namespace.to_string(),
            cluster_id: format!("{context}-cluster-id"),
            services: Mutex::new(HashSet::new()),
            config_maps: Mutex::new(HashMap::new()),
            config_map_watchers: Mutex::new(Vec::new()),
            local_workloads: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_service(&self, namespace: &str, name: &str) {
        self.services
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()));
    }

    pub fn set_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.config_maps
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data.clone());
        self.config_map_watchers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(ConfigMapEvent::Applied(data.clone())).is_ok());
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Feed a batch into the local informer stream of a namespace.
    pub fn push_local_workloads(&self, namespace: &str, events: Vec<LocalWorkloadEvent>) {
        self.local_workloads
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_insert_with(FeedState::new)
            .push(events);
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    fn context(&self) -> &str {
        &self.context
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .contains(&(namespace.to_string(), name.to_string())))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ClusterError> {
        Ok(self.config_map(namespace, name))
    }

    async fn update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: Option<BTreeMap<String, String>>,
    ) -> Result<(), ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        let mut maps = self.config_maps.lock().unwrap();
        if !maps.contains_key(&key) {
            return Err(ClusterError::NotFound(format!("configmap {name}.{namespace}")));
        }
        maps.insert(key, data.unwrap_or_default());
        Ok(())
    }

    async fn watch_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMapWatch, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(data) = self.config_map(namespace, name) {
            let _ = tx.send(ConfigMapEvent::Applied(data));
        }
        self.config_map_watchers.lock().unwrap().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn watch_workloads(
        &self,
        namespace: &str,
        _kinds: &[WorkloadKind],
    ) -> Result<LocalWorkloadStream, ClusterError> {
        let rx = self
            .local_workloads
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_insert_with(FeedState::new)
            .subscribe(Some(Vec::new()));
        let stream = UnboundedReceiverStream::new(rx);
        // The informer channel carries plain batches.
        Ok(Box::pin(futures::StreamExt::map(stream, |item| {
            item.unwrap_or_default()
        })))
    }
}

/// Scripted root daemon that records the handshake.
pub struct MockRootDaemon {
    /// Session ids reported by the next connect calls; when exhausted, the
    /// requested id is echoed (agreement).
    connect_script: Mutex<VecDeque<String>>,
    current_session: Mutex<Option<SessionRef>>,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    wait_calls: AtomicU32,
    domains: Mutex<Vec<Vec<String>>>,
}

impl MockRootDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_script: Mutex::new(VecDeque::new()),
            current_session: Mutex::new(None),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            wait_calls: AtomicU32::new(0),
            domains: Mutex::new(Vec::new()),
        })
    }

    /// Make the next connect calls report the given session ids.
    pub fn script_connect_sessions(&self, ids: impl IntoIterator<Item = String>) {
        self.connect_script.lock().unwrap().extend(ids);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn wait_calls(&self) -> u32 {
        self.wait_calls.load(Ordering::SeqCst)
    }

    /// Every domain set posted, in order.
    pub fn posted_domains(&self) -> Vec<Vec<String>> {
        self.domains.lock().unwrap().clone()
    }
}

#[async_trait]
impl RootDaemonApi for MockRootDaemon {
    async fn connect(&self, config: NetworkConfig) -> Result<DaemonStatus, Status> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let session_id = self
            .connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| config.session.session_id.clone());
        let session = SessionRef::new(session_id);
        *self.current_session.lock().unwrap() = Some(session.clone());
        Ok(DaemonStatus {
            outbound_config: Some(OutboundConfig {
                session: Some(session),
            }),
            version: "test".to_string(),
        })
    }

    async fn disconnect(&self) -> Result<(), Status> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        *self.current_session.lock().unwrap() = None;
        Ok(())
    }

    async fn wait_for_network(&self) -> Result<(), Status> {
        self.wait_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_dns_top_level_domains(&self, domains: Vec<String>) -> Result<(), Status> {
        self.domains.lock().unwrap().push(domains);
        Ok(())
    }

    async fn status(&self) -> Result<DaemonStatus, Status> {
        Ok(DaemonStatus {
            outbound_config: Some(OutboundConfig {
                session: self.current_session.lock().unwrap().clone(),
            }),
            version: "test".to_string(),
        })
    }
}

/// Hands out an already-running mock root daemon.
pub struct StaticRootConnector(pub Arc<MockRootDaemon>);

#[async_trait]
impl RootDaemonConnector for StaticRootConnector {
    async fn open(&self) -> anyhow::Result<Arc<dyn RootDaemonApi>> {
        Ok(Arc::clone(&self.0) as Arc<dyn RootDaemonApi>)
    }
}

/// Forwarder that only records what it was asked to establish.
pub struct RecordingForwarder {
    established: Mutex<Vec<String>>,
    ingested: Mutex<Vec<IngestKey>>,
}

impl RecordingForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            established: Mutex::new(Vec::new()),
            ingested: Mutex::new(Vec::new()),
        })
    }

    pub fn established(&self) -> Vec<String> {
        self.established.lock().unwrap().clone()
    }

    pub fn ingested(&self) -> Vec<IngestKey> {
        self.ingested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortForwarder for RecordingForwarder {
    async fn establish(&self, intercept: &InterceptInfo) -> anyhow::Result<PortForwardHandle> {
        self.established
            .lock()
            .unwrap()
            .push(intercept.spec.name.clone());
        Ok(PortForwardHandle::new(
            tokio_util::sync::CancellationToken::new(),
        ))
    }

    async fn ingest(&self, key: &IngestKey) -> anyhow::Result<PortForwardHandle> {
        self.ingested.lock().unwrap().push(key.clone());
        Ok(PortForwardHandle::new(
            tokio_util::sync::CancellationToken::new(),
        ))
    }
}

/// Dial handler that records the requests it saw.
pub struct RecordingDialer {
    requests: Mutex<Vec<DialRequest>>,
}

impl RecordingDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<DialRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialHandler for RecordingDialer {
    async fn handle(&self, request: DialRequest) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}
