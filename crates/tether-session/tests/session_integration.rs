//! Session integration tests
//!
//! Exercises connect, the workload view, session expiry, uninstall and the
//! root daemon handshake against in-memory collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use tether_core::cache::{SessionCache, SessionRecord};
use tether_core::config::ClientConfig;
use tether_core::error::{ConnectErrorKind, ErrorCategory, SessionError};
use tether_core::traits::cluster::LocalWorkloadEvent;
use tether_core::types::{DaemonIdentifier, SessionRef, WorkloadKind, WorkloadObject};
use tether_manager::api::{
    InterceptDisposition, InterceptInfo, InterceptSpec, RemoteState, RemoteWorkload,
    WorkloadEvent, WorkloadEventType,
};
use tether_session::connect::{Collaborators, ConnectInfoError, ConnectRequest};
use tether_session::forward::IngestKey;
use tether_session::session::{Session, UninstallRequest};
use tether_session::testing::{
    MockCluster, MockRootDaemon, RecordingDialer, RecordingForwarder, RecordingManagerApi,
    StaticManagerConnector, StaticRootConnector,
};
use tether_session::workloads::SnapshotFilter;

const MANAGER_NAMESPACE: &str = "ambassador";

struct Fixture {
    api: Arc<RecordingManagerApi>,
    cluster: Arc<MockCluster>,
    rootd: Arc<MockRootDaemon>,
    forwarder: Arc<RecordingForwarder>,
    dialer: Arc<RecordingDialer>,
    cache_dir: tempfile::TempDir,
}

impl Fixture {
    fn new(manager_version: &str) -> Self {
        let cluster = MockCluster::new("test-ctx", "default");
        cluster.add_service(MANAGER_NAMESPACE, "traffic-manager");
        Self {
            api: RecordingManagerApi::new(manager_version),
            cluster,
            rootd: MockRootDaemon::new(),
            forwarder: RecordingForwarder::new(),
            dialer: RecordingDialer::new(),
            cache_dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn cache(&self) -> SessionCache {
        SessionCache::with_dir(self.cache_dir.path())
    }

    fn daemon_id(&self) -> DaemonIdentifier {
        DaemonIdentifier::new("test", "test-ctx", "default", false)
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            cluster: self.cluster.clone(),
            manager_connector: Arc::new(StaticManagerConnector(self.api.clone())),
            root_daemon: Arc::new(StaticRootConnector(self.rootd.clone())),
            forwarder: self.forwarder.clone(),
            dialer: self.dialer.clone(),
            cache: self.cache(),
            install_id: "install-1".to_string(),
            local_config: ClientConfig::default(),
            auth_bridge: None,
        }
    }

    fn request(&self) -> ConnectRequest {
        ConnectRequest {
            name: "test".to_string(),
            manager_namespace: MANAGER_NAMESPACE.to_string(),
            ..Default::default()
        }
    }

    async fn connect(&self) -> Arc<Session> {
        Session::connect(self.request(), self.collaborators())
            .await
            .expect("connect")
    }
}

fn deployment_event(event_type: WorkloadEventType, name: &str, uid: &str) -> WorkloadEvent {
    WorkloadEvent {
        event_type,
        workload: RemoteWorkload {
            kind: WorkloadKind::Deployment,
            name: name.to_string(),
            uid: uid.to_string(),
            state: RemoteState::Available,
            agent_state: Default::default(),
            intercept_clients: vec![],
        },
    }
}

fn deployment_object(name: &str, uid: &str) -> WorkloadObject {
    WorkloadObject {
        kind: WorkloadKind::Deployment,
        name: name.to_string(),
        uid: uid.to_string(),
        desired_replicas: 1,
        ready_replicas: 1,
        updated_replicas: 1,
        failed: false,
    }
}

fn active_intercept(id: &str, name: &str, agent: &str, client: &str) -> InterceptInfo {
    InterceptInfo {
        id: id.to_string(),
        spec: InterceptSpec {
            name: name.to_string(),
            client: client.to_string(),
            agent: agent.to_string(),
            namespace: "default".to_string(),
            target_host: "127.0.0.1".to_string(),
            target_port: 8080,
            service_name: None,
        },
        disposition: InterceptDisposition::Active,
        message: String::new(),
    }
}

/// Poll a condition until it holds or a few seconds pass.
async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_happy_connect() {
    let fixture = Fixture::new("2.22.0");
    fixture.api.push_workloads(
        "default",
        vec![deployment_event(WorkloadEventType::Added, "web", "u1")],
    );

    let session = fixture.connect().await;

    let snapshot = session
        .workload_info_snapshot(&["default".to_string()], SnapshotFilter::EVERYTHING)
        .await;
    assert_eq!(snapshot.len(), 1);
    let info = &snapshot[0];
    assert_eq!(info.kind, "DEPLOYMENT");
    assert_eq!(info.name, "web");
    assert_eq!(info.namespace, "default");
    assert_eq!(info.uid, "u1");
    assert_eq!(info.not_interceptable_reason, "");

    // The DNS resolver learned the connected namespace plus "svc".
    assert_eq!(
        fixture.rootd.posted_domains(),
        vec![vec!["default".to_string(), "svc".to_string()]]
    );

    let initial = session.initial_status().await;
    assert_eq!(initial.error, ConnectInfoError::Unspecified);
    assert_eq!(initial.manager_name, "Traffic Manager");
    assert_eq!(initial.manager_version, "v2.22.0");

    // A second client finds the daemon already connected.
    let status = session.status().await;
    assert_eq!(status.error, ConnectInfoError::AlreadyConnected);
}

#[tokio::test]
async fn test_reuse_token_skips_arrive() {
    let fixture = Fixture::new("2.22.0");
    let id = fixture.daemon_id();
    fixture
        .cache()
        .save(
            &id,
            &SessionRecord {
                daemon_id: id.encoded(),
                session: SessionRef::new("sess-cached"),
                client_id: "cached@host".to_string(),
            },
        )
        .await
        .unwrap();

    let session = fixture.connect().await;

    assert_eq!(fixture.api.arrive_calls(), 0);
    assert!(fixture.api.remain_calls() >= 1);
    assert_eq!(session.client_id(), "cached@host");
    assert_eq!(session.session_ref().session_id, "sess-cached");
}

#[tokio::test]
async fn test_stale_token_causes_fresh_arrival() {
    let fixture = Fixture::new("2.22.0");
    let id = fixture.daemon_id();
    fixture
        .cache()
        .save(
            &id,
            &SessionRecord {
                daemon_id: id.encoded(),
                session: SessionRef::new("sess-stale"),
                client_id: "stale@host".to_string(),
            },
        )
        .await
        .unwrap();
    // The probe fails, so the token is discarded.
    fixture.api.script_remain([Some(Code::NotFound)]);

    let session = fixture.connect().await;

    assert_eq!(fixture.api.arrive_calls(), 1);
    assert_ne!(session.session_ref().session_id, "sess-stale");
    // The fresh identity was persisted.
    let record = fixture.cache().load(&id).await.unwrap().unwrap();
    assert_eq!(record.session, *session.session_ref());
}

#[tokio::test]
async fn test_arrive_failed_precondition_is_user_error() {
    let fixture = Fixture::new("2.22.0");
    fixture
        .api
        .fail_next_arrive(Code::FailedPrecondition, "client version is too old");

    let err = Session::connect(fixture.request(), fixture.collaborators())
        .await
        .err()
        .expect("connect must fail");
    assert_eq!(err.kind, ConnectErrorKind::TrafficManagerFailed);
    assert_eq!(err.category, ErrorCategory::User);
    assert_eq!(err.message, "client version is too old");
}

#[tokio::test]
async fn test_missing_traffic_manager_service() {
    let fixture = Fixture::new("2.22.0");
    // A fresh cluster without the traffic-manager service.
    let cluster = MockCluster::new("test-ctx", "default");
    let mut collaborators = fixture.collaborators();
    collaborators.cluster = cluster;

    let err = Session::connect(fixture.request(), collaborators)
        .await
        .err()
        .expect("connect must fail");
    assert_eq!(err.kind, ConnectErrorKind::TrafficManagerFailed);
    assert_eq!(err.category, ErrorCategory::User);
    assert!(err.message.contains("traffic manager not found"));
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_surfaces_and_departs() {
    let fixture = Fixture::new("2.22.0");
    let session = fixture.connect().await;
    // First tick is fine, the second one finds the session gone.
    fixture.api.script_remain([None, Some(Code::NotFound)]);

    let result = session.run().await;

    assert_eq!(result, Err(SessionError::Expired));
    assert_eq!(fixture.api.depart_calls(), 1);
    // Depart succeeded, so the cached identity is gone.
    assert_eq!(fixture.cache().load(&fixture.daemon_id()).await.unwrap(), None);
    // The root daemon was disconnected by the epilogue.
    assert_eq!(fixture.rootd.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_watcher_fallback_for_old_manager() {
    let fixture = Fixture::new("2.20.0");
    fixture
        .cluster
        .push_local_workloads("default", vec![LocalWorkloadEvent::Applied(deployment_object("web", "u1"))]);

    let session = fixture.connect().await;

    let snapshot = session
        .workload_info_snapshot(&["default".to_string()], SnapshotFilter::EVERYTHING)
        .await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "web");
    // The local informer path was taken.
    assert_eq!(fixture.api.workload_watch_calls(), 0);

    // A delete event removes the workload from the next snapshot.
    fixture
        .cluster
        .push_local_workloads("default", vec![LocalWorkloadEvent::Deleted(deployment_object("web", "u1"))]);
    let session2 = session.clone();
    wait_for("workload to disappear", move || {
        let session = session2.clone();
        async move {
            session
                .workload_info_snapshot(&["default".to_string()], SnapshotFilter::EVERYTHING)
                .await
                .is_empty()
        }
    })
    .await;
}

#[tokio::test]
async fn test_ensure_watchers_is_idempotent() {
    let fixture = Fixture::new("2.22.0");
    let session = fixture.connect().await;

    session.ensure_watchers(&["default".to_string()]).await;
    session.ensure_watchers(&["default".to_string()]).await;
    session
        .workload_info_snapshot(&["default".to_string()], SnapshotFilter::EVERYTHING)
        .await;

    assert_eq!(fixture.api.workload_watch_calls(), 1);
}

#[tokio::test]
async fn test_watch_workloads_streams_updates() {
    let fixture = Fixture::new("2.22.0");
    let session = fixture.connect().await;

    let cancel = CancellationToken::new();
    let (sink, mut rx) = mpsc::channel(8);
    let watcher_session = session.clone();
    let watcher_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        watcher_session
            .watch_workloads(watcher_cancel, vec!["default".to_string()], sink)
            .await;
    });

    // Initial snapshot arrives synchronously on subscription.
    let first = rx.recv().await.expect("initial snapshot");
    assert!(first.is_empty());

    fixture.api.push_workloads(
        "default",
        vec![deployment_event(WorkloadEventType::Added, "web", "u1")],
    );
    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("snapshot after wake")
            .expect("stream open");
        if snapshot.iter().any(|w| w.name == "web") {
            break;
        }
    }

    cancel.cancel();
    watcher.await.unwrap();
}

#[tokio::test]
async fn test_uninstall_named_agents() {
    let fixture = Fixture::new("2.22.0");
    let mut data = BTreeMap::new();
    for key in ["a", "b", "c"] {
        data.insert(key.to_string(), format!("config of {key}"));
    }
    fixture
        .cluster
        .set_config_map("default", "traffic-manager", data);

    let session = fixture.connect().await;
    let run_session = session.clone();
    let run = tokio::spawn(async move { run_session.run().await });

    // An intercept on agent b, delivered by the intercept watcher.
    fixture.api.push_intercepts(vec![active_intercept(
        "i1",
        "b-intercept",
        "b",
        session.client_id(),
    )]);
    let poll_session = session.clone();
    wait_for("intercept to land in the registry", move || {
        let session = poll_session.clone();
        async move { !session.status().await.intercepts.is_empty() }
    })
    .await;

    session
        .uninstall(UninstallRequest::NamedAgents {
            namespace: String::new(),
            agents: vec!["b".to_string(), "missing".to_string()],
        })
        .await
        .expect("uninstall");

    let remaining = fixture.cluster.config_map("default", "traffic-manager").unwrap();
    assert_eq!(
        remaining.keys().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "c".to_string()]
    );
    assert!(fixture
        .api
        .removed_intercepts()
        .contains(&"b-intercept".to_string()));

    session.stop();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_uninstall_all_agents() {
    let fixture = Fixture::new("2.22.0");
    let mut data = BTreeMap::new();
    data.insert("a".to_string(), "config of a".to_string());
    fixture
        .cluster
        .set_config_map("default", "traffic-manager", data);

    let session = fixture.connect().await;
    session
        .add_ingest(IngestKey {
            workload: "web".to_string(),
            container: "app".to_string(),
            local_port: 8080,
        })
        .await
        .expect("ingest");

    session
        .uninstall(UninstallRequest::AllAgents {
            namespace: Some("default".to_string()),
        })
        .await
        .expect("uninstall");

    let remaining = fixture.cluster.config_map("default", "traffic-manager").unwrap();
    assert!(remaining.is_empty());
    assert!(session.status().await.ingests.is_empty());
}

#[tokio::test]
async fn test_uninstall_unmapped_namespace_is_user_error() {
    let fixture = Fixture::new("2.22.0");
    let session = fixture.connect().await;
    session.set_mapped_namespaces(vec!["default".to_string()]).await;

    let err = session
        .uninstall(UninstallRequest::AllAgents {
            namespace: Some("elsewhere".to_string()),
        })
        .await
        .err()
        .expect("must fail");
    assert!(err.is_user());
    assert_eq!(err.message, "namespace elsewhere is not mapped");
}

#[tokio::test]
async fn test_root_session_mismatch_recovers_once() {
    let fixture = Fixture::new("2.22.0");
    fixture
        .rootd
        .script_connect_sessions(["stale-session".to_string()]);

    let _session = fixture.connect().await;

    assert_eq!(fixture.rootd.connect_calls(), 2);
    assert_eq!(fixture.rootd.disconnect_calls(), 1);
    assert_eq!(fixture.rootd.wait_calls(), 1);
}

#[tokio::test]
async fn test_root_session_mismatch_twice_is_fatal() {
    let fixture = Fixture::new("2.22.0");
    fixture
        .rootd
        .script_connect_sessions(["stale-1".to_string(), "stale-2".to_string()]);

    let err = Session::connect(fixture.request(), fixture.collaborators())
        .await
        .err()
        .expect("connect must fail");
    assert_eq!(err.kind, ConnectErrorKind::DaemonFailed);
    assert!(err.message.contains("unable to reconnect to root daemon"));
}

#[tokio::test]
async fn test_update_status_with_equal_parameters_remaps() {
    let fixture = Fixture::new("2.22.0");
    let session = fixture.connect().await;

    let mut request = fixture.request();
    request.mapped_namespaces = vec!["other".to_string()];
    let info = session.update_status(&request).await;

    assert_eq!(info.error, ConnectInfoError::AlreadyConnected);
    assert_eq!(info.mapped_namespaces, Some(vec!["other".to_string()]));
    // The DNS domains followed the namespace change.
    let domains = fixture.rootd.posted_domains();
    assert_eq!(
        domains.last().unwrap(),
        &vec!["other".to_string(), "svc".to_string()]
    );
}

#[tokio::test]
async fn test_update_status_detects_changed_parameters() {
    let fixture = Fixture::new("2.22.0");
    let session = fixture.connect().await;

    let mut request = fixture.request();
    request
        .kube_flags
        .insert("as-group".to_string(), "admins".to_string());
    let info = session.update_status(&request).await;
    assert_eq!(info.error, ConnectInfoError::MustRestart);
    assert_eq!(info.cluster_context, "test-ctx");
    assert!(!info.cluster_server.is_empty());

    // An environment key with a leading dash demands the variable be unset.
    let mut request = fixture.request();
    request
        .environment
        .insert("-PATH".to_string(), String::new());
    let info = session.update_status(&request).await;
    assert_eq!(info.error, ConnectInfoError::MustRestart);
}

#[tokio::test]
async fn test_filtered_snapshot_only_shows_intercepted() {
    let fixture = Fixture::new("2.22.0");
    fixture.api.push_workloads(
        "default",
        vec![
            deployment_event(WorkloadEventType::Added, "web", "u1"),
            deployment_event(WorkloadEventType::Added, "db", "u2"),
        ],
    );

    let session = fixture.connect().await;
    let run_session = session.clone();
    let run = tokio::spawn(async move { run_session.run().await });

    fixture.api.push_intercepts(vec![active_intercept(
        "i1",
        "web-intercept",
        "web",
        session.client_id(),
    )]);
    let poll_session = session.clone();
    wait_for("intercept to land in the registry", move || {
        let session = poll_session.clone();
        async move { !session.status().await.intercepts.is_empty() }
    })
    .await;

    let snapshot = session
        .workload_info_snapshot(&["default".to_string()], SnapshotFilter::INTERCEPTS)
        .await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "web");
    assert_eq!(snapshot[0].intercepts.len(), 1);

    // The intercept watcher also established the port-forward for it.
    let forwarder = fixture.forwarder.clone();
    wait_for("port-forward to be established", move || {
        let forwarder = forwarder.clone();
        async move { forwarder.established().contains(&"web-intercept".to_string()) }
    })
    .await;

    session.stop();
    run.await.unwrap().unwrap();
}
