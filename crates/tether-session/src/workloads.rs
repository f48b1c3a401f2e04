//! Namespace-partitioned workload view
//!
//! Watcher tasks write into the view; subscribers get woken through
//! single-slot signal channels and recompute their snapshot. Dropped wake
//! signals are fine: snapshots are idempotent and a later signal still wakes
//! the subscriber.

use std::collections::HashMap;
use std::ops::{BitAnd, BitOr};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::traits::cluster::{ClusterApi, LocalWorkloadEvent};
use tether_core::types::{SessionRef, WorkloadEntry, WorkloadKey, WorkloadState};
use tether_manager::api::{InterceptInfo, WorkloadEvent, WorkloadEventType};
use tether_manager::ManagerClient;

use crate::registry::IngestInfo;
use crate::tasks::run_with_retry;

/// Bit-set filter applied to workload snapshots. A zero filter means
/// "everything"; otherwise an entry is emitted iff it matches at least one
/// of the requested bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFilter(pub u32);

impl SnapshotFilter {
    pub const UNSPECIFIED: Self = Self(0);
    pub const INTERCEPTS: Self = Self(1);
    pub const INSTALLED_AGENTS: Self = Self(2);
    pub const INGESTS: Self = Self(4);
    pub const EVERYTHING: Self = Self(7);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SnapshotFilter {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for SnapshotFilter {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Workload entry as exported to list/watch callers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadInfo {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// Empty for available workloads, otherwise the state name.
    pub not_interceptable_reason: String,
    /// Version of the installed traffic agent, empty when none.
    pub agent_version: String,
    pub intercepts: Vec<InterceptInfo>,
    pub ingests: Vec<IngestInfo>,
}

struct ViewInner {
    /// namespace → workload key → entry. Every key is an element of the
    /// effective mapped-namespace set.
    namespaces: HashMap<String, HashMap<WorkloadKey, WorkloadEntry>>,
    /// Coalescing wake channels, capacity 1.
    subscribers: HashMap<Uuid, mpsc::Sender<()>>,
    /// One watcher per namespace; the token retires it.
    watchers: HashMap<String, CancellationToken>,
}

/// Shared, mutex-guarded workload state with subscriber fan-out. Cloning
/// yields another handle onto the same state.
#[derive(Clone)]
pub struct WorkloadView {
    inner: Arc<Mutex<ViewInner>>,
}

impl WorkloadView {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ViewInner {
                namespaces: HashMap::new(),
                subscribers: HashMap::new(),
                watchers: HashMap::new(),
            })),
        }
    }

    /// Register a wake channel. The caller recomputes a snapshot per wake.
    pub fn subscribe(&self) -> WorkloadSubscription {
        let (tx, rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().subscribers.insert(id, tx);
        WorkloadSubscription {
            id,
            rx,
            view: self.clone(),
        }
    }

    fn unsubscribe(&self, id: Uuid) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    /// Record a namespace as watched, handing back false when a watcher
    /// already runs for it.
    pub(crate) fn mark_watched(&self, namespace: &str, cancel: CancellationToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.watchers.contains_key(namespace) {
            return false;
        }
        inner.watchers.insert(namespace.to_string(), cancel);
        true
    }

    /// Retire every namespace not in the mapped set: cancel its watcher and
    /// drop its sub-map. An empty mapped set retires nothing.
    pub(crate) fn retain_namespaces(&self, mapped: &[String]) {
        if mapped.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .watchers
            .keys()
            .chain(inner.namespaces.keys())
            .filter(|ns| !mapped.iter().any(|m| m == *ns))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }
        for ns in &doomed {
            if let Some(cancel) = inner.watchers.remove(ns) {
                cancel.cancel();
            }
            inner.namespaces.remove(ns);
        }
        Self::wake_subscribers(&inner);
    }

    /// Namespaces currently represented in the view.
    pub fn namespaces(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut nss: Vec<String> = inner.namespaces.keys().cloned().collect();
        nss.sort();
        nss
    }

    /// Apply a batch from the manager's workload-event stream.
    pub(crate) fn apply_remote_batch(&self, namespace: &str, events: Vec<WorkloadEvent>) {
        let mut inner = self.inner.lock().unwrap();
        let workloads = inner.namespaces.entry(namespace.to_string()).or_default();
        for event in events {
            let w = event.workload;
            let key = WorkloadKey::new(w.kind, w.name);
            match event.event_type {
                WorkloadEventType::Deleted => {
                    tracing::debug!("deleting workload {key}.{namespace}");
                    workloads.remove(&key);
                }
                WorkloadEventType::Added | WorkloadEventType::Modified => {
                    tracing::debug!("adding workload {key}.{namespace}");
                    workloads.insert(
                        key,
                        WorkloadEntry {
                            uid: w.uid,
                            state: w.state.into(),
                            agent_state: w.agent_state,
                            intercept_clients: w.intercept_clients,
                        },
                    );
                }
            }
        }
        Self::wake_subscribers(&inner);
    }

    /// Apply a batch from a local informer. Agent state and intercepting
    /// clients are not known locally and stay zero.
    pub(crate) fn apply_local_batch(&self, namespace: &str, events: Vec<LocalWorkloadEvent>) {
        let mut inner = self.inner.lock().unwrap();
        let workloads = inner.namespaces.entry(namespace.to_string()).or_default();
        for event in events {
            match event {
                LocalWorkloadEvent::Deleted(obj) => {
                    workloads.remove(&WorkloadKey::new(obj.kind, obj.name));
                }
                LocalWorkloadEvent::Applied(obj) => {
                    let state = obj.state();
                    workloads.insert(
                        WorkloadKey::new(obj.kind, obj.name),
                        WorkloadEntry {
                            uid: obj.uid,
                            state,
                            ..Default::default()
                        },
                    );
                }
            }
        }
        Self::wake_subscribers(&inner);
    }

    /// Visit every entry of the listed namespaces under one lock
    /// acquisition, so a snapshot is consistent across namespaces.
    pub fn each_workload<F>(&self, namespaces: &[String], mut f: F)
    where
        F: FnMut(&WorkloadKey, &str, &WorkloadEntry),
    {
        let inner = self.inner.lock().unwrap();
        for ns in namespaces {
            if let Some(workloads) = inner.namespaces.get(ns) {
                for (key, entry) in workloads {
                    f(key, ns, entry);
                }
            }
        }
    }

    /// Non-blocking wake of every subscriber. A full channel means a wake is
    /// already pending, which is all the subscriber needs.
    fn wake_subscribers(inner: &ViewInner) {
        for tx in inner.subscribers.values() {
            let _ = tx.try_send(());
        }
    }
}

impl Default for WorkloadView {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered wake channel; unsubscribes on drop.
pub struct WorkloadSubscription {
    id: Uuid,
    rx: mpsc::Receiver<()>,
    view: WorkloadView,
}

impl WorkloadSubscription {
    /// Wait for the next wake. False when the view is gone.
    pub async fn woken(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

impl Drop for WorkloadSubscription {
    fn drop(&mut self) {
        self.view.unsubscribe(self.id);
    }
}

/// Fires the initial-sync waiter of `ensure_watchers` at most once.
#[derive(Clone)]
pub(crate) struct FirstBatchSignal(Arc<Mutex<Option<oneshot::Sender<()>>>>);

impl FirstBatchSignal {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    pub(crate) fn fire(&self) {
        if let Some(tx) = self.0.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// Remote watcher driver: the manager streams ready-made workload events.
pub(crate) async fn remote_workloads_watcher(
    cancel: CancellationToken,
    manager: ManagerClient,
    session: SessionRef,
    namespace: String,
    view: WorkloadView,
    synced: FirstBatchSignal,
) {
    run_with_retry(&cancel.clone(), "workloads-watcher", move || {
        let cancel = cancel.clone();
        let manager = manager.clone();
        let session = session.clone();
        let namespace = namespace.clone();
        let view = view.clone();
        let synced = synced.clone();
        async move {
            let mut stream = manager
                .api()
                .watch_workloads(&session, &namespace, manager.call_options())
                .await?;
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                match item {
                    None => anyhow::bail!("workload event stream for {namespace} closed"),
                    Some(Err(status)) => {
                        anyhow::bail!("workload event stream for {namespace}: {status}")
                    }
                    Some(Ok(events)) => {
                        view.apply_remote_batch(&namespace, events);
                        synced.fire();
                    }
                }
            }
        }
    })
    .await;
    tracing::debug!("workload watcher for namespace ended");
}

/// Local watcher driver for managers without workload-watch support: one
/// in-process informer per known kind, merged into a single event channel.
pub(crate) async fn local_workloads_watcher(
    cancel: CancellationToken,
    manager: ManagerClient,
    session: SessionRef,
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    view: WorkloadView,
    synced: FirstBatchSignal,
) {
    tracing::debug!(
        "watching workloads from client due to lack of workload watcher support in traffic-manager {}",
        manager.version()
    );
    let stop = cancel.child_token();
    run_with_retry(&stop.clone(), "local-workloads-watcher", move || {
        let stop = stop.clone();
        let manager = manager.clone();
        let session = session.clone();
        let cluster = Arc::clone(&cluster);
        let namespace = namespace.clone();
        let view = view.clone();
        let synced = synced.clone();
        async move {
            let kinds = manager
                .get_known_workload_kinds(&session)
                .await
                .map_err(|st| anyhow::anyhow!("failed to get known workload kinds: {st}"))?;
            let mut stream = cluster
                .watch_workloads(&namespace, &kinds)
                .await
                .map_err(|e| anyhow::anyhow!("informer for {namespace}: {e}"))?;
            loop {
                let item = tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                match item {
                    None => {
                        // Informer channel ended; this watcher is done.
                        tracing::debug!("client workload watcher ended");
                        stop.cancel();
                        return Ok(());
                    }
                    Some(events) => {
                        view.apply_local_batch(&namespace, events);
                        synced.fire();
                    }
                }
            }
        }
    })
    .await;
}

/// Fold registry state into the view's entries and apply the filter.
///
/// Results are keyed uniquely by `kind:name.namespace`, then sorted
/// ascending by name.
pub(crate) fn collect_infos(
    view: &WorkloadView,
    namespaces: &[String],
    intercepts: &HashMap<String, Vec<InterceptInfo>>,
    ingests: &HashMap<String, Vec<IngestInfo>>,
    agent_versions: &HashMap<String, String>,
    filter: SnapshotFilter,
) -> Vec<WorkloadInfo> {
    let mut by_key: HashMap<String, WorkloadInfo> = HashMap::new();
    view.each_workload(namespaces, |key, namespace, entry| {
        let mut info = WorkloadInfo {
            kind: key.kind.to_string(),
            name: key.name.clone(),
            namespace: namespace.to_string(),
            uid: entry.uid.clone(),
            not_interceptable_reason: String::new(),
            agent_version: String::new(),
            intercepts: Vec::new(),
            ingests: Vec::new(),
        };
        if entry.state != WorkloadState::Available {
            info.not_interceptable_reason = entry.state.name().to_string();
        }

        let mut filter_match = SnapshotFilter::EVERYTHING;
        match intercepts.get(&key.name) {
            Some(is) => info.intercepts = is.clone(),
            None => filter_match.0 &= !SnapshotFilter::INTERCEPTS.0,
        }
        match ingests.get(&key.name) {
            Some(gs) => info.ingests = gs.clone(),
            None => filter_match.0 &= !SnapshotFilter::INGESTS.0,
        }
        match agent_versions.get(&key.name) {
            Some(v) => info.agent_version = v.clone(),
            None => filter_match.0 &= !SnapshotFilter::INSTALLED_AGENTS.0,
        }
        if !filter.is_empty() && (filter & filter_match).is_empty() {
            return;
        }
        by_key.insert(format!("{}:{}.{}", info.kind, info.name, info.namespace), info);
    });
    let mut infos: Vec<WorkloadInfo> = by_key.into_values().collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    infos
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::types::WorkloadKind;
    use tether_manager::api::{RemoteState, RemoteWorkload};

    fn event(
        event_type: WorkloadEventType,
        name: &str,
        uid: &str,
        state: RemoteState,
    ) -> WorkloadEvent {
        WorkloadEvent {
            event_type,
            workload: RemoteWorkload {
                kind: WorkloadKind::Deployment,
                name: name.to_string(),
                uid: uid.to_string(),
                state,
                agent_state: Default::default(),
                intercept_clients: vec![],
            },
        }
    }

    fn snapshot_names(view: &WorkloadView, nss: &[String]) -> Vec<String> {
        collect_infos(
            view,
            nss,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            SnapshotFilter::EVERYTHING,
        )
        .into_iter()
        .map(|w| w.name)
        .collect()
    }

    #[test]
    fn test_upsert_and_delete() {
        let view = WorkloadView::new();
        let nss = vec!["default".to_string()];
        view.apply_remote_batch(
            "default",
            vec![event(WorkloadEventType::Added, "web", "u1", RemoteState::Available)],
        );
        assert_eq!(snapshot_names(&view, &nss), vec!["web"]);

        view.apply_remote_batch(
            "default",
            vec![event(WorkloadEventType::Deleted, "web", "u1", RemoteState::Available)],
        );
        assert!(snapshot_names(&view, &nss).is_empty());
    }

    #[test]
    fn test_not_interceptable_reason() {
        let view = WorkloadView::new();
        view.apply_remote_batch(
            "default",
            vec![
                event(WorkloadEventType::Added, "web", "u1", RemoteState::Available),
                event(WorkloadEventType::Added, "db", "u2", RemoteState::Progressing),
            ],
        );
        let infos = collect_infos(
            &view,
            &["default".to_string()],
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            SnapshotFilter::EVERYTHING,
        );
        let web = infos.iter().find(|w| w.name == "web").unwrap();
        assert_eq!(web.not_interceptable_reason, "");
        let db = infos.iter().find(|w| w.name == "db").unwrap();
        assert_eq!(db.not_interceptable_reason, "Progressing");
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let view = WorkloadView::new();
        view.apply_remote_batch(
            "default",
            vec![
                event(WorkloadEventType::Added, "zeta", "u1", RemoteState::Available),
                event(WorkloadEventType::Added, "alpha", "u2", RemoteState::Available),
                event(WorkloadEventType::Added, "mid", "u3", RemoteState::Available),
            ],
        );
        assert_eq!(
            snapshot_names(&view, &["default".to_string()]),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[test]
    fn test_filter_algebra() {
        let view = WorkloadView::new();
        view.apply_remote_batch(
            "default",
            vec![
                event(WorkloadEventType::Added, "web", "u1", RemoteState::Available),
                event(WorkloadEventType::Added, "db", "u2", RemoteState::Available),
            ],
        );
        let mut intercepts = HashMap::new();
        intercepts.insert("web".to_string(), vec![]);

        let nss = vec!["default".to_string()];
        let only_intercepted = collect_infos(
            &view,
            &nss,
            &intercepts,
            &HashMap::new(),
            &HashMap::new(),
            SnapshotFilter::INTERCEPTS,
        );
        assert_eq!(only_intercepted.len(), 1);
        assert_eq!(only_intercepted[0].name, "web");

        // Zero filter is treated as "all".
        let all = collect_infos(
            &view,
            &nss,
            &intercepts,
            &HashMap::new(),
            &HashMap::new(),
            SnapshotFilter::UNSPECIFIED,
        );
        assert_eq!(all.len(), 2);

        let everything = collect_infos(
            &view,
            &nss,
            &intercepts,
            &HashMap::new(),
            &HashMap::new(),
            SnapshotFilter::EVERYTHING,
        );
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_subscriber_woken_after_mutation() {
        let view = WorkloadView::new();
        let mut sub = view.subscribe();
        view.apply_remote_batch(
            "default",
            vec![event(WorkloadEventType::Added, "web", "u1", RemoteState::Available)],
        );
        assert!(sub.woken().await);
    }

    #[tokio::test]
    async fn test_wake_coalesces_without_blocking() {
        let view = WorkloadView::new();
        let mut sub = view.subscribe();
        // Two mutations before the subscriber reads: the second wake is
        // dropped on the full channel, which is the coalescing contract.
        for i in 0..2 {
            view.apply_remote_batch(
                "default",
                vec![event(
                    WorkloadEventType::Added,
                    &format!("w{i}"),
                    "u",
                    RemoteState::Available,
                )],
            );
        }
        assert!(sub.woken().await);
        // No second pending wake.
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn test_retain_namespaces() {
        let view = WorkloadView::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        assert!(view.mark_watched("alpha", a.clone()));
        assert!(view.mark_watched("beta", b.clone()));
        assert!(!view.mark_watched("alpha", CancellationToken::new()));

        view.apply_remote_batch(
            "alpha",
            vec![event(WorkloadEventType::Added, "web", "u1", RemoteState::Available)],
        );
        view.apply_remote_batch("beta", vec![]);

        view.retain_namespaces(&["alpha".to_string()]);
        assert!(!a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(view.namespaces(), vec!["alpha"]);

        // Empty mapped set retires nothing.
        view.retain_namespaces(&[]);
        assert_eq!(view.namespaces(), vec!["alpha"]);
    }
}
