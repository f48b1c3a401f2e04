//! Traffic-manager config map observer
//!
//! Watches the `traffic-manager` config map in the manager namespace with a
//! single-object watch. The API server will not keep the watch open forever;
//! when it terminates, the watch starts over until cancelled.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use tether_core::config::ClientConfig;
use tether_core::traits::cluster::{ClusterApi, ConfigMapEvent};

use crate::tasks::run_with_retry;

/// Name of the config map, and of the service the manager runs behind.
pub const CONFIG_MAP_NAME: &str = "traffic-manager";

const CLIENT_CONFIG_FILE: &str = "client.yaml";
const AGENT_ENV_FILE: &str = "agent-env.yaml";

/// Agent environment directives from `agent-env.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentEnv {
    #[serde(default)]
    pub excluded: Vec<String>,
}

#[derive(Default)]
struct ConfigState {
    client_config: Option<ClientConfig>,
    agent_env: AgentEnv,
}

/// Cached view of the manager's config map.
pub struct ConfigWatcher {
    namespace: String,
    state: RwLock<ConfigState>,
}

impl ConfigWatcher {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: RwLock::new(ConfigState::default()),
        }
    }

    /// Client configuration from the map's `client.yaml`, if present and
    /// well-formed.
    pub fn client_config(&self) -> Option<ClientConfig> {
        self.state.read().unwrap().client_config.clone()
    }

    pub fn agent_env(&self) -> AgentEnv {
        self.state.read().unwrap().agent_env.clone()
    }

    /// Run the watch until cancelled.
    pub async fn run(self: Arc<Self>, cluster: Arc<dyn ClusterApi>, cancel: CancellationToken) {
        tracing::info!("started watcher for config map {CONFIG_MAP_NAME}");
        let this = Arc::clone(&self);
        run_with_retry(&cancel.clone(), "config-map-watcher", move || {
            let this = Arc::clone(&this);
            let cluster = Arc::clone(&cluster);
            let cancel = cancel.clone();
            async move {
                let mut watch = cluster
                    .watch_config_map(&this.namespace, CONFIG_MAP_NAME)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!(
                            "unable to create config map watcher for {CONFIG_MAP_NAME}.{}: {e}",
                            this.namespace
                        )
                    })?;
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        event = watch.next() => event,
                    };
                    match event {
                        // Watch terminated, start over.
                        None => return Ok(()),
                        Some(ConfigMapEvent::Applied(data)) => this.refresh(&data),
                        Some(ConfigMapEvent::Deleted) => this.refresh(&BTreeMap::new()),
                    }
                }
            }
        })
        .await;
        tracing::info!("ended watcher for config map {CONFIG_MAP_NAME}");
    }

    fn refresh(&self, data: &BTreeMap<String, String>) {
        let mut state = self.state.write().unwrap();
        match data.get(CLIENT_CONFIG_FILE) {
            Some(yaml) => match serde_yaml::from_str::<ClientConfig>(yaml) {
                Ok(config) => {
                    tracing::debug!("refreshed client config");
                    state.client_config = Some(config);
                }
                Err(e) => {
                    tracing::error!("failed to unmarshal YAML from {CLIENT_CONFIG_FILE}: {e}");
                    state.client_config = None;
                }
            },
            None => {
                tracing::debug!("cleared client config");
                state.client_config = None;
            }
        }

        state.agent_env = AgentEnv::default();
        match data.get(AGENT_ENV_FILE) {
            Some(yaml) => match serde_yaml::from_str::<AgentEnv>(yaml) {
                Ok(env) => {
                    tracing::debug!("refreshed agent-env");
                    state.agent_env = env;
                }
                Err(e) => {
                    tracing::error!("failed to unmarshal YAML from {AGENT_ENV_FILE}: {e}");
                }
            },
            None => tracing::debug!("cleared agent-env"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_and_clear() {
        let watcher = ConfigWatcher::new("ambassador");
        let mut data = BTreeMap::new();
        data.insert(
            CLIENT_CONFIG_FILE.to_string(),
            "timeouts:\n  trafficManagerApi: 30\n".to_string(),
        );
        data.insert(
            AGENT_ENV_FILE.to_string(),
            "excluded:\n  - HOME\n  - PATH\n".to_string(),
        );
        watcher.refresh(&data);

        let cfg = watcher.client_config().unwrap();
        assert_eq!(
            cfg.timeouts.traffic_manager_api(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(watcher.agent_env().excluded, vec!["HOME", "PATH"]);

        watcher.refresh(&BTreeMap::new());
        assert!(watcher.client_config().is_none());
        assert!(watcher.agent_env().excluded.is_empty());
    }

    #[test]
    fn test_bad_yaml_clears_config() {
        let watcher = ConfigWatcher::new("ambassador");
        let mut data = BTreeMap::new();
        data.insert(CLIENT_CONFIG_FILE.to_string(), "{nope".to_string());
        watcher.refresh(&data);
        assert!(watcher.client_config().is_none());
    }
}
