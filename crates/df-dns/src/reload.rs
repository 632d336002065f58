use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use df_common::ConfigChangeEvent;
use df_policy::{PolicyLoader, PolicySnapshot};

use crate::listener::{InterfaceControl, ListenerManager};
use crate::upstream::Upstream;

/// Single control loop turning policy-change events into listener restarts.
pub struct ReloadController<U, C> {
    loader: PolicyLoader,
    manager: ListenerManager<U, C>,
    events: broadcast::Receiver<ConfigChangeEvent>,
}

impl<U: Upstream, C: InterfaceControl> ReloadController<U, C> {
    pub fn new(
        loader: PolicyLoader,
        manager: ListenerManager<U, C>,
        events: broadcast::Receiver<ConfigChangeEvent>,
    ) -> Self {
        Self {
            loader,
            manager,
            events,
        }
    }

    pub fn manager(&self) -> &ListenerManager<U, C> {
        &self.manager
    }

    /// Process events until `shutdown` flips or the bus closes, then stop
    /// every listener.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = self.events.recv() => match event {
                    Ok(ConfigChangeEvent::Policy) => {
                        info!("Policy update received, reloading");
                        self.reload_logged().await;
                    }
                    // Missed events all mean "reload"; one reload covers them
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Reload controller lagged by {} events", n);
                        self.reload_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Reload controller stopping listeners");
        self.manager.stop().await;
    }

    async fn reload_logged(&mut self) {
        if let Err(e) = self.reload().await {
            error!("Policy reload failed: {:#}", e);
        }
    }

    /// Build a new snapshot and apply it. A snapshot that fails to build is
    /// rejected and the running listeners keep serving the current one.
    pub async fn reload(&mut self) -> Result<()> {
        let snapshot = self.load().await.context("new policy rejected, keeping current policy")?;
        self.manager
            .reconfigure(snapshot)
            .await
            .context("listener restart failed")
    }

    async fn load(&self) -> Result<PolicySnapshot> {
        let loader = self.loader.clone();
        let snapshot = tokio::task::spawn_blocking(move || loader.load()).await??;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;
    use df_common::{EnvConfig, EventBus};
    use crate::testing::{StubUpstream, loader, state_with, write_policy};

    struct Loopback;

    impl InterfaceControl for Loopback {
        async fn address(&self, _interface: &str) -> Result<IpAddr> {
            Ok(IpAddr::from([127, 0, 0, 1]))
        }

        async fn set_promiscuous(&self, _interface: &str, _enabled: bool) -> Result<()> {
            Ok(())
        }
    }

    fn policy(blocked: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "groups": { "default": [] },
            "acl_sites": { "default": blocked },
            "start": true,
            "interfaces": ["lo"]
        })
    }

    fn controller(dir: &std::path::Path, bus: &EventBus) -> ReloadController<StubUpstream, Loopback> {
        write_policy(dir, &policy(&[]), &serde_json::json!({ "entries": {} }));
        let loader = loader(dir);
        let state = Arc::new(state_with(&loader, StubUpstream::default()));
        let env = EnvConfig {
            listen_port: 0,
            grace_ms: 100,
            ..EnvConfig::default()
        };
        let manager = ListenerManager::new(state, Loopback, &env);
        ReloadController::new(loader, manager, bus.config_changed.subscribe())
    }

    #[tokio::test]
    async fn test_reload_publishes_new_snapshot_and_clears_caches() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut controller = controller(dir.path(), &bus);
        controller.manager.start().await.unwrap();

        let state = controller.manager().state().clone();
        state.cache.a.insert("example.com".to_string(), [1, 2, 3, 4].into()).await;
        assert!(!state.snapshot().is_blocked("default", "example.com."));

        write_policy(dir.path(), &policy(&["example.com"]), &serde_json::json!({ "entries": {} }));
        controller.reload().await.unwrap();

        assert!(state.snapshot().is_blocked("default", "example.com."));
        assert_eq!(state.cache.a.len().await, 0);
        assert!(controller.manager().is_running());
        controller.manager.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_policy_keeps_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut controller = controller(dir.path(), &bus);
        controller.manager.start().await.unwrap();
        let addrs = controller.manager().local_addrs();

        std::fs::write(dir.path().join("dns_config.json"), "{ not json").unwrap();
        assert!(controller.reload().await.is_err());

        assert_eq!(controller.manager().local_addrs(), addrs);
        controller.manager.stop().await;
    }

    #[tokio::test]
    async fn test_run_loop_reloads_on_event_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let controller = controller(dir.path(), &bus);
        let state = controller.manager().state().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(shutdown_rx));

        write_policy(dir.path(), &policy(&["example.com"]), &serde_json::json!({ "entries": {} }));
        bus.policy_updated();

        let mut reloaded = false;
        for _ in 0..100 {
            if state.snapshot().is_blocked("default", "example.com.") {
                reloaded = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reloaded);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
