use anyhow::Context;
use df_common::{EnvConfig, EventBus};
use df_dns::{
    AccessLogger, FilterState, ListenerManager, ReloadController, SystemInterfaces,
    UpstreamForwarder,
};
use df_policy::{MatchMode, PolicyLoader};
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dnsfilter=debug")),
        )
        .init();

    info!("DNS filter starting...");

    // Load environment config
    let env = EnvConfig::load(None);
    let match_mode: MatchMode = env
        .suffix_match
        .parse()
        .context("invalid DNSFILTER_SUFFIX_MATCH")?;
    let local_hostname = resolve_hostname(&env);
    info!("Policy file: {}", env.policy_file.display());
    info!("Local hostname for reverse lookups: {}", local_hostname);

    // ── Initial policy snapshot ────────────────────────────────────────

    let loader = PolicyLoader {
        policy_file: env.policy_file.clone(),
        manual_entries_file: env.manual_entries_file.clone(),
        lists_dir: env.lists_dir.clone(),
        local_hostname,
        match_mode,
    };
    let snapshot = loader.load().context("failed to load initial policy")?;

    // ── Resolution pipeline ────────────────────────────────────────────

    let upstream = UpstreamForwarder::new(
        &env.upstream_servers,
        Duration::from_millis(env.upstream_attempt_timeout_ms),
        Duration::from_millis(env.upstream_deadline_ms),
    );
    if upstream.servers().is_empty() {
        warn!("No usable upstream resolver in {:?}", env.upstream_servers);
    } else {
        info!("Upstream resolvers: {:?}", upstream.servers());
    }

    let logger = AccessLogger::to_file(&env.access_log_path);
    info!("Access log: {}", env.access_log_path.display());

    let state = Arc::new(FilterState::new(snapshot, upstream, logger, &env));

    // ── Listeners ──────────────────────────────────────────────────────

    let mut manager = ListenerManager::new(state, SystemInterfaces, &env);
    manager.start().await.context("failed to start listeners")?;

    // ── Reload control loop ────────────────────────────────────────────

    let events = Arc::new(EventBus::new());
    let controller = ReloadController::new(loader, manager, events.config_changed.subscribe());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_task = tokio::spawn(controller.run(shutdown_rx));

    let sighup_events = events.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_sighup(sighup_events).await {
            error!("SIGHUP handler failed, reloads by signal are disabled: {:#}", e);
        }
    });

    info!("DNS filter started (SIGHUP reloads the policy)");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_task.await {
        error!("Reload controller task failed: {}", e);
    }

    info!("DNS filter stopped");
    Ok(())
}

fn resolve_hostname(env: &EnvConfig) -> String {
    if let Some(name) = &env.hostname {
        return name.clone();
    }
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Failed to read system hostname: {}", e);
            "localhost".to_string()
        }
    }
}

/// Map SIGHUP onto a policy update event
async fn handle_sighup(events: Arc<EventBus>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading policy...");
            events.policy_updated();
        }
    }

    Ok(())
}
