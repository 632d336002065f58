use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use df_common::EnvConfig;
use df_policy::PolicySnapshot;

use crate::FilterState;
use crate::upstream::Upstream;

/// Interface operations the listener manager depends on.
pub trait InterfaceControl: Send + Sync + 'static {
    /// Address the listener binds to on `interface`
    fn address(&self, interface: &str) -> impl Future<Output = Result<IpAddr>> + Send;

    fn set_promiscuous(&self, interface: &str, enabled: bool) -> impl Future<Output = Result<()>> + Send;
}

/// Interface control through the `ip` command.
pub struct SystemInterfaces;

impl InterfaceControl for SystemInterfaces {
    async fn address(&self, interface: &str) -> Result<IpAddr> {
        let output = tokio::process::Command::new("ip")
            .args(["-4", "-o", "addr", "show", "dev", interface])
            .output()
            .await
            .context("failed to run ip addr")?;

        if !output.status.success() {
            anyhow::bail!(
                "ip addr show dev {} failed: {}",
                interface,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_inet_address(&stdout)
            .with_context(|| format!("no IPv4 address on interface {}", interface))
    }

    async fn set_promiscuous(&self, interface: &str, enabled: bool) -> Result<()> {
        let mode = if enabled { "on" } else { "off" };
        let output = tokio::process::Command::new("ip")
            .args(["link", "set", "dev", interface, "promisc", mode])
            .output()
            .await
            .context("failed to run ip link")?;

        if !output.status.success() {
            anyhow::bail!(
                "ip link set dev {} promisc {} failed: {}",
                interface,
                mode,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// First `inet` address in `ip -o addr` output.
fn parse_inet_address(output: &str) -> Option<IpAddr> {
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(addr_idx) = parts.iter().position(|&p| p == "inet") {
            if let Some(addr_cidr) = parts.get(addr_idx + 1) {
                let addr = addr_cidr.split('/').next().unwrap_or(addr_cidr);
                if let Ok(ip) = addr.parse() {
                    return Some(ip);
                }
            }
        }
    }
    None
}

struct Listener {
    interface: String,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Owns the per-interface sockets and their receive loops.
///
/// `start`, `stop` and `reconfigure` are the only mutators; all of them take
/// `&mut self`, so restarts are serialized by ownership.
pub struct ListenerManager<U, C = SystemInterfaces> {
    state: Arc<FilterState<U>>,
    interfaces: C,
    port: u16,
    grace: Duration,
    permits: Arc<Semaphore>,
    stop_tx: Option<watch::Sender<bool>>,
    listeners: Vec<Listener>,
}

impl<U: Upstream, C: InterfaceControl> ListenerManager<U, C> {
    pub fn new(state: Arc<FilterState<U>>, interfaces: C, env: &EnvConfig) -> Self {
        Self {
            state,
            interfaces,
            port: env.listen_port,
            grace: Duration::from_millis(env.grace_ms),
            permits: Arc::new(Semaphore::new(env.max_inflight.max(1))),
            stop_tx: None,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> &Arc<FilterState<U>> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Bound address of every running listener
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    /// Open one listener per interface of the active snapshot.
    ///
    /// An interface that cannot be set up is logged and skipped; only failing
    /// to bind every configured interface is an error.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Listeners already running, start ignored");
            return Ok(());
        }

        let snapshot = self.state.snapshot();
        if !snapshot.enabled() {
            info!("DNS filter disabled, no listeners started");
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        for interface in snapshot.interfaces() {
            match self.open(interface, stop_rx.clone()).await {
                Ok(listener) => {
                    info!("DNS filter listening on {} ({})", listener.local_addr, interface);
                    self.listeners.push(listener);
                }
                Err(e) => error!("Skipping interface {}: {:#}", interface, e),
            }
        }

        self.stop_tx = Some(stop_tx);

        if self.listeners.is_empty() && !snapshot.interfaces().is_empty() {
            anyhow::bail!(
                "no listener could be opened on {}",
                snapshot.interfaces().join(", ")
            );
        }
        Ok(())
    }

    async fn open(&self, interface: &str, stop: watch::Receiver<bool>) -> Result<Listener> {
        let ip = self.interfaces.address(interface).await?;

        if let Err(e) = self.interfaces.set_promiscuous(interface, true).await {
            warn!("Could not enable promiscuous mode on {}: {:#}", interface, e);
        }

        let socket = match bind_socket(interface, SocketAddr::new(ip, self.port)) {
            Ok(s) => s,
            Err(e) => {
                self.clear_promiscuous(interface).await;
                return Err(e);
            }
        };
        let local_addr = socket.local_addr()?;

        let task = tokio::spawn(run_listener(
            socket,
            interface.to_string(),
            self.state.clone(),
            self.permits.clone(),
            stop,
            self.grace,
        ));

        Ok(Listener {
            interface: interface.to_string(),
            local_addr,
            task,
        })
    }

    /// Stop accepting datagrams, drain in-flight tasks, close the sockets and
    /// clear promiscuous mode. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }

        for listener in std::mem::take(&mut self.listeners) {
            if let Err(e) = listener.task.await {
                error!("Listener task on {} failed: {}", listener.interface, e);
            }
            self.clear_promiscuous(&listener.interface).await;
            info!("Listener on {} ({}) closed", listener.local_addr, listener.interface);
        }
    }

    /// Apply a new snapshot: stop, clear caches, publish, start again.
    pub async fn reconfigure(&mut self, snapshot: PolicySnapshot) -> Result<()> {
        self.stop().await;
        self.state.clear_caches().await;
        self.state.publish(snapshot);
        self.start().await
    }

    async fn clear_promiscuous(&self, interface: &str) {
        if let Err(e) = self.interfaces.set_promiscuous(interface, false).await {
            warn!("Could not clear promiscuous mode on {}: {:#}", interface, e);
        }
    }
}

fn bind_socket(interface: &str, addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // Needs CAP_NET_RAW; the address bind alone is enough without it
    #[cfg(target_os = "linux")]
    if let Err(e) = socket.bind_device(Some(interface.as_bytes())) {
        debug!("SO_BINDTODEVICE {} not applied: {}", interface, e);
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {} on {}", addr, interface))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Receive loop of one interface. Each datagram is resolved in its own task,
/// bounded by the shared semaphore.
async fn run_listener<U: Upstream>(
    socket: UdpSocket,
    interface: String,
    state: Arc<FilterState<U>>,
    permits: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
) {
    let socket = Arc::new(socket);
    let mut tasks = JoinSet::new();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("Resolution task on {} failed: {}", interface, e);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("UDP recv error on {}: {}", interface, e);
                        continue;
                    }
                };

                // A stop while every permit is taken drops this datagram
                let permit = tokio::select! {
                    _ = stop.changed() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let datagram = buf[..len].to_vec();
                let socket = socket.clone();
                let state = state.clone();

                tasks.spawn(async move {
                    let _permit = permit;
                    if let Some(reply) = state.handle(&datagram, src).await {
                        if let Err(e) = socket.send_to(&reply, src).await {
                            debug!("Failed to send reply to {}: {}", src, e);
                        }
                    }
                });
            }
        }
    }

    // Drain: in-flight queries get the grace period, then are left to finish on their own
    let deadline = Instant::now() + grace;
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Err(e))) => error!("Resolution task on {} failed: {}", interface, e),
            Ok(Some(Ok(()))) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "{} resolution task(s) on {} still running after {:?}, detaching",
                    tasks.len(),
                    interface,
                    grace
                );
                // Cache inserts from these tasks are discarded once the caches are cleared
                tasks.detach_all();
                break;
            }
        }
    }
}
