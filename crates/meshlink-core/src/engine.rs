//! Forwarding engine
//!
//! Owns the long-lived tasks of the data plane and wires them around the
//! shared peer table: the supervisor-managed control session, the UDP peer
//! service, the inbound sink, the virtual-interface reader and the
//! public-IPv6 discoverer. The engine consumes session events and exposes
//! a read-only snapshot to the host.

use std::net::{Ipv4Addr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use meshlink_crypto::CryptoSuite;
use meshlink_net::{
    Cidr, P2pService, PeerEntry, PeerTable, SessionEvent, SessionState, SessionSupervisor,
    TunDevice,
};

use crate::config::Config;
use crate::dispatch::PacketDispatcher;
use crate::error::CoreResult;
use crate::ipv6::{Ipv6Discoverer, PublicIpv6Probe};
use crate::routes::RouteManager;
use crate::stats::{Stats, StatsSnapshot};

/// Consecutive virtual-interface read failures before the engine gives up
const MAX_TUN_READ_FAILURES: u32 = 5;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the inbound packet sink
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Read-only view of the engine for the host application
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub state: SessionState,
    /// Failure detail when the state carries one
    pub reason: Option<String>,
    pub stats: StatsSnapshot,
    /// Virtual IPv4 address assigned by the server
    pub virtual_ip: Option<Ipv4Addr>,
    pub peers: Vec<PeerSnapshot>,
}

/// Per-peer view, with the direct-path eligibility derived at read time
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub identity: String,
    pub private_ip: Option<Ipv4Addr>,
    pub cidrs: Vec<Cidr>,
    pub ipv6: String,
    pub udp_port: u16,
    pub last_remote_addr: Option<SocketAddrV6>,
    pub is_p2p: bool,
}

/// The client data plane
pub struct Engine {
    config: Config,
    peers: Arc<PeerTable>,
    stats: Arc<Stats>,
    tun: Arc<dyn TunDevice>,
    ipv6_probe: Arc<dyn PublicIpv6Probe>,

    supervisor: Arc<SessionSupervisor>,
    p2p: Arc<P2pService>,
    routes: Arc<RouteManager>,
    dispatcher: Arc<PacketDispatcher>,
    inbound_tx: mpsc::Sender<Vec<u8>>,

    state: Mutex<(SessionState, Option<String>)>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    discoverer: Mutex<Option<Arc<Ipv6Discoverer>>>,

    started: AtomicBool,
    tun_reader_started: AtomicBool,
    discovery_started: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate the configuration, bind the peer socket and assemble the
    /// components. Nothing runs until [`start`](Self::start).
    pub async fn new(
        config: Config,
        tun: Arc<dyn TunDevice>,
        ipv6_probe: Arc<dyn PublicIpv6Probe>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let crypto = Arc::new(CryptoSuite::from_config(&config.crypto_config)?);
        info!("crypto suite: {}", crypto.name());

        let peers = Arc::new(PeerTable::new(config.active_threshold));
        let stats = Arc::new(Stats::new());

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let p2p = P2pService::bind(
            config.p2p_config(),
            config.identity.clone(),
            crypto.clone(),
            peers.clone(),
            inbound_tx.clone(),
        )
        .await?;

        let supervisor = SessionSupervisor::new(
            config.session_config(),
            config.reconnect_delay,
            crypto,
            peers.clone(),
            event_tx,
        );

        let routes = Arc::new(RouteManager::new(tun.clone()));
        let dispatcher = Arc::new(PacketDispatcher::new(
            peers.clone(),
            p2p.clone(),
            supervisor.clone(),
            stats.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            peers,
            stats,
            tun,
            ipv6_probe,
            supervisor,
            p2p,
            routes,
            dispatcher,
            inbound_tx,
            state: Mutex::new((SessionState::Initialize, None)),
            event_rx: Mutex::new(Some(event_rx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            discoverer: Mutex::new(None),
            started: AtomicBool::new(false),
            tun_reader_started: AtomicBool::new(false),
            discovery_started: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start every long-lived task and the first connect attempt
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let event_rx = self.event_rx.lock().unwrap().take();
        let inbound_rx = self.inbound_rx.lock().unwrap().take();

        if let Some(rx) = inbound_rx {
            let engine = self.clone();
            self.spawn(async move { engine.inbound_loop(rx).await });
        }
        if let Some(rx) = event_rx {
            let engine = self.clone();
            self.spawn(async move { engine.event_loop(rx).await });
        }
        self.p2p.spawn_loops();

        self.set_state(SessionState::Connecting, None);
        self.supervisor.start().await;
        Ok(())
    }

    /// Idempotent shutdown; cascades through supervisor, session, peer
    /// service and every engine task.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("stopping engine");
        self.set_state(SessionState::Closed, None);

        self.supervisor.close().await;
        self.p2p.close();
        self.p2p.join().await;

        let discoverer = self.discoverer.lock().unwrap().take();
        if let Some(discoverer) = discoverer {
            discoverer.close();
            discoverer.join().await;
        }

        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Locally bound UDP port of the peer channel
    pub fn p2p_port(&self) -> u16 {
        self.p2p.local_port()
    }

    /// Point-in-time view of state, counters and the roster
    pub async fn snapshot(&self) -> EngineSnapshot {
        let (state, reason) = self.state.lock().unwrap().clone();
        let threshold = self.peers.active_threshold();

        let peers = self
            .peers
            .peers()
            .into_iter()
            .map(|entry| PeerSnapshot {
                is_p2p: entry.is_active(threshold)
                    && !entry.ipv6.is_empty()
                    && entry.udp_port > 0,
                identity: entry.identity,
                private_ip: entry.private_ip,
                cidrs: entry.cidrs,
                ipv6: entry.ipv6,
                udp_port: entry.udp_port,
                last_remote_addr: entry.last_remote_addr,
            })
            .collect();

        EngineSnapshot {
            state,
            reason,
            stats: self.stats.snapshot(),
            virtual_ip: self.routes.virtual_ip().await,
            peers,
        }
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: SessionState, reason: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if state.0 != next {
            match &reason {
                Some(reason) => info!("client state: {} -> {next} ({reason})", state.0),
                None => info!("client state: {} -> {next}", state.0),
            }
        }
        *state = (next, reason);
    }

    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        self.tasks.lock().unwrap().push(handle);
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<SessionEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };
            if self.is_closed() {
                return;
            }

            match event {
                SessionEvent::HandshakeReply(reply) => {
                    self.set_state(SessionState::Connected, None);
                    self.stats.mark_connected();

                    if let Err(e) = self
                        .routes
                        .set_base(&reply.private_ip, &reply.mask, &reply.gateway)
                        .await
                    {
                        warn!("unusable address assignment from server: {e}");
                    }

                    let entries: Vec<PeerEntry> = reply
                        .peer_details
                        .iter()
                        .map(PeerEntry::from_detail)
                        .collect();
                    self.peers.rewrite(entries);

                    self.sync_routes().await;
                    self.start_discovery_once();
                }
                SessionEvent::KeepAlive(keepalive) => {
                    let entries: Vec<PeerEntry> = keepalive
                        .peer_details
                        .iter()
                        .map(PeerEntry::from_detail)
                        .collect();
                    self.peers.upsert(entries);
                    self.sync_routes().await;
                }
                SessionEvent::Data(packet) => {
                    let _ = self.inbound_tx.send(packet).await;
                }
                SessionEvent::Closed { reason } => {
                    self.set_state(SessionState::Reconnect, Some(reason));
                    self.supervisor.schedule_reconnect();
                }
            }
        }
    }

    async fn sync_routes(self: &Arc<Self>) {
        self.routes.sync(self.peers.cidr_union()).await;
        // Forwarding starts once the interface has its first settings
        if self.routes.has_applied().await {
            self.start_tun_reader_once();
        }
    }

    fn start_tun_reader_once(self: &Arc<Self>) {
        if self.tun_reader_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting virtual interface reader");
        let engine = self.clone();
        self.spawn(async move { engine.tun_reader_loop().await });
    }

    fn start_discovery_once(self: &Arc<Self>) {
        if self.discovery_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let discoverer = Ipv6Discoverer::new(
            self.ipv6_probe.clone(),
            self.peers.clone(),
            self.config.ipv6_endpoints.clone(),
            self.config.ipv6_refresh,
            self.config.ipv6_probe_timeout,
        );
        discoverer.spawn();
        *self.discoverer.lock().unwrap() = Some(discoverer);
    }

    async fn tun_reader_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures = 0u32;
        loop {
            if self.is_closed() {
                return;
            }
            let read = tokio::select! {
                read = self.tun.read_packet() => read,
                _ = shutdown.changed() => return,
            };
            match read {
                Ok(packet) => {
                    failures = 0;
                    self.stats.record_rx(packet.len());
                    self.dispatcher.dispatch_outbound(&packet).await;
                }
                Err(e) => {
                    failures += 1;
                    warn!("virtual interface read failed: {e}");
                    if failures >= MAX_TUN_READ_FAILURES {
                        self.set_state(
                            SessionState::Error,
                            Some(format!("virtual interface unusable: {e}")),
                        );
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let packet = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };
            match self.tun.write_packet(&packet).await {
                Ok(()) => self.stats.record_tx(packet.len()),
                Err(e) => debug!("virtual interface write failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshlink_net::{NetResult, NetworkSettings};

    struct NullTun;

    #[async_trait]
    impl TunDevice for NullTun {
        async fn read_packet(&self) -> NetResult<Vec<u8>> {
            std::future::pending().await
        }

        async fn write_packet(&self, _packet: &[u8]) -> NetResult<()> {
            Ok(())
        }

        async fn apply_network_settings(&self, _settings: &NetworkSettings) -> NetResult<()> {
            Ok(())
        }
    }

    struct NullProbe;

    #[async_trait]
    impl PublicIpv6Probe for NullProbe {
        async fn fetch(&self, url: &str) -> CoreResult<String> {
            Err(crate::error::CoreError::Config(format!(
                "unreachable: {url}"
            )))
        }
    }

    fn config() -> Config {
        Config {
            server_address: "127.0.0.1".into(),
            server_port: 9, // nothing listens here
            identity: "c1".into(),
            p2p_port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = Engine::new(Config::default(), Arc::new(NullTun), Arc::new(NullProbe)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let engine = Engine::new(config(), Arc::new(NullTun), Arc::new(NullProbe))
            .await
            .unwrap();

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Initialize);
        assert!(snapshot.virtual_ip.is_none());
        assert!(snapshot.peers.is_empty());
        assert_eq!(snapshot.stats, StatsSnapshot::default());
        assert_ne!(engine.p2p_port(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = Engine::new(config(), Arc::new(NullTun), Arc::new(NullProbe))
            .await
            .unwrap();

        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.snapshot().await.state, SessionState::Closed);
    }
}
