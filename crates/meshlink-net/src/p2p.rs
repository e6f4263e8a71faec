//! UDP/IPv6 peer-to-peer service
//!
//! One non-blocking socket carries both directions: the probe loop
//! advertises our reachability to every peer with a usable endpoint, and
//! the receive loop decodes incoming datagrams. A received probe proves
//! the *sender* reachable for us; our own probes do the same for the far
//! end. Data frames go straight to the shared inbound sink.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use meshlink_crypto::CryptoSuite;

use crate::codec;
use crate::error::NetResult;
use crate::frame::Frame;
use crate::payload::Probe;
use crate::peers::{PeerEntry, PeerTable};

/// Default UDP port of the peer channel
pub const DEFAULT_P2P_PORT: u16 = 51820;

/// Largest datagram the receive loop accepts
const MAX_DATAGRAM: usize = 65536;

/// Peer-channel parameters
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Local bind port; 0 picks an ephemeral port
    pub port: u16,
    /// Interval of the reachability probe loop
    pub probe_interval: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_P2P_PORT,
            probe_interval: Duration::from_secs(10),
        }
    }
}

/// UDP peer channel: probe loop, receive loop and the direct send path
pub struct P2pService {
    socket: Arc<UdpSocket>,
    local_port: u16,
    identity: String,
    crypto: Arc<CryptoSuite>,
    peers: Arc<PeerTable>,
    inbound: mpsc::Sender<Vec<u8>>,
    probe_interval: Duration,

    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl P2pService {
    /// Bind the peer socket and record the bound port in the
    /// self-advertisement.
    pub async fn bind(
        config: P2pConfig,
        identity: String,
        crypto: Arc<CryptoSuite>,
        peers: Arc<PeerTable>,
        inbound: mpsc::Sender<Vec<u8>>,
    ) -> NetResult<Arc<Self>> {
        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.port, 0, 0);
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_port = socket.local_addr()?.port();
        peers.set_self_udp_port(local_port);
        info!("p2p service listening on [::]:{local_port}");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_port,
            identity,
            crypto,
            peers,
            inbound,
            probe_interval: config.probe_interval,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Locally bound UDP port
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Start the receive and probe loops
    pub fn spawn_loops(self: &Arc<Self>) {
        let service = self.clone();
        self.spawn(async move { service.recv_loop().await });
        let service = self.clone();
        self.spawn(async move { service.probe_loop().await });
    }

    /// Signal both loops to exit at their next wake
    pub fn close(&self) {
        let _ = self.shutdown.send_replace(true);
    }

    /// Await loop exit after [`close`](Self::close)
    pub async fn join(&self) {
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Attempt direct delivery of one IP packet.
    ///
    /// Returns false without sending unless the direct path is proved
    /// alive: `last_rx` set and within the active threshold, and the peer
    /// advertises a usable IPv6 endpoint. Returns true once the datagram
    /// is handed to the kernel.
    pub async fn send_packet(&self, packet: &[u8], peer: &PeerEntry) -> bool {
        let Some(last_rx) = peer.last_rx else {
            return false;
        };
        if last_rx.elapsed() > self.peers.active_threshold() {
            return false;
        }
        let Some(addr) = peer.p2p_addr() else {
            return false;
        };

        let encoded = match codec::encode(&Frame::Data(packet.to_vec()), &self.crypto) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed to encode data frame: {e}");
                return false;
            }
        };

        match self.socket.send_to(&encoded, SocketAddr::V6(addr)).await {
            Ok(_) => true,
            Err(e) => {
                debug!("p2p send to {} at {addr} failed: {e}", peer.identity);
                false
            }
        }
    }

    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        self.tasks.lock().unwrap().push(handle);
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if self.is_closed() {
                return;
            }
            let (len, src) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        if self.is_closed() {
                            return;
                        }
                        warn!("udp recv error: {e}");
                        continue;
                    }
                },
                _ = shutdown.changed() => return,
            };

            // Per-datagram failures never stop the service
            match codec::decode(&buf[..len], &self.crypto) {
                Ok((frame, _)) => self.handle_datagram(frame, src).await,
                Err(e) => debug!("dropping malformed datagram from {src}: {e}"),
            }
        }
    }

    async fn handle_datagram(&self, frame: Frame, src: SocketAddr) {
        match frame {
            Frame::ProbeIpv6(Probe { identity }) => {
                let src = to_socket_addr_v6(src);
                trace!("probe from {identity} at {src}");
                self.peers.on_probe_received(&identity, src);
            }
            Frame::Data(packet) => {
                let _ = self.inbound.send(packet).await;
            }
            other => {
                trace!("ignoring {:?} datagram from {src}", other.kind());
            }
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_closed() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.probe_interval) => {}
                _ = shutdown.changed() => return,
            }

            let frame = Frame::ProbeIpv6(Probe {
                identity: self.identity.clone(),
            });
            let encoded = match codec::encode(&frame, &self.crypto) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("failed to encode probe: {e}");
                    continue;
                }
            };

            for peer in self.peers.peers() {
                let Some(addr) = peer.p2p_addr() else {
                    continue;
                };
                if let Err(e) = self.socket.send_to(&encoded, SocketAddr::V6(addr)).await {
                    debug!("probe to {} at {addr} failed: {e}", peer.identity);
                }
            }
        }
    }
}

/// Normalize a datagram source to IPv6 (the dual-stack socket may report
/// IPv4-mapped sources as plain IPv4)
fn to_socket_addr_v6(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V6(v6) => v6,
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
    }
}
