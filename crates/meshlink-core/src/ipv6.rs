//! Public-IPv6 discovery
//!
//! Keeps the self-advertised IPv6 address fresh so keepalives carry a
//! reachable endpoint. The HTTP fetch itself lives behind the
//! [`PublicIpv6Probe`] capability; the host wires in a real client. Every
//! failure here is soft: the advertisement keeps its last value (or stays
//! empty) and the next cycle retries.

use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use meshlink_net::net::parse_ipv6;
use meshlink_net::PeerTable;

use crate::error::CoreResult;

/// Default discovery endpoints, tried in order each cycle
pub const DEFAULT_IPV6_ENDPOINTS: [&str; 3] = [
    "https://api6.ipify.org",
    "https://ipv6.icanhazip.com",
    "https://v6.ident.me",
];

/// Capability for fetching one discovery endpoint.
///
/// Implementations live outside the core; responses are plain text bodies
/// containing an address.
#[async_trait]
pub trait PublicIpv6Probe: Send + Sync {
    async fn fetch(&self, url: &str) -> CoreResult<String>;
}

/// Validate a discovery response body as a usable public IPv6 address.
///
/// Rejects bodies without a colon, link-local addresses and loopback.
/// Returns the canonical textual form.
pub fn validate_public_ipv6(body: &str) -> Option<String> {
    let body = body.trim();
    if !body.contains(':') {
        return None;
    }
    let addr = parse_ipv6(body).ok()?;
    if is_link_local(&addr) || addr == Ipv6Addr::LOCALHOST {
        return None;
    }
    Some(addr.to_string())
}

/// Link-local range fe80::/10
fn is_link_local(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80
}

/// Periodic discovery task feeding the self-advertisement
pub struct Ipv6Discoverer {
    probe: Arc<dyn PublicIpv6Probe>,
    peers: Arc<PeerTable>,
    endpoints: Vec<String>,
    refresh: Duration,
    probe_timeout: Duration,

    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Ipv6Discoverer {
    pub fn new(
        probe: Arc<dyn PublicIpv6Probe>,
        peers: Arc<PeerTable>,
        endpoints: Vec<String>,
        refresh: Duration,
        probe_timeout: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            probe,
            peers,
            endpoints,
            refresh,
            probe_timeout,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the discovery loop: one immediate run, then every refresh
    /// period.
    pub fn spawn(self: &Arc<Self>) {
        let discoverer = self.clone();
        let handle = tokio::spawn(async move {
            let mut shutdown = discoverer.shutdown.subscribe();
            loop {
                if *shutdown.borrow() {
                    return;
                }
                discoverer.refresh_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(discoverer.refresh) => {}
                    _ = shutdown.changed() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    pub fn close(&self) {
        let _ = self.shutdown.send_replace(true);
    }

    pub async fn join(&self) {
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Query the endpoints in order; the first valid answer wins
    async fn refresh_once(&self) {
        for url in &self.endpoints {
            match tokio::time::timeout(self.probe_timeout, self.probe.fetch(url)).await {
                Ok(Ok(body)) => {
                    if let Some(addr) = validate_public_ipv6(&body) {
                        if self.peers.set_self_ipv6(&addr) {
                            info!("public ipv6 is now {addr}");
                        }
                        return;
                    }
                    debug!("ipv6 endpoint {url} returned unusable body");
                }
                Ok(Err(e)) => debug!("ipv6 probe {url} failed: {e}"),
                Err(_) => debug!("ipv6 probe {url} timed out"),
            }
        }
        debug!("no public ipv6 discovered this cycle");
    }
}
