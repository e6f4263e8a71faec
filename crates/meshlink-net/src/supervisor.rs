//! Reconnect supervisor
//!
//! Owns at most one control session. When a session closes, the supervisor
//! waits out the backoff delay and builds a fresh one. Concurrent reconnect
//! requests collapse into a single attempt; closing the supervisor is
//! terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use meshlink_crypto::CryptoSuite;

use crate::peers::PeerTable;
use crate::session::{ControlSession, SessionConfig, SessionEvent};

pub struct SessionSupervisor {
    config: SessionConfig,
    reconnect_delay: Duration,
    crypto: Arc<CryptoSuite>,
    peers: Arc<PeerTable>,
    events: mpsc::Sender<SessionEvent>,

    session: RwLock<Option<Arc<ControlSession>>>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl SessionSupervisor {
    pub fn new(
        config: SessionConfig,
        reconnect_delay: Duration,
        crypto: Arc<CryptoSuite>,
        peers: Arc<PeerTable>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            reconnect_delay,
            crypto,
            peers,
            events,
            session: RwLock::new(None),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Build and start the first session
    pub async fn start(self: &Arc<Self>) {
        self.connect_once().await;
    }

    /// The session currently owned by the supervisor, if any
    pub async fn current(&self) -> Option<Arc<ControlSession>> {
        self.session.read().await.clone()
    }

    /// Request a reconnect after the backoff delay.
    ///
    /// A second trigger while a reconnect is already pending is a no-op,
    /// so overlapping close signals produce exactly one attempt.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect already pending");
            return;
        }

        info!("reconnecting in {:?}", self.reconnect_delay);
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.reconnect_delay).await;
            supervisor.reconnecting.store(false, Ordering::SeqCst);
            supervisor.connect_once().await;
        });
    }

    /// Terminal shutdown: closes the owned session and refuses any
    /// further reconnects.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.write().await.take() {
            session.close("supervisor shutdown").await;
            session.join().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect_once(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }

        let session = ControlSession::new(
            self.config.clone(),
            self.crypto.clone(),
            self.peers.clone(),
            self.events.clone(),
        );
        *self.session.write().await = Some(session.clone());

        if let Err(e) = session.start().await {
            warn!("connect attempt failed: {e}");
            // Funnels into the Closed event; the consumer schedules the
            // next attempt from there.
            session.close(&format!("connect failed: {e}")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn accept_counter() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        // Keep the connection open so the session idles
                        tokio::spawn(async move {
                            let _stream = stream;
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        });
                    }
                    Err(_) => return,
                }
            }
        });
        (addr, accepted)
    }

    fn supervisor_for(
        addr: std::net::SocketAddr,
    ) -> (Arc<SessionSupervisor>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let config = SessionConfig {
            server_address: addr.ip().to_string(),
            server_port: addr.port(),
            identity: "c1".into(),
            keepalive_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        };
        let crypto = Arc::new(CryptoSuite::from_config("").unwrap());
        let peers = Arc::new(PeerTable::new(Duration::from_secs(15)));
        (
            SessionSupervisor::new(config, Duration::from_millis(50), crypto, peers, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_concurrent_reconnect_requests_collapse() {
        let (addr, accepted) = accept_counter().await;
        let (supervisor, _rx) = supervisor_for(addr);

        supervisor.schedule_reconnect();
        supervisor.schedule_reconnect();
        supervisor.schedule_reconnect();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (addr, accepted) = accept_counter().await;
        let (supervisor, _rx) = supervisor_for(addr);

        supervisor.close().await;
        supervisor.schedule_reconnect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
        assert!(supervisor.current().await.is_none());
    }

    #[tokio::test]
    async fn test_start_connects_and_exposes_session() {
        let (addr, accepted) = accept_counter().await;
        let (supervisor, _rx) = supervisor_for(addr);

        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(supervisor.current().await.is_some());

        supervisor.close().await;
    }
}
