//! TCP control session
//!
//! One session owns one TCP connection to the coordination server plus
//! three worker tasks: the reader, the keepalive timer and the inactivity
//! timer. The session surfaces decoded frames upward as [`SessionEvent`]s
//! over a bounded channel; the consumer (engine) owns the dispatch. Closing
//! signals every task to exit at its next wake and fires the `Closed` event
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use meshlink_crypto::CryptoSuite;

use crate::codec;
use crate::error::{CodecError, NetError, NetResult};
use crate::frame::Frame;
use crate::payload::{Handshake, HandshakeReply, KeepAlive};
use crate::peers::PeerTable;

/// How often the inactivity timer checks the session
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Initial capacity of the streaming receive buffer
const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Session (and client) lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialize,
    Connecting,
    Connected,
    /// Between sessions, waiting for the supervisor to rebuild
    Reconnect,
    Closed,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initialize => "initialize",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnect => "reconnect",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Frames and lifecycle changes surfaced by a session
#[derive(Debug)]
pub enum SessionEvent {
    HandshakeReply(HandshakeReply),
    KeepAlive(KeepAlive),
    Data(Vec<u8>),
    Closed { reason: String },
}

/// Connection parameters for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_address: String,
    pub server_port: u16,
    pub identity: String,
    /// Interval between outbound keepalives
    pub keepalive_interval: Duration,
    /// Inactivity window after which the session is closed
    pub timeout: Duration,
}

/// One TCP control connection and its worker tasks
pub struct ControlSession {
    config: SessionConfig,
    crypto: Arc<CryptoSuite>,
    peers: Arc<PeerTable>,
    events: mpsc::Sender<SessionEvent>,

    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    /// Monotonic base for `last_active`
    epoch: Instant,
    /// Milliseconds since `epoch` of the last decoded frame or
    /// successful write
    last_active: AtomicU64,

    handshake_done: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlSession {
    pub fn new(
        config: SessionConfig,
        crypto: Arc<CryptoSuite>,
        peers: Arc<PeerTable>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            crypto,
            peers,
            events,
            state: Mutex::new(SessionState::Initialize),
            writer: tokio::sync::Mutex::new(None),
            epoch: Instant::now(),
            last_active: AtomicU64::new(0),
            handshake_done: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect, emit the handshake and start the reader.
    ///
    /// `Ok` means the session is live and awaiting the handshake reply;
    /// `Connected` is entered when that reply arrives. On error the caller
    /// must still [`close`](Self::close) the session.
    pub async fn start(self: &Arc<Self>) -> NetResult<()> {
        self.set_state(SessionState::Connecting);

        let addr = format!("{}:{}", self.config.server_address, self.config.server_port);
        info!("connecting to {addr}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| NetError::ConnectFailed(format!("{addr}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.touch();

        self.send_frame(&Frame::Handshake(Handshake {
            identity: self.config.identity.clone(),
        }))
        .await
        .map_err(|e| NetError::HandshakeFailed(e.to_string()))?;

        let session = self.clone();
        self.spawn(async move { session.reader_loop(reader).await });
        // The inactivity window also bounds the handshake itself
        self.spawn_timeout();
        Ok(())
    }

    /// Relay one IP packet to the server as a `Data` frame
    pub async fn send_data(&self, packet: &[u8]) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if self.state() != SessionState::Connected {
            return Err(NetError::NotConnected);
        }
        self.send_frame(&Frame::Data(packet.to_vec())).await
    }

    /// Close the session. Idempotent; fires the `Closed` event once and
    /// signals every worker task to exit at its next wake.
    pub async fn close(&self, reason: &str) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("closing control session: {reason}");
        self.set_state(SessionState::Closed);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let _ = self
            .events
            .send(SessionEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Await the exit of all worker tasks spawned by this session
    pub async fn join(&self) {
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Time since the last decoded frame or successful write
    pub fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_active.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            debug!("session state: {} -> {}", *state, next);
            *state = next;
        }
    }

    fn touch(&self) {
        self.last_active
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        self.tasks.lock().unwrap().push(handle);
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    /// Encode and write one frame; the writer mutex serializes senders.
    ///
    /// Returns once the bytes are handed to the kernel. A successful write
    /// counts as liveness: a silent server behind a writable socket is
    /// still alive.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let encoded = codec::encode(frame, &self.crypto)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::NotConnected)?;
        let result = writer.write_all(&encoded).await;
        drop(guard);

        match result {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                let reason = format!("write error: {e}");
                self.close(&reason).await;
                Err(NetError::Io(e))
            }
        }
    }

    async fn reader_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

        loop {
            // Drain every complete frame currently buffered
            loop {
                if self.is_closed() {
                    return;
                }
                match codec::decode(&buf, &self.crypto) {
                    Ok((frame, consumed)) => {
                        buf.advance(consumed);
                        self.touch();
                        self.handle_frame(frame).await;
                    }
                    Err(CodecError::TooShort) => break,
                    Err(e) => {
                        warn!("fatal codec error on control stream: {e}");
                        self.close(&format!("codec error: {e}")).await;
                        return;
                    }
                }
            }

            let read = tokio::select! {
                read = reader.read_buf(&mut buf) => read,
                _ = shutdown.changed() => return,
            };
            match read {
                Ok(0) => {
                    self.close("connection closed by server").await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.close(&format!("read error: {e}")).await;
                    return;
                }
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::HandshakeReply(reply) => {
                if !self.handshake_done.swap(true, Ordering::SeqCst) {
                    self.set_state(SessionState::Connected);
                    info!(
                        "control session established, virtual ip {}",
                        reply.private_ip
                    );
                    self.spawn_keepalive();
                }
                self.emit(SessionEvent::HandshakeReply(reply)).await;
            }
            Frame::KeepAlive(keepalive) => {
                self.emit(SessionEvent::KeepAlive(keepalive)).await;
            }
            Frame::Data(packet) => {
                self.emit(SessionEvent::Data(packet)).await;
            }
            other => {
                debug!("ignoring {:?} frame on control channel", other.kind());
            }
        }
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let session = self.clone();
        self.spawn(async move {
            let mut shutdown = session.shutdown.subscribe();
            loop {
                if session.is_closed() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(session.config.keepalive_interval) => {}
                    _ = shutdown.changed() => return,
                }

                let advert = session.peers.advert();
                let frame = Frame::KeepAlive(KeepAlive {
                    identity: session.config.identity.clone(),
                    ipv6: advert.ipv6,
                    port: advert.udp_port,
                    stun_ip: advert.stun_ip,
                    stun_port: advert.stun_port,
                    peer_details: Vec::new(),
                });
                if let Err(e) = session.send_frame(&frame).await {
                    debug!("keepalive send failed: {e}");
                    return;
                }
            }
        });
    }

    fn spawn_timeout(self: &Arc<Self>) {
        let session = self.clone();
        self.spawn(async move {
            let mut shutdown = session.shutdown.subscribe();
            loop {
                if session.is_closed() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(TIMEOUT_CHECK_INTERVAL) => {}
                    _ = shutdown.changed() => return,
                }
                if session.idle() > session.config.timeout {
                    warn!(
                        "no traffic for {:?}, closing session",
                        session.config.timeout
                    );
                    session.close("session timed out").await;
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> (Arc<ControlSession>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let config = SessionConfig {
            server_address: "127.0.0.1".into(),
            server_port: 1,
            identity: "c1".into(),
            keepalive_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        };
        let crypto = Arc::new(CryptoSuite::from_config("").unwrap());
        let peers = Arc::new(PeerTable::new(Duration::from_secs(15)));
        (ControlSession::new(config, crypto, peers, tx), rx)
    }

    #[tokio::test]
    async fn test_send_data_requires_connected() {
        let (session, _rx) = test_session();
        assert!(matches!(
            session.send_data(&[0u8; 20]).await,
            Err(NetError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_data_after_close_is_closed() {
        let (session, _rx) = test_session();
        session.close("test").await;
        assert!(matches!(
            session.send_data(&[0u8; 20]).await,
            Err(NetError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fires_once() {
        let (session, mut rx) = test_session();
        session.close("first").await;
        session.close("second").await;

        let event = rx.recv().await.unwrap();
        match event {
            SessionEvent::Closed { reason } => assert_eq!(reason, "first"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_idle_tracks_touch() {
        let (session, _rx) = test_session();
        session.touch();
        assert!(session.idle() < Duration::from_millis(100));
    }
}
