//! MeshLink Network Layer
//!
//! Network primitives for the client data plane:
//! - Framed wire protocol shared by both transports
//! - TCP control session to the coordination server
//! - Reconnect supervisor
//! - Peer table with per-peer reachability tracking
//! - UDP/IPv6 peer-to-peer service
//! - Virtual-interface abstraction

pub mod codec;
pub mod error;
pub mod frame;
pub mod net;
pub mod p2p;
pub mod payload;
pub mod peers;
pub mod session;
pub mod supervisor;
pub mod tun;

pub use error::{CodecError, NetError, NetResult};
pub use frame::{Frame, FrameKind, HEADER_LEN, MAGIC, VERSION};
pub use net::Cidr;
pub use p2p::{P2pConfig, P2pService};
pub use payload::{Handshake, HandshakeReply, KeepAlive, PeerDetail, Probe};
pub use peers::{PeerEntry, PeerTable, SelfAdvert};
pub use session::{ControlSession, SessionConfig, SessionEvent, SessionState};
pub use supervisor::SessionSupervisor;
pub use tun::{NetworkSettings, TunDevice};
