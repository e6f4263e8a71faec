//! MeshLink Core
//!
//! The forwarding engine of the client data plane. Wires the control
//! session, the peer-to-peer service, the packet dispatcher and the route
//! manager around a virtual network interface, and exposes a read-only
//! observation snapshot for the host application.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ipv6;
pub mod routes;
pub mod stats;

pub use config::Config;
pub use dispatch::PacketDispatcher;
pub use engine::{Engine, EngineSnapshot, PeerSnapshot};
pub use error::{CoreError, CoreResult};
pub use ipv6::{Ipv6Discoverer, PublicIpv6Probe, DEFAULT_IPV6_ENDPOINTS};
pub use routes::RouteManager;
pub use stats::{Stats, StatsSnapshot};
