//! Virtual-interface abstraction
//!
//! The platform driver (packet-in/packet-out flow and the host-side route
//! installer) lives outside this workspace; the data plane only depends on
//! this trait.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::NetResult;
use crate::net::Cidr;

/// Addressing and routing state pushed to the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Virtual IPv4 address of this client
    pub local_ip: Ipv4Addr,
    /// Subnet mask on the tunnel
    pub mask: Ipv4Addr,
    /// Virtual gateway, installed as a neighbor route
    pub gateway: Ipv4Addr,
    /// One included route per virtual network currently served by a peer
    pub cidrs: BTreeSet<Cidr>,
}

/// Platform-agnostic virtual network interface
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one IP packet from the interface
    async fn read_packet(&self) -> NetResult<Vec<u8>>;

    /// Write one IP packet to the interface
    async fn write_packet(&self, packet: &[u8]) -> NetResult<()>;

    /// Apply addressing and the current route set.
    ///
    /// Called once with the initial assignment and again whenever the CIDR
    /// set changes; calls are never issued concurrently.
    async fn apply_network_settings(&self, settings: &NetworkSettings) -> NetResult<()>;
}
