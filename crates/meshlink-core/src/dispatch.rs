//! Packet dispatcher
//!
//! Chooses the delivery path per outbound packet: direct UDP when the
//! destination's peer has a proved-alive path, otherwise relay through the
//! control session. The decision is purely destination-driven; nothing is
//! cached between packets.

use std::sync::Arc;

use tracing::{debug, trace};

use meshlink_net::net::ip::ipv4_destination;
use meshlink_net::{P2pService, PeerTable, SessionSupervisor};

use crate::stats::Stats;

/// Destination → peer → P2P-or-relay decision point
pub struct PacketDispatcher {
    peers: Arc<PeerTable>,
    p2p: Arc<P2pService>,
    supervisor: Arc<SessionSupervisor>,
    stats: Arc<Stats>,
}

impl PacketDispatcher {
    pub fn new(
        peers: Arc<PeerTable>,
        p2p: Arc<P2pService>,
        supervisor: Arc<SessionSupervisor>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            peers,
            p2p,
            supervisor,
            stats,
        }
    }

    /// Forward one packet read from the virtual interface.
    ///
    /// Tries the direct path first when a peer serves the destination;
    /// falls back to the relay exactly once. Packets that can reach
    /// neither path are dropped and counted.
    pub async fn dispatch_outbound(&self, packet: &[u8]) {
        let Some(dst) = ipv4_destination(packet) else {
            trace!("dropping malformed or non-ipv4 packet ({} bytes)", packet.len());
            return;
        };

        if let Some(peer) = self.peers.find_by_destination_ip(dst) {
            if self.p2p.send_packet(packet, &peer).await {
                self.stats.inc_p2p_sent();
                return;
            }
        }

        match self.supervisor.current().await {
            Some(session) => match session.send_data(packet).await {
                Ok(()) => self.stats.inc_relay_sent(),
                Err(e) => {
                    debug!("relay send to {dst} failed: {e}");
                    self.stats.inc_dropped();
                }
            },
            None => {
                debug!("no control session for {dst}, dropping");
                self.stats.inc_dropped();
            }
        }
    }
}
