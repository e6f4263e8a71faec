//! JSON payloads of the control frames
//!
//! Field names are the wire names; they must not be renamed. The peer
//! detail field `ciders` is a historical misspelling the server still
//! speaks, kept verbatim for compatibility.

use serde::{Deserialize, Serialize};

/// Client hello, first frame on every control session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Opaque UTF-8 identity of this client
    pub identity: String,
}

/// Server reply to [`Handshake`], assigning the virtual address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Virtual IPv4 address assigned to this client
    pub private_ip: String,
    /// Subnet mask, dotted-decimal or prefix length
    pub mask: String,
    /// Virtual gateway address
    pub gateway: String,
    /// Authoritative roster at session start
    pub peer_details: Vec<PeerDetail>,
}

/// One roster entry as the server advertises it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDetail {
    pub identity: String,
    pub private_ip: String,
    /// Virtual networks served by this peer (historical field name)
    pub ciders: Vec<String>,
    /// Advertised public IPv6, empty when unknown
    pub ipv6: String,
    /// UDP port of the peer channel
    pub port: u16,
    pub stun_ip: String,
    pub stun_port: u16,
    /// Seconds since the server last heard from the peer
    pub last_active: u64,
}

/// Periodic liveness frame.
///
/// Client to server it carries the self-advertisement and an empty
/// `peer_details`; server to client it carries roster updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub identity: String,
    pub ipv6: String,
    pub port: u16,
    pub stun_ip: String,
    pub stun_port: u16,
    pub peer_details: Vec<PeerDetail>,
}

/// UDP reachability probe payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    /// Identity of the sender
    pub identity: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_detail_wire_names() {
        let detail = PeerDetail {
            identity: "p2".into(),
            private_ip: "10.0.0.3".into(),
            ciders: vec!["10.0.1.0/24".into()],
            ipv6: "fd00::2".into(),
            port: 51820,
            stun_ip: String::new(),
            stun_port: 0,
            last_active: 7,
        };

        let json = serde_json::to_value(&detail).unwrap();
        assert!(json.get("ciders").is_some());
        assert!(json.get("cidrs").is_none());
        assert_eq!(json["port"], 51820);
        assert_eq!(json["stun_port"], 0);
    }

    #[test]
    fn test_handshake_reply_roundtrip() {
        let reply = HandshakeReply {
            private_ip: "10.0.0.2".into(),
            mask: "255.255.255.0".into(),
            gateway: "10.0.0.1".into(),
            peer_details: vec![],
        };

        let json = serde_json::to_string(&reply).unwrap();
        let parsed: HandshakeReply = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reply);
    }
}
