//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshlink_crypto::CryptoSuite;
use meshlink_net::p2p::DEFAULT_P2P_PORT;
use meshlink_net::{P2pConfig, SessionConfig};

use crate::error::{CoreError, CoreResult};
use crate::ipv6::DEFAULT_IPV6_ENDPOINTS;

/// Client configuration.
///
/// Persistence belongs to the host application; this type only defines the
/// shape and the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination server host or address
    pub server_address: String,

    /// Coordination server TCP port
    pub server_port: u16,

    /// Opaque identity of this client, unique within a deployment
    pub identity: String,

    /// Cipher selection, `"<alg>:<key>"` or empty for plaintext
    pub crypto_config: String,

    /// Interval between outbound keepalives
    pub keepalive_interval: Duration,

    /// Inactivity window after which the control session is closed
    pub session_timeout: Duration,

    /// Delay before the supervisor rebuilds a closed session
    pub reconnect_delay: Duration,

    /// Local UDP port of the peer channel
    pub p2p_port: u16,

    /// Interval of the peer reachability probe loop
    pub probe_interval: Duration,

    /// Window within which a received probe keeps the direct path alive
    pub active_threshold: Duration,

    /// Period of the public-IPv6 discovery task
    pub ipv6_refresh: Duration,

    /// Per-endpoint timeout of one discovery attempt
    pub ipv6_probe_timeout: Duration,

    /// Ordered discovery endpoints; the first valid answer wins
    pub ipv6_endpoints: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            server_port: 8080,
            identity: String::new(),
            crypto_config: String::new(),
            keepalive_interval: Duration::from_secs(10),
            session_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            p2p_port: DEFAULT_P2P_PORT,
            probe_interval: Duration::from_secs(10),
            active_threshold: Duration::from_secs(15),
            ipv6_refresh: Duration::from_secs(300),
            ipv6_probe_timeout: Duration::from_secs(5),
            ipv6_endpoints: DEFAULT_IPV6_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> CoreResult<()> {
        if self.server_address.is_empty() {
            return Err(CoreError::Config("server_address must be set".into()));
        }
        if self.server_port == 0 {
            return Err(CoreError::Config("server_port must be non-zero".into()));
        }
        if self.identity.is_empty() {
            return Err(CoreError::Config("identity must be set".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(CoreError::Config(
                "keepalive_interval must be non-zero".into(),
            ));
        }
        if self.session_timeout <= self.keepalive_interval {
            return Err(CoreError::Config(
                "session_timeout must exceed keepalive_interval".into(),
            ));
        }
        CryptoSuite::from_config(&self.crypto_config)
            .map_err(|e| CoreError::Config(format!("crypto_config: {e}")))?;
        Ok(())
    }

    /// Parameters of one control session
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_address: self.server_address.clone(),
            server_port: self.server_port,
            identity: self.identity.clone(),
            keepalive_interval: self.keepalive_interval,
            timeout: self.session_timeout,
        }
    }

    /// Parameters of the peer channel
    pub fn p2p_config(&self) -> P2pConfig {
        P2pConfig {
            port: self.p2p_port,
            probe_interval: self.probe_interval,
        }
    }
}
