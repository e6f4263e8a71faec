//! Route management
//!
//! Tracks the union of peer-advertised CIDRs and pushes addressing plus one
//! included route per network to the virtual interface whenever that set
//! changes. Applies are serialized: the state lock is held across the
//! device call, so a new apply never starts before the previous one
//! finished.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use meshlink_net::net::parse_mask;
use meshlink_net::{Cidr, NetError, NetworkSettings, TunDevice};

use crate::error::CoreResult;

#[derive(Debug, Default)]
struct RouteState {
    /// Addressing from the first handshake reply
    base: Option<(Ipv4Addr, Ipv4Addr, Ipv4Addr)>,
    /// CIDR set of the last successful apply; `None` before the first
    applied: Option<BTreeSet<Cidr>>,
}

/// Diffs the advertised CIDR set and drives the virtual interface
pub struct RouteManager {
    tun: Arc<dyn TunDevice>,
    state: Mutex<RouteState>,
}

impl RouteManager {
    pub fn new(tun: Arc<dyn TunDevice>) -> Self {
        Self {
            tun,
            state: Mutex::new(RouteState::default()),
        }
    }

    /// Record the address assignment of the first handshake reply.
    ///
    /// The mask accepts dotted-decimal or a prefix length. Later replies
    /// do not change the assignment.
    pub async fn set_base(&self, private_ip: &str, mask: &str, gateway: &str) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if state.base.is_some() {
            return Ok(());
        }

        let local_ip: Ipv4Addr = private_ip
            .parse()
            .map_err(|_| NetError::InvalidAddress(private_ip.to_string()))?;
        let mask = parse_mask(mask)?;
        let gateway: Ipv4Addr = gateway
            .parse()
            .map_err(|_| NetError::InvalidAddress(gateway.to_string()))?;

        info!("assigned virtual address {local_ip} (mask {mask}, gateway {gateway})");
        state.base = Some((local_ip, mask, gateway));
        Ok(())
    }

    /// Reconcile the interface with the advertised CIDR set.
    ///
    /// Does nothing when the set is unchanged. A failed apply keeps the
    /// previous applied set, so the same roster retries on its next
    /// update. Returns true when settings were pushed.
    pub async fn sync(&self, cidrs: BTreeSet<Cidr>) -> bool {
        let mut state = self.state.lock().await;

        if state.applied.as_ref() == Some(&cidrs) {
            return false;
        }
        let Some((local_ip, mask, gateway)) = state.base else {
            debug!("roster update before address assignment, deferring routes");
            return false;
        };

        let previous = state.applied.clone().unwrap_or_default();
        let added: Vec<_> = cidrs.difference(&previous).collect();
        let removed: Vec<_> = previous.difference(&cidrs).collect();
        info!(
            "updating routes: {} added {added:?}, {} removed {removed:?}",
            added.len(),
            removed.len()
        );

        let settings = NetworkSettings {
            local_ip,
            mask,
            gateway,
            cidrs: cidrs.clone(),
        };
        match self.tun.apply_network_settings(&settings).await {
            Ok(()) => {
                state.applied = Some(cidrs);
                true
            }
            Err(e) => {
                warn!("route apply failed, will retry on next roster update: {e}");
                false
            }
        }
    }

    /// Assigned virtual IPv4 address, once known
    pub async fn virtual_ip(&self) -> Option<Ipv4Addr> {
        self.state.lock().await.base.map(|(ip, _, _)| ip)
    }

    /// Whether settings were applied at least once
    pub async fn has_applied(&self) -> bool {
        self.state.lock().await.applied.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshlink_net::NetResult;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTun {
        applies: AtomicUsize,
        fail_next: AtomicBool,
        last: StdMutex<Option<NetworkSettings>>,
    }

    #[async_trait]
    impl TunDevice for RecordingTun {
        async fn read_packet(&self) -> NetResult<Vec<u8>> {
            std::future::pending().await
        }

        async fn write_packet(&self, _packet: &[u8]) -> NetResult<()> {
            Ok(())
        }

        async fn apply_network_settings(&self, settings: &NetworkSettings) -> NetResult<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(NetError::ConnectFailed("device busy".into()));
            }
            self.applies.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(settings.clone());
            Ok(())
        }
    }

    fn cidrs(list: &[&str]) -> BTreeSet<Cidr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    async fn manager() -> (RouteManager, Arc<RecordingTun>) {
        let tun = Arc::new(RecordingTun::default());
        let manager = RouteManager::new(tun.clone());
        manager
            .set_base("10.0.0.2", "255.255.255.0", "10.0.0.1")
            .await
            .unwrap();
        (manager, tun)
    }

    #[tokio::test]
    async fn test_identical_set_does_not_reapply() {
        let (manager, tun) = manager().await;

        assert!(manager.sync(cidrs(&["10.0.1.0/24"])).await);
        assert!(!manager.sync(cidrs(&["10.0.1.0/24"])).await);
        assert_eq!(tun.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changed_set_reapplies_with_full_settings() {
        let (manager, tun) = manager().await;

        manager.sync(cidrs(&["10.0.1.0/24"])).await;
        manager.sync(cidrs(&["10.0.1.0/24", "10.0.2.0/24"])).await;

        assert_eq!(tun.applies.load(Ordering::SeqCst), 2);
        let last = tun.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.local_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(last.mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(last.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(last.cidrs, cidrs(&["10.0.1.0/24", "10.0.2.0/24"]));
    }

    #[tokio::test]
    async fn test_sync_before_assignment_defers() {
        let tun = Arc::new(RecordingTun::default());
        let manager = RouteManager::new(tun.clone());

        assert!(!manager.sync(cidrs(&["10.0.1.0/24"])).await);
        assert_eq!(tun.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_apply_retries_on_same_set() {
        let (manager, tun) = manager().await;
        tun.fail_next.store(true, Ordering::SeqCst);

        assert!(!manager.sync(cidrs(&["10.0.1.0/24"])).await);
        assert!(!manager.has_applied().await);

        // Same roster arrives again; the diff is still non-empty
        assert!(manager.sync(cidrs(&["10.0.1.0/24"])).await);
        assert_eq!(tun.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_base_assignment_is_sticky() {
        let (manager, _tun) = manager().await;
        manager
            .set_base("10.9.9.9", "16", "10.9.9.1")
            .await
            .unwrap();

        assert_eq!(
            manager.virtual_ip().await,
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[tokio::test]
    async fn test_prefix_length_mask_accepted() {
        let tun = Arc::new(RecordingTun::default());
        let manager = RouteManager::new(tun.clone());
        manager.set_base("10.0.0.2", "24", "10.0.0.1").await.unwrap();
        manager.sync(BTreeSet::new()).await;

        let last = tun.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.mask, Ipv4Addr::new(255, 255, 255, 0));
    }
}
