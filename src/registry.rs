//! Manager Registry
//!
//! Single-entry cache of the elected manager. The cached peer is re-validated
//! with a liveness probe on every read, since managers can vanish without
//! telling anyone.

use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::overlay::Overlay;
use crate::wire::MANAGER_TOKEN;

pub struct ManagerRegistry {
    overlay: Arc<dyn Overlay>,
    manager: RwLock<Option<PeerId>>,
}

impl ManagerRegistry {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            overlay,
            manager: RwLock::new(None),
        }
    }

    /// Return the manager if it still answers a liveness probe.
    ///
    /// An empty registry returns `None` without probing. A failed probe clears
    /// the entry, unless it was replaced while the probe was in flight.
    pub async fn get_manager(&self) -> Option<PeerId> {
        let peer = (*self.manager.read().await)?;

        match self.overlay.ping(peer).await {
            Ok(rtt) => {
                trace!("{} {} alive (rtt {:?})", MANAGER_TOKEN, peer, rtt);
                Some(peer)
            }
            Err(e) => {
                let mut manager = self.manager.write().await;
                if *manager == Some(peer) {
                    *manager = None;
                    warn!("Removed {} peer {}: {}", MANAGER_TOKEN, peer, e);
                }
                None
            }
        }
    }

    /// Overwrite the cached manager. Last writer wins.
    pub async fn set_manager(&self, peer: PeerId) {
        *self.manager.write().await = Some(peer);
    }

    /// Cached value without a liveness probe.
    pub async fn current(&self) -> Option<PeerId> {
        *self.manager.read().await
    }
}
