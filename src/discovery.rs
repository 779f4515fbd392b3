//! Manager discovery
//!
//! `DiscoveryClient` runs the discover handshake against one peer.
//! `Dispatcher` consumes peer-discovered events, deduplicates them through the
//! `ProbeTracker` and runs handshakes in a bounded task group so that event
//! handling never waits on the network.

use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace};

use crate::overlay::Overlay;
use crate::registry::ManagerRegistry;
use crate::tracker::ProbeTracker;
use crate::wire::{Role, SubProtocol, DISCOVER_REQUEST, MANAGER_TOKEN};

/// Outcome of a discover handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleResult {
    Manager,
    NotManager,
    /// The peer could not be reached under the discover sub-protocol.
    Unsupported,
}

#[derive(Clone)]
pub struct DiscoveryClient {
    overlay: Arc<dyn Overlay>,
}

impl DiscoveryClient {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self { overlay }
    }

    pub async fn probe(&self, peer: PeerId) -> RoleResult {
        let request = DISCOVER_REQUEST.as_bytes().to_vec();
        match self.overlay.request(peer, SubProtocol::Discover, request).await {
            Ok(response) => match Role::from_payload(&response) {
                Role::Manager => RoleResult::Manager,
                role => {
                    debug!("Peer {} answered discover as {:?}", peer, role.token());
                    RoleResult::NotManager
                }
            },
            Err(e) => {
                trace!("Discover protocol unsupported by {}: {}", peer, e);
                RoleResult::Unsupported
            }
        }
    }

    /// Probe `peer` and record it in `registry` when it is the manager.
    pub async fn probe_and_record(&self, peer: PeerId, registry: &ManagerRegistry) -> RoleResult {
        let result = self.probe(peer).await;
        if result == RoleResult::Manager {
            info!("Added {} peer {}", MANAGER_TOKEN, peer);
            registry.set_manager(peer).await;
        }
        result
    }
}

pub struct Dispatcher {
    tracker: Arc<ProbeTracker>,
    registry: Arc<ManagerRegistry>,
    client: DiscoveryClient,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<ProbeTracker>,
        registry: Arc<ManagerRegistry>,
        client: DiscoveryClient,
        max_concurrent_probes: usize,
    ) -> Self {
        Self {
            tracker,
            registry,
            client,
            permits: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Handle one discovery event. Returns once the handshake (if any) is scheduled.
    pub async fn on_peer_discovered(&mut self, peer: PeerId) {
        if !self.tracker.mark_seen(&peer).await {
            trace!("Peer {} already probed", peer);
            return;
        }

        if let Some(manager) = self.registry.current().await {
            debug!(
                "Skipping discover for {}, {} already known: {}",
                peer, MANAGER_TOKEN, manager
            );
            return;
        }

        let client = self.client.clone();
        let registry = self.registry.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            client.probe_and_record(peer, &registry).await;
        });
    }

    /// Consume events until the sender side closes, then wait for outstanding probes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerId>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(peer) => self.on_peer_discovered(peer).await,
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_join(joined);
                }
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            log_join(joined);
        }
        debug!("Discovery dispatcher stopped");
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Discover task panicked: {}", e);
        }
    }
}
