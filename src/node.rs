//! Node lifecycle
//!
//! Wires the swarm, discovery dispatcher and capture scheduler together for
//! the configured role, and tears them down on shutdown.

use std::sync::Arc;

use anyhow::Result;
use libp2p::identity;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::{CaptureClient, CaptureScheduler};
use crate::config::{Config, NodeRole};
use crate::discovery::{DiscoveryClient, Dispatcher};
use crate::overlay::{build_swarm, Overlay, SwarmDriver, SwarmHandle};
use crate::registry::ManagerRegistry;
use crate::responder::Responder;
use crate::tracker::ProbeTracker;

pub struct Node {
    config: Config,
    handle: SwarmHandle,
    driver: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build the swarm and start every task for the configured role.
    pub async fn start(config: Config) -> Result<Self> {
        let keypair = identity::Keypair::generate_ed25519();
        let swarm = build_swarm(keypair, &config)?;

        let responder = Responder::new(config.role);
        let (discovered_tx, discovered_rx) = match config.role {
            NodeRole::Reader => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            NodeRole::Manager => (None, None),
        };

        let (driver, handle) = SwarmDriver::new(swarm, responder, discovered_tx);
        info!(
            "Local peer id: {} role={}",
            handle.local_peer_id(),
            config.role
        );
        let driver = tokio::spawn(driver.run());

        let mut workers = Vec::new();

        if let Some(discovered_rx) = discovered_rx {
            let overlay: Arc<dyn Overlay> = Arc::new(handle.clone());
            let manager_registry = Arc::new(ManagerRegistry::new(overlay.clone()));

            let dispatcher = Dispatcher::new(
                Arc::new(ProbeTracker::new()),
                manager_registry.clone(),
                DiscoveryClient::new(overlay.clone()),
                config.max_concurrent_probes,
            );
            workers.push(tokio::spawn(dispatcher.run(discovered_rx)));

            let scheduler = CaptureScheduler::new(
                manager_registry,
                CaptureClient::new(overlay),
                config.capture_interval(),
            )
            .with_single_flight(config.single_flight);
            workers.push(scheduler.spawn());
        }

        Ok(Self {
            config,
            handle,
            driver,
            workers,
        })
    }

    /// Stop background tasks, then shut the transport down.
    pub async fn stop(self) {
        for worker in &self.workers {
            worker.abort();
        }

        self.handle.shutdown().await;
        if let Err(e) = self.driver.await {
            debug!("Swarm task ended abnormally: {}", e);
        }

        info!("{} has stopped", self.config.service_name);
    }
}
