//! Overlay transport
//!
//! The relay components only need two things from the network: a single
//! request/response exchange under a named sub-protocol, and a liveness probe.
//! `Overlay` captures that seam; `SwarmHandle` implements it on top of libp2p.
//!
//! This module contains:
//! - `behaviour`: libp2p NetworkBehaviour (mDNS, on-demand liveness, discover, capture)
//! - `codec`: raw payload and ping echo codecs for the request/response behaviours
//! - `swarm`: swarm construction, event loop and the command handle

pub mod behaviour;
pub mod codec;
pub mod swarm;

pub use behaviour::{RelayBehaviour, RelayBehaviourEvent};
pub use swarm::{build_swarm, SwarmDriver, SwarmHandle};

use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;

use crate::error::Result;
use crate::wire::SubProtocol;

#[async_trait]
pub trait Overlay: Send + Sync {
    /// Opens a stream to `peer` under `protocol`, writes `payload` and reads the full response.
    async fn request(&self, peer: PeerId, protocol: SubProtocol, payload: Vec<u8>)
        -> Result<Vec<u8>>;

    /// Checks that `peer` is reachable, returning the observed round trip.
    async fn ping(&self, peer: PeerId) -> Result<Duration>;
}
