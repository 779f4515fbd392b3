//! Phonendo Relay Library
//!
//! Elects a single manager among peers discovered on a libp2p overlay, keeps
//! that choice valid with liveness probes, and relays periodic captures to it.

pub mod capture;
pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
pub mod overlay;
pub mod registry;
pub mod responder;
pub mod tracker;
pub mod wire;

pub use error::{RelayError, Result};
