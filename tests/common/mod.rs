//! Shared test doubles

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use mockall::mock;

use phonendo_relay::overlay::Overlay;
use phonendo_relay::wire::SubProtocol;
use phonendo_relay::{RelayError, Result};

mock! {
    pub Net {}

    #[async_trait]
    impl Overlay for Net {
        async fn request(
            &self,
            peer: PeerId,
            protocol: SubProtocol,
            payload: Vec<u8>,
        ) -> Result<Vec<u8>>;

        async fn ping(&self, peer: PeerId) -> Result<Duration>;
    }
}

pub fn into_overlay(net: MockNet) -> Arc<dyn Overlay> {
    Arc::new(net)
}

/// Expect exactly `times` discover handshakes against `peer`, each answered with `token`.
pub fn expect_discover(net: &mut MockNet, peer: PeerId, token: &'static str, times: usize) {
    net.expect_request()
        .withf(move |p, protocol, payload| {
            *p == peer && *protocol == SubProtocol::Discover && payload.as_slice() == b"discover"
        })
        .times(times)
        .returning(move |_, _, _| Ok(token.as_bytes().to_vec()));
}

/// Expect discover handshakes against `peer` that fail to open a stream.
pub fn expect_discover_unsupported(net: &mut MockNet, peer: PeerId) {
    net.expect_request()
        .withf(move |p, protocol, _| *p == peer && *protocol == SubProtocol::Discover)
        .times(1)
        .returning(|_, protocol, _| Err(RelayError::Unsupported(protocol.to_string())));
}

pub fn expect_ping_ok(net: &mut MockNet, peer: PeerId, times: usize) {
    net.expect_ping()
        .withf(move |p| *p == peer)
        .times(times)
        .returning(|_| Ok(Duration::from_millis(3)));
}

pub fn expect_ping_fail(net: &mut MockNet, peer: PeerId, times: usize) {
    net.expect_ping()
        .withf(move |p| *p == peer)
        .times(times)
        .returning(|p| Err(RelayError::Unreachable(p.to_string())));
}
