use std::iter;

use libp2p::mdns::tokio::Behaviour as Mdns;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identity, mdns, PeerId, StreamProtocol};

use super::codec::{PayloadCodec, PingCodec, PING_PROTOCOL};
use crate::config::Config;
use crate::wire::SubProtocol;

pub type RequestResponse = request_response::Behaviour<PayloadCodec>;
pub type Liveness = request_response::Behaviour<PingCodec>;

/// Combined behaviour: mDNS discovery, on-demand liveness pings and the two relay sub-protocols.
#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    pub mdns: Toggle<Mdns>,
    pub liveness: Liveness,
    pub discover: RequestResponse,
    pub capture: RequestResponse,
}

impl RelayBehaviour {
    pub fn new(keypair: &identity::Keypair, config: &Config) -> Result<Self, std::io::Error> {
        let local_peer_id = PeerId::from(keypair.public());

        let mdns = if config.mdns_enabled {
            let mdns_config = mdns::Config {
                query_interval: config.mdns_query_interval(),
                ..Default::default()
            };
            Some(Mdns::new(mdns_config, local_peer_id)?)
        } else {
            None
        };

        let mut rr_config = request_response::Config::default();
        rr_config.set_request_timeout(config.ping_timeout());
        let liveness = Liveness::with_codec(
            PingCodec,
            iter::once((StreamProtocol::new(PING_PROTOCOL), ProtocolSupport::Full)),
            rr_config,
        );

        Ok(Self {
            mdns: Toggle::from(mdns),
            liveness,
            discover: request_response_for(SubProtocol::Discover, config),
            capture: request_response_for(SubProtocol::Capture, config),
        })
    }

    pub fn sub_protocol_mut(&mut self, protocol: SubProtocol) -> &mut RequestResponse {
        match protocol {
            SubProtocol::Discover => &mut self.discover,
            SubProtocol::Capture => &mut self.capture,
        }
    }

    /// Teach every request/response behaviour where `peer` can be dialed.
    pub fn add_address(&mut self, peer: &PeerId, addr: libp2p::Multiaddr) {
        self.liveness.add_address(peer, addr.clone());
        self.discover.add_address(peer, addr.clone());
        self.capture.add_address(peer, addr);
    }
}

fn request_response_for(protocol: SubProtocol, config: &Config) -> RequestResponse {
    let mut rr_config = request_response::Config::default();
    rr_config.set_request_timeout(config.request_timeout());

    request_response::Behaviour::with_codec(
        PayloadCodec,
        iter::once((
            StreamProtocol::new(protocol.protocol_id()),
            ProtocolSupport::Full,
        )),
        rr_config,
    )
}
