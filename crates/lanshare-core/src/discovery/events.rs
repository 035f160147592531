//! Events emitted by the discovery service

use std::fmt;

use super::peers::Peer;

/// Notifications about peers and the auxiliary messages they send
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer appeared (first announce or manual add)
    PeerDiscovered(Peer),
    /// A peer timed out, said goodbye or was removed by hand
    PeerLost(Peer),
    /// A peer is about to push a package
    TransferRequest {
        peer: Peer,
        item_name: String,
        item_size: u64,
    },
    /// A peer published a new save version
    SaveSyncOffer {
        peer: Peer,
        payload: serde_json::Value,
    },
    /// A peer asked for our latest save version
    SaveSyncRequest {
        peer: Peer,
        payload: serde_json::Value,
    },
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::PeerDiscovered(peer) => write!(f, "peer discovered: {}", peer.label()),
            DiscoveryEvent::PeerLost(peer) => write!(f, "peer lost: {}", peer.label()),
            DiscoveryEvent::TransferRequest {
                peer,
                item_name,
                item_size,
            } => write!(
                f,
                "{} wants to send {} ({} bytes)",
                peer.label(),
                item_name,
                item_size
            ),
            DiscoveryEvent::SaveSyncOffer { peer, .. } => {
                write!(f, "save offer from {}", peer.label())
            }
            DiscoveryEvent::SaveSyncRequest { peer, .. } => {
                write!(f, "save request from {}", peer.label())
            }
        }
    }
}
