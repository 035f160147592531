//! Live peer table
//!
//! Peers are keyed by their transfer endpoint (IP + transfer port) with a
//! secondary index from device id. Both indices live behind the same lock in
//! [`DiscoveryService`](super::DiscoveryService) so a composite update (a
//! device that moved to a new address) can never leave them disagreeing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A device we can exchange data with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// IP + transfer port
    pub address: SocketAddr,
    /// Where auxiliary datagrams for this peer go
    pub discovery_address: SocketAddr,
    /// Known once the peer has announced itself
    pub device_id: Option<String>,
    pub host_name: String,
    /// Number of packaged items the peer advertises
    pub item_count: u32,
    /// Added by hand; exempt from the liveness timeout
    pub manual: bool,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    /// Label for logs and the CLI
    pub fn label(&self) -> String {
        if self.host_name.is_empty() {
            self.address.to_string()
        } else {
            format!("{} ({})", self.host_name, self.address)
        }
    }
}

/// A peer registered outside the broadcast mechanism, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualPeer {
    /// IP + transfer port
    pub address: SocketAddr,
    #[serde(default)]
    pub host_name: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// What an announce did to the table
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observation {
    /// First time we hear from this device
    New(Peer),
    /// Known peer refreshed
    Refreshed,
    /// Device reappeared at a different address; the old entry is gone
    Moved { old: Peer, new: Peer },
}

/// Fields of an announce relevant to the table
#[derive(Debug, Clone)]
pub(crate) struct Sighting<'a> {
    pub device_id: &'a str,
    pub host_name: &'a str,
    pub address: SocketAddr,
    pub discovery_address: SocketAddr,
    pub item_count: u32,
}

#[derive(Debug)]
struct Entry {
    peer: Peer,
    heard: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    by_addr: HashMap<SocketAddr, Entry>,
    by_device: HashMap<String, SocketAddr>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a device was heard from at `now`.
    pub fn observe(&mut self, sighting: Sighting<'_>, now: Instant) -> Observation {
        let mut moved_from = None;
        if let Some(&previous) = self.by_device.get(sighting.device_id) {
            if previous != sighting.address {
                moved_from = self.take(previous);
            }
        }

        let observation = match self.by_addr.get_mut(&sighting.address) {
            Some(entry) => {
                entry.peer.device_id = Some(sighting.device_id.to_string());
                entry.peer.host_name = sighting.host_name.to_string();
                entry.peer.item_count = sighting.item_count;
                entry.peer.last_seen = Utc::now();
                if !entry.peer.manual {
                    entry.peer.discovery_address = sighting.discovery_address;
                }
                entry.heard = now;
                match moved_from {
                    Some(old) => Observation::Moved {
                        old,
                        new: entry.peer.clone(),
                    },
                    None => Observation::Refreshed,
                }
            }
            None => {
                let peer = Peer {
                    address: sighting.address,
                    discovery_address: sighting.discovery_address,
                    device_id: Some(sighting.device_id.to_string()),
                    host_name: sighting.host_name.to_string(),
                    item_count: sighting.item_count,
                    manual: moved_from.as_ref().map(|p| p.manual).unwrap_or(false),
                    last_seen: Utc::now(),
                };
                self.by_addr.insert(
                    sighting.address,
                    Entry {
                        peer: peer.clone(),
                        heard: now,
                    },
                );
                match moved_from {
                    Some(old) => Observation::Moved { old, new: peer },
                    None => Observation::New(peer),
                }
            }
        };

        self.by_device
            .insert(sighting.device_id.to_string(), sighting.address);
        observation
    }

    /// Insert a manual peer. Returns the peer and whether it was new.
    pub fn add_manual(&mut self, peer: Peer, now: Instant) -> (Peer, bool) {
        match self.by_addr.get_mut(&peer.address) {
            Some(entry) => {
                entry.peer.manual = true;
                if entry.peer.host_name.is_empty() {
                    entry.peer.host_name = peer.host_name;
                }
                (entry.peer.clone(), false)
            }
            None => {
                self.by_addr.insert(
                    peer.address,
                    Entry {
                        peer: peer.clone(),
                        heard: now,
                    },
                );
                (peer, true)
            }
        }
    }

    /// Remove a manual peer (discovered peers are left alone).
    pub fn remove_manual(&mut self, address: SocketAddr) -> Option<Peer> {
        match self.by_addr.get(&address) {
            Some(entry) if entry.peer.manual => self.take(address),
            _ => None,
        }
    }

    /// Drop a device that said goodbye. Manual peers stay.
    pub fn remove_device(&mut self, device_id: &str) -> Option<Peer> {
        let address = *self.by_device.get(device_id)?;
        if self.by_addr.get(&address).map(|e| e.peer.manual).unwrap_or(false) {
            return None;
        }
        self.take(address)
    }

    /// Remove non-manual peers not heard from within `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let expired: Vec<SocketAddr> = self
            .by_addr
            .iter()
            .filter(|(_, e)| !e.peer.manual && now.saturating_duration_since(e.heard) > timeout)
            .map(|(addr, _)| *addr)
            .collect();

        expired.into_iter().filter_map(|addr| self.take(addr)).collect()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<Peer> {
        self.by_addr.get(address).map(|e| e.peer.clone())
    }

    pub fn get_by_device(&self, device_id: &str) -> Option<Peer> {
        self.by_device
            .get(device_id)
            .and_then(|addr| self.get(addr))
    }

    /// All peers ordered by host name
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.by_addr.values().map(|e| e.peer.clone()).collect();
        peers.sort_by(|a, b| a.host_name.cmp(&b.host_name).then(a.address.cmp(&b.address)));
        peers
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Remove from both indices
    fn take(&mut self, address: SocketAddr) -> Option<Peer> {
        let entry = self.by_addr.remove(&address)?;
        if let Some(device_id) = &entry.peer.device_id {
            if self.by_device.get(device_id) == Some(&address) {
                self.by_device.remove(device_id);
            }
        }
        Some(entry.peer)
    }
}
