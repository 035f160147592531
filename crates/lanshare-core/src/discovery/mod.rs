//! LAN presence and small auxiliary messages over UDP
//!
//! ## Overview
//!
//! Every node periodically announces itself (device id, host name, transfer
//! port, packaged item count) to the broadcast address. Peers that stop
//! announcing are dropped after a timeout of more than two worst-case
//! announce intervals. Manually added peers never time out.
//!
//! The same socket carries small auxiliary messages: transfer requests and
//! save-sync offers/requests. Anything bulky goes over the transfer protocol.
//!
//! ## Usage
//!
//! ```ignore
//! let discovery = DiscoveryService::new(&config, Some(storage));
//! let mut events = discovery.subscribe();
//! discovery.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event);
//! }
//! ```

mod events;
mod message;
mod peers;
mod service;

pub use events::DiscoveryEvent;
pub use message::{DiscoveryMessage, MessageType, DISCOVERY_MAGIC, MAX_DATAGRAM_SIZE};
pub use peers::{ManualPeer, Peer};
pub use service::{DiscoveryService, SWEEP_INTERVAL};
