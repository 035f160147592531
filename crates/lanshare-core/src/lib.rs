//! lanshare Core Library
//!
//! Serverless file and save-data sharing between machines on one LAN.
//!
//! ## Overview
//!
//! Nodes find each other by UDP broadcast, push directory packages to each
//! other over TCP with per-file integrity checks and resume, and keep save
//! directories in step using vector clocks. When a shared key is configured
//! every TCP stream is mutually authenticated and encrypted.
//!
//! ## Core Principles
//!
//! - **No server**: discovery, transfer and sync are all peer to peer
//! - **Never corrupt the destination**: files land in staging and are moved
//!   into place only after every hash verifies
//! - **Causality over clocks**: save conflicts are detected with vector
//!   clocks; wall-clock time only breaks exact ties
//!
//! ## Quick Start
//!
//! ```ignore
//! use lanshare_core::{LanShareNode, ShareConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = LanShareNode::new(ShareConfig::with_root("./lanshare")).await?;
//!     node.start().await?;
//!
//!     // Push a directory to the first peer that shows up
//!     if let Some(peer) = node.discovery().peers().first() {
//!         let result = node.transfer().send_package(peer.address, "./pack".as_ref()).await;
//!         println!("sent: {} ({:?})", result.success, result.error);
//!     }
//!
//!     node.stop().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod locks;
pub mod logging;
pub mod net;
pub mod node;
pub mod savesync;
pub mod storage;
pub mod transfer;

// Re-exports
pub use clock::{ClockOrdering, VectorClock};
pub use config::{BindPolicy, CompressionMode, ShareConfig};
pub use crypto::ChannelCipher;
pub use discovery::{DiscoveryEvent, DiscoveryService, ManualPeer, Peer};
pub use error::{ShareError, ShareResult};
pub use node::LanShareNode;
pub use savesync::{
    Conflict, OfferDecision, Resolution, SaveState, SaveSyncEvent, SaveSyncService, SaveVersion,
    SyncMode, SyncOffer,
};
pub use storage::Storage;
pub use transfer::{
    LibraryCatalog, Manifest, TransferEvent, TransferInfo, TransferResult, TransferService,
};
