//! Save-data synchronization between devices
//!
//! Each monitored directory carries a [`VectorClock`](crate::clock::VectorClock).
//! Syncing snapshots the directory into a bounded version store, bumps this
//! device's counter and offers the version to peers over discovery. Incoming
//! offers are classified by clock comparison:
//!
//! | remote vs local | outcome                       |
//! |-----------------|-------------------------------|
//! | after           | update available              |
//! | before / equal  | ignored                       |
//! | concurrent      | [`Conflict`] until resolved   |
//!
//! Wall-clock time is only consulted by last-writer-wins on an exact logical
//! tie, and the outcome is then flagged unreliable.

pub mod service;
pub mod types;
pub mod versions;
pub mod watcher;

pub use service::{
    last_writer, OfferPublisher, SaveFetcher, SaveSyncService, SyncMode, TransferSaveFetcher,
};
pub use types::{
    Conflict, OfferDecision, Resolution, ResolutionOutcome, SaveState, SaveSyncEvent, SaveVersion,
    Side, SyncOffer,
};
pub use versions::{Snapshot, VersionStore};
pub use watcher::SaveWatcher;
