//! Discovery datagram codec
//!
//! Datagrams are small UTF-8 JSON objects tagged with a fixed magic string.
//! Anything that fails to parse, carries the wrong magic or exceeds
//! [`MAX_DATAGRAM_SIZE`] is dropped by the listener.

use serde::{Deserialize, Serialize};

use crate::error::{ShareError, ShareResult};

/// Magic tag carried by every datagram
pub const DISCOVERY_MAGIC: &str = "LANSHARE1";

/// Largest datagram sent or accepted
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// Kind of discovery datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Periodic presence
    Announce,
    /// Sent on shutdown so peers drop us without waiting for the timeout
    Goodbye,
    /// Heads-up that a package is about to be pushed
    TransferRequest,
    /// A new save version is available
    SaveSyncOffer,
    /// Ask a peer to offer its latest version of a save
    SaveSyncRequest,
    /// Full catalog listing. Too large for datagrams; use the transfer
    /// protocol's list request instead.
    LibraryList,
}

impl MessageType {
    /// Bulk listings are not carried over UDP
    pub fn is_deprecated(&self) -> bool {
        matches!(self, MessageType::LibraryList)
    }
}

/// One discovery datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub magic: String,
    pub message_type: MessageType,
    /// Sender's stable device identifier
    pub device_id: String,
    pub host_name: String,
    /// TCP port the sender's transfer service listens on
    pub transfer_port: u16,
    #[serde(default)]
    pub packaged_item_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_sync_payload: Option<serde_json::Value>,
}

impl DiscoveryMessage {
    /// A message of `message_type` with no optional fields set
    pub fn new(
        message_type: MessageType,
        device_id: impl Into<String>,
        host_name: impl Into<String>,
        transfer_port: u16,
        packaged_item_count: u32,
    ) -> Self {
        Self {
            magic: DISCOVERY_MAGIC.to_string(),
            message_type,
            device_id: device_id.into(),
            host_name: host_name.into(),
            transfer_port,
            packaged_item_count,
            item_name: None,
            item_size: None,
            save_sync_payload: None,
        }
    }

    /// Serialize for sending.
    ///
    /// Deprecated message types and oversized payloads are refused rather
    /// than truncated.
    pub fn encode(&self) -> ShareResult<Vec<u8>> {
        if self.message_type.is_deprecated() {
            return Err(ShareError::InvalidOperation(format!(
                "{:?} is not carried over discovery; request the library over a transfer connection",
                self.message_type
            )));
        }
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ShareError::PayloadTooLarge {
                size: bytes.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Parse and validate a received datagram.
    pub fn decode(data: &[u8]) -> ShareResult<Self> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(ShareError::PayloadTooLarge {
                size: data.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        let message: DiscoveryMessage = serde_json::from_slice(data)
            .map_err(|e| ShareError::Protocol(format!("unrecognized datagram: {}", e)))?;
        if message.magic != DISCOVERY_MAGIC {
            return Err(ShareError::Protocol(format!(
                "bad magic {:?}",
                message.magic
            )));
        }
        if message.device_id.is_empty() {
            return Err(ShareError::Protocol("datagram without device id".into()));
        }
        Ok(message)
    }
}
