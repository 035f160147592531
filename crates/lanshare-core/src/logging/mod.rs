//! JSONL logging for lanshare nodes.
//!
//! Each node appends to its own file so several nodes on one machine (tests,
//! multi-instance setups) never interleave writes:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-16_den-pc.jsonl
//!     └── 2026-10-16_laptop.jsonl
//! ```
//!
//! ```ignore
//! use lanshare_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("den-pc")
//!     .with_logs_dir("./logs")
//!     .with_filter("lanshare_core=debug,info")
//!     .init()?;
//! ```
//!
//! ```bash
//! # Every failed transfer
//! jq 'select(.msg == "Send failed" or .msg == "Inbound request failed")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_entries, NodeLogWriter};
