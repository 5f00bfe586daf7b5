//! File-backed message bus
//!
//! Agents exchange messages by writing files into one shared directory. Each
//! agent runs a consumer that follows the directory and hands it every
//! message addressed to it.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  write   ┌──────────────────────┐  watch/scan  ┌─────────────┐
//! │MessageStore│ ───────> │ messages/            │ <─────────── │ LogConsumer │──> handler
//! └────────────┘          │   <ts>-<type>-a>b-<id>.md            └─────────────┘
//!                         └──────────────────────┘                    │
//!                                                                     v
//!                                                      offsets/<agent>.json
//! ```
//!
//! [`BusSupervisor`] owns the consumers of one bus and the global on/off
//! switch.

mod address;
mod consumer;
pub mod filename;
pub mod message;
mod offsets;
mod retry;
mod sinks;
mod store;
mod supervisor;

pub use address::{base_name, AddressError, AgentId};
pub use consumer::{ConsumerState, ConsumerStatus, LogConsumer};
pub use filename::{FilenameError, ParsedFilename};
pub use message::{
    format_message, new_message_id, parse_message, Frontmatter, FrontmatterError, MessageDraft,
    MessageFilter, StoredMessage,
};
pub use offsets::{OffsetRecord, OffsetTracker};
pub use retry::{deliver_with_retry, DeliveryOutcome, RetryPolicy};
pub use sinks::{ActivitySink, HandlerFn, LifecycleSink, LifecycleState, MessageHandler};
pub use store::{MessageStore, WriteOptions};
pub use supervisor::{BusStatus, BusSupervisor};
