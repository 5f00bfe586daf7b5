//! Meshbus - File-backed message bus for independent agent processes
//!
//! Agents coordinate by writing small Markdown files into a shared directory.
//! Each file carries its routing identity twice: compactly in its name and
//! in full in a frontmatter header. Every agent runs a consumer that follows
//! the directory, delivers messages addressed to it and remembers how far it
//! got, so a restarted agent resumes where it left off.
//!
//! # Architecture
//!
//! - **bus**: Filename codec, message format, store, offsets, consumers and
//!   the supervisor that owns them
//! - **rearmatter**: Trailing self-assessment blocks and their advisory
//!   validation
//! - **config**: YAML configuration (directories, timing, retry policy)
//! - **logging**: `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use meshbus::bus::{AgentId, BusSupervisor, MessageDraft, StoredMessage};
//! use meshbus::config::BusConfig;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn demo() -> meshbus::Result<()> {
//! let bus = BusSupervisor::new(BusConfig::with_root("/tmp/meshbus"));
//!
//! let (tx, mut inbox) = mpsc::unbounded_channel::<StoredMessage>();
//! let me: AgentId = "team/worker".parse()?;
//! bus.start_consumer(&me, Arc::new(tx)).await;
//!
//! let draft = MessageDraft::try_new("core/core", "team/worker", "task", "abc123", "hello")?;
//! bus.store().write(&draft)?;
//!
//! if let Some(message) = inbox.recv().await {
//!     println!("{}: {}", message.sender(), message.content());
//! }
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod rearmatter;

// Re-exports
pub use error::{MeshBusError, Result};
