//! Collaborator seams
//!
//! The bus does not own agent state. It reports activity and lifecycle hints
//! to whatever sinks the host wires in, and hands delivered messages to a
//! per-agent handler.

use super::address::AgentId;
use super::message::StoredMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Lifecycle states a message type can imply for its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Waiting on a human
    Blocked,
    /// Wrapping up a task
    Completing,
}

impl LifecycleState {
    /// The transition a message type requests for its sender, if any
    pub fn for_message_type(msg_type: &str) -> Option<Self> {
        match msg_type {
            "ask-human" => Some(LifecycleState::Blocked),
            "task-complete" => Some(LifecycleState::Completing),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Blocked => write!(f, "blocked"),
            LifecycleState::Completing => write!(f, "completing"),
        }
    }
}

/// Records that an agent was just active
pub trait ActivitySink: Send + Sync {
    fn record_activity(&self, agent: &AgentId) -> anyhow::Result<()>;
}

/// Applies lifecycle transitions requested by message traffic
pub trait LifecycleSink: Send + Sync {
    fn request_transition(&self, agent: &AgentId, state: LifecycleState) -> anyhow::Result<()>;
}

/// Receives messages delivered to one agent
///
/// An error leaves the message undelivered; the consumer retries it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn deliver(&self, message: &StoredMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl MessageHandler for mpsc::UnboundedSender<StoredMessage> {
    async fn deliver(&self, message: &StoredMessage) -> anyhow::Result<()> {
        self.send(message.clone())
            .map_err(|_| anyhow::anyhow!("message receiver dropped"))
    }
}

#[async_trait]
impl MessageHandler for mpsc::Sender<StoredMessage> {
    async fn deliver(&self, message: &StoredMessage) -> anyhow::Result<()> {
        self.send(message.clone())
            .await
            .map_err(|_| anyhow::anyhow!("message receiver dropped"))
    }
}

/// Adapts a synchronous closure into a [`MessageHandler`]
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> MessageHandler for HandlerFn<F>
where
    F: Fn(&StoredMessage) -> anyhow::Result<()> + Send + Sync,
{
    async fn deliver(&self, message: &StoredMessage) -> anyhow::Result<()> {
        (self.0)(message)
    }
}
