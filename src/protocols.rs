//! Trait seams between the node and its environment.
//!
//! | Seam | Trait | Purpose |
//! |------|-------|---------|
//! | Datagram out | [`Transport`] | Fire-and-forget submission of an encoded message |
//! | Telemetry | [`DhtObserver`] | Receives [`NodeEvent`]s; nothing depends on it listening |
//!
//! Both traits are synchronous: the node never awaits network I/O while it
//! holds a lock, so `send` must only enqueue.

use std::net::SocketAddr;

use crate::identity::NodeId;
use crate::messages::Message;
use crate::traversal::{TraversalId, TraversalKind};

/// Outbound datagram path.
pub trait Transport: Send + Sync + 'static {
    /// Queue `message` for delivery to `to`. Must not block.
    fn send(&self, to: SocketAddr, message: Message) -> anyhow::Result<()>;

    /// Address the node is reachable at, if known.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Unbootstrapped,
    Bootstrapping,
    Active,
    ShuttingDown,
    Stopped,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Unbootstrapped => "unbootstrapped",
            NodeState::Bootstrapping => "bootstrapping",
            NodeState::Active => "active",
            NodeState::ShuttingDown => "shutting_down",
            NodeState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events reported to a [`DhtObserver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    StateChanged { from: NodeState, to: NodeState },
    /// Datagram that could not be decoded or failed validation.
    Malformed { from: SocketAddr, reason: String },
    /// Query answered with an error reply.
    RequestRejected { from: SocketAddr, method: String, code: i64 },
    SecretRotated,
    TraversalStarted { id: TraversalId, kind: TraversalKind, target: NodeId },
    TraversalFinished { id: TraversalId, kind: TraversalKind },
}

/// Telemetry hook.
pub trait DhtObserver: Send + Sync + 'static {
    fn on_event(&self, event: &NodeEvent);
}

/// Observer that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl DhtObserver for NoopObserver {
    fn on_event(&self, _event: &NodeEvent) {}
}
