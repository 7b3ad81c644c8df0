//! # RPC Transaction Manager
//!
//! Correlates outgoing queries with their replies.
//!
//! ## Flow
//!
//! ```text
//! query() ─► allocate tid ─► pending[tid] = (to, oneshot) ─► Transport::send
//!                                   │
//!   incoming(reply from `to`, tid) ─┘─► oneshot resolves with the reply dict
//!   timeout                        ───► pending removed, QueryError::Timeout
//!   cancel / cancel_traversal      ───► pending removed, QueryError::Cancelled
//! ```
//!
//! Each transaction resolves exactly once. A reply is only matched if it
//! comes from the address the query went to; anything else is dropped at
//! trace level. Recently expired tids are remembered so late replies can be
//! told apart from unknown ones in logs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::oneshot;
use tracing::trace;

use crate::identity::NodeId;
use crate::messages::{Body, Dict, Message, Method};
use crate::protocols::Transport;
use crate::traversal::TraversalId;

/// How many expired transaction ids are remembered for late-reply logging.
const RECENTLY_EXPIRED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    Timeout,
    /// The remote node answered with an error reply.
    Remote { code: i64, message: String },
    /// Dropped before a reply arrived (cancellation or shutdown).
    Cancelled,
    Transport(String),
    /// Every transaction id is in use.
    Exhausted,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Timeout => write!(f, "query timed out"),
            QueryError::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            QueryError::Cancelled => write!(f, "query cancelled"),
            QueryError::Transport(e) => write!(f, "transport error: {e}"),
            QueryError::Exhausted => write!(f, "no free transaction ids"),
        }
    }
}

impl std::error::Error for QueryError {}

pub type QueryResult = Result<Dict, QueryError>;

struct Pending {
    to: SocketAddr,
    method: Method,
    sent: Instant,
    traversal: Option<TraversalId>,
    reply: oneshot::Sender<QueryResult>,
}

/// Outcome of handing a reply or error to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Matched { method: Method, rtt: Duration },
    /// The transaction already timed out.
    Late,
    /// Reply for a live transaction, but from the wrong address.
    WrongSender,
    Unknown,
}

pub struct RpcManager {
    self_id: NodeId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    next_tid: AtomicU16,
    pending: Mutex<HashMap<u16, Pending>>,
    expired: Mutex<LruCache<u16, SocketAddr>>,
}

impl RpcManager {
    pub fn new(self_id: NodeId, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(RECENTLY_EXPIRED_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            self_id,
            transport,
            timeout,
            next_tid: AtomicU16::new(rand::thread_rng().next_u32() as u16),
            pending: Mutex::new(HashMap::new()),
            expired: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register and send a query. The receiver resolves exactly once.
    pub fn send_query(
        &self,
        to: SocketAddr,
        method: Method,
        mut args: Dict,
        traversal: Option<TraversalId>,
    ) -> Result<(u16, oneshot::Receiver<QueryResult>), QueryError> {
        args.insert("id".to_string(), self.self_id.into());
        let (tx, rx) = oneshot::channel();

        let tid = {
            let mut pending = self.pending.lock();
            let tid = self.allocate_tid(&pending)?;
            pending.insert(
                tid,
                Pending {
                    to,
                    method,
                    sent: Instant::now(),
                    traversal,
                    reply: tx,
                },
            );
            tid
        };

        if let Err(e) = self.transport.send(to, Message::query(tid, method, args)) {
            self.cancel(tid);
            return Err(QueryError::Transport(e.to_string()));
        }
        trace!(tid, method = method.as_str(), %to, "query sent");
        Ok((tid, rx))
    }

    fn allocate_tid(&self, pending: &HashMap<u16, Pending>) -> Result<u16, QueryError> {
        for _ in 0..=u16::MAX as usize {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&tid) {
                return Ok(tid);
            }
        }
        Err(QueryError::Exhausted)
    }

    /// Send a query and wait for its reply or timeout.
    pub async fn query(
        &self,
        to: SocketAddr,
        method: Method,
        args: Dict,
        traversal: Option<TraversalId>,
    ) -> QueryResult {
        let (tid, rx) = self.send_query(to, method, args, traversal)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueryError::Cancelled),
            Err(_) => {
                if let Some(p) = self.pending.lock().remove(&tid) {
                    self.expired.lock().put(tid, p.to);
                    trace!(tid, method = p.method.as_str(), to = %p.to, "query timed out");
                    return Err(QueryError::Timeout);
                }
                // Resolved between the timer firing and the lock.
                Err(QueryError::Cancelled)
            }
        }
    }

    /// Deliver a reply or error message received from `from`.
    pub fn incoming(&self, from: SocketAddr, message: Message) -> Correlation {
        let tid = message.transaction;
        let result = match message.body {
            Body::Reply(values) => Ok(values),
            Body::Error { code, message } => Err(QueryError::Remote { code, message }),
            Body::Query { .. } => return Correlation::Unknown,
        };

        let pending = {
            let mut table = self.pending.lock();
            match table.get(&tid) {
                Some(p) if p.to != from => {
                    trace!(tid, expected = %p.to, %from, "reply from unexpected address");
                    return Correlation::WrongSender;
                }
                Some(_) => table.remove(&tid),
                None => None,
            }
        };

        let Some(pending) = pending else {
            if self.expired.lock().pop(&tid).is_some() {
                trace!(tid, %from, "late reply dropped");
                return Correlation::Late;
            }
            trace!(tid, %from, "unknown transaction dropped");
            return Correlation::Unknown;
        };

        let rtt = pending.sent.elapsed();
        let method = pending.method;
        let _ = pending.reply.send(result);
        Correlation::Matched { method, rtt }
    }

    /// Drop a pending transaction. Its waiter sees `Cancelled`.
    pub fn cancel(&self, tid: u16) -> bool {
        self.pending.lock().remove(&tid).is_some()
    }

    /// Drop every transaction issued on behalf of `traversal`.
    pub fn cancel_traversal(&self, traversal: TraversalId) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.traversal != Some(traversal));
        before - pending.len()
    }

    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        pending.clear();
        n
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("pending", &self.num_pending())
            .field("timeout", &self.timeout)
            .finish()
    }
}
