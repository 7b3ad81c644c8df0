//! # Traversal Registry
//!
//! Every multi-round operation the node starts (bootstrap, refresh, lookups,
//! announce, put, get) runs as its own tokio task and is registered here for
//! its whole lifetime. The registry is what lets shutdown cancel everything
//! still in flight.
//!
//! ## Lifetime
//!
//! ```text
//! register() ──► TraversalGuard ──► (task runs) ──► guard dropped ──► unregister()
//!                     │
//!                     └── cancel_all() aborts the task and flags it cancelled
//! ```
//!
//! `cancel_all` also closes the registry: once it has run, `register` refuses
//! new traversals, so nothing can slip in behind a shutdown.
//!
//! The lock is only held to mutate the map. [`TraversalRegistry::for_each`]
//! runs its callback over a snapshot, so the callback may itself unregister
//! entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::identity::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraversalId(u64);

impl std::fmt::Display for TraversalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TraversalKind {
    Bootstrap,
    Refresh,
    GetPeers,
    Announce,
    Put,
    Get,
}

impl TraversalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraversalKind::Bootstrap => "bootstrap",
            TraversalKind::Refresh => "refresh",
            TraversalKind::GetPeers => "get_peers",
            TraversalKind::Announce => "announce",
            TraversalKind::Put => "put",
            TraversalKind::Get => "get",
        }
    }
}

/// Handle to a registered traversal.
#[derive(Clone, Debug)]
pub struct TraversalHandle {
    pub id: TraversalId,
    pub kind: TraversalKind,
    pub target: NodeId,
    pub started: Instant,
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TraversalHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Flag the traversal cancelled and abort its task, if one is attached.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

#[derive(Default)]
struct Entries {
    live: HashMap<TraversalId, TraversalHandle>,
    closed: bool,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct TraversalRegistry {
    inner: Arc<RegistryInner>,
}

impl TraversalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new traversal. It stays registered until the returned
    /// guard is dropped. Returns `None` once the registry is closed.
    pub fn register(&self, kind: TraversalKind, target: NodeId) -> Option<TraversalGuard> {
        let id = TraversalId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = TraversalHandle {
            id,
            kind,
            target,
            started: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: None,
        };
        {
            let mut entries = self.inner.entries.lock();
            if entries.closed {
                debug!(kind = kind.as_str(), target = %target.short(), "registry closed, traversal refused");
                return None;
            }
            entries.live.insert(id, handle.clone());
        }
        debug!(traversal = %id, kind = kind.as_str(), target = %target.short(), "traversal started");
        Some(TraversalGuard {
            registry: self.clone(),
            handle,
        })
    }

    /// Attach the task running traversal `id` so cancellation can abort it.
    /// A traversal that is no longer registered has its task aborted at once.
    pub fn attach(&self, id: TraversalId, abort: AbortHandle) {
        let mut entries = self.inner.entries.lock();
        match entries.live.get_mut(&id) {
            Some(entry) if !entry.is_cancelled() => entry.abort = Some(abort),
            _ => abort.abort(),
        }
    }

    pub fn unregister(&self, id: TraversalId) -> bool {
        self.inner.entries.lock().live.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().live.len()
    }

    /// Run `f` over a snapshot of the registered traversals.
    pub fn for_each(&self, mut f: impl FnMut(&TraversalHandle)) {
        let snapshot: Vec<TraversalHandle> =
            self.inner.entries.lock().live.values().cloned().collect();
        for handle in &snapshot {
            f(handle);
        }
    }

    /// Close the registry, then cancel and unregister everything.
    /// Returns the cancelled ids.
    pub fn cancel_all(&self) -> Vec<TraversalId> {
        // Closed before the snapshot: anything registered earlier is in it.
        self.inner.entries.lock().closed = true;
        let mut cancelled = Vec::new();
        self.for_each(|handle| {
            handle.cancel();
            self.unregister(handle.id);
            cancelled.push(handle.id);
        });
        cancelled
    }
}

impl std::fmt::Debug for TraversalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraversalRegistry")
            .field("active", &self.len())
            .finish()
    }
}

/// Keeps a traversal registered while alive.
pub struct TraversalGuard {
    registry: TraversalRegistry,
    handle: TraversalHandle,
}

impl TraversalGuard {
    pub fn id(&self) -> TraversalId {
        self.handle.id
    }

    /// A handle sharing this traversal's cancellation flag.
    pub fn handle(&self) -> TraversalHandle {
        self.handle.clone()
    }
}

impl Drop for TraversalGuard {
    fn drop(&mut self) {
        if self.registry.unregister(self.handle.id) {
            debug!(
                traversal = %self.handle.id,
                kind = self.handle.kind.as_str(),
                target = %self.handle.target.short(),
                elapsed_ms = self.handle.started.elapsed().as_millis() as u64,
                "traversal finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = TraversalRegistry::new();
        let guard = registry.register(TraversalKind::Refresh, NodeId::random()).unwrap();
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn for_each_tolerates_reentrant_unregister() {
        let registry = TraversalRegistry::new();
        let guards: Vec<_> = (0..5)
            .map(|_| registry.register(TraversalKind::Get, NodeId::random()).unwrap())
            .collect();

        let mut visited = 0;
        registry.for_each(|handle| {
            registry.unregister(handle.id);
            visited += 1;
        });
        assert_eq!(visited, 5);
        assert_eq!(registry.len(), 0);
        drop(guards);
    }

    #[tokio::test]
    async fn cancel_all_aborts_tasks() {
        let registry = TraversalRegistry::new();
        let guard = registry.register(TraversalKind::Bootstrap, NodeId::random()).unwrap();
        let id = guard.id();
        let task = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.attach(id, task.abort_handle());

        let cancelled = registry.cancel_all();
        assert_eq!(cancelled, vec![id]);
        assert_eq!(registry.len(), 0);
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn cancelled_handle_reports_cancellation() {
        let registry = TraversalRegistry::new();
        let guard = registry.register(TraversalKind::GetPeers, NodeId::random()).unwrap();
        registry.cancel_all();
        assert!(guard.handle().is_cancelled());
    }

    #[test]
    fn closed_registry_refuses_new_traversals() {
        let registry = TraversalRegistry::new();
        let before = registry.register(TraversalKind::Put, NodeId::random()).unwrap();
        registry.cancel_all();

        assert!(before.handle().is_cancelled());
        assert!(registry.register(TraversalKind::Announce, NodeId::random()).is_none());
        assert_eq!(registry.len(), 0);
    }
}
