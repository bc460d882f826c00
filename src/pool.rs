//! Admission control for live sessions.
//!
//! Holds the recency heap and the live-connection count behind one lock.
//! Every operation changes both together, so the count can never drift from
//! heap membership. Raw heap access is not exposed.

use crate::heap::{HeapHandle, RecencyHeap};
use crate::session::ConnectionSession;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{info, trace};

/// Outcome of making room for a new connection.
#[derive(Debug)]
pub enum Room {
    /// Below capacity, nothing to do.
    Available,
    /// The stalest session was removed and must be closed by the caller.
    Evicted(Arc<ConnectionSession>),
    /// At capacity but the heap is empty. Accounting bug; admit anyway.
    Inconsistent { live: usize },
}

struct PoolState {
    heap: RecencyHeap<Arc<ConnectionSession>>,
    live: usize,
}

/// Shared registry of live sessions ordered by recency.
pub struct ConnectionPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        info!(capacity, "Initializing connection pool");
        Arc::new(Self {
            capacity,
            state: Mutex::new(PoolState {
                heap: RecencyHeap::new(),
                live: 0,
            }),
        })
    }

    /// Maximum number of concurrent sessions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live sessions.
    pub fn live(&self) -> usize {
        self.lock().live
    }

    /// Evict the least recently active session if the pool is full.
    ///
    /// The evicted session is returned unclosed so the caller can close it
    /// without holding the pool lock.
    pub fn make_room(&self) -> Room {
        let mut state = self.lock();
        if state.live < self.capacity {
            return Room::Available;
        }
        match state.heap.pop_min() {
            Some(session) => {
                state.live -= 1;
                        Room::Evicted(session)
            }
            None => Room::Inconsistent { live: state.live },
        }
    }

    /// Register a newly accepted connection as the most recent session.
    pub fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Arc<ConnectionSession> {
        let mut state = self.lock();
        let session = Arc::clone(state.heap.push_with(Instant::now(), |handle| {
            Arc::new(ConnectionSession::new(handle, stream, peer))
        }));
        state.live += 1;
        trace!(session = session.id(), live = state.live, "Session admitted");
        session
    }

    /// Record activity on a session. Returns `false` if it is no longer live.
    pub fn touch(&self, handle: HeapHandle) -> bool {
        self.lock().heap.update(handle, Instant::now())
    }

    /// Remove a session that ended on its own.
    ///
    /// Returns `None` if the session had already been evicted.
    pub fn release(&self, handle: HeapHandle) -> Option<Arc<ConnectionSession>> {
        let mut state = self.lock();
        let session = state.heap.remove(handle)?;
        state.live -= 1;
        Some(session)
    }

    /// Overwrite the live count without touching the heap.
    #[cfg(test)]
    pub(crate) fn force_live(&self, live: usize) {
        self.lock().live = live;
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Critical sections never panic midway, so a poisoned state is intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity)
            .field("live", &self.live())
            .finish()
    }
}
