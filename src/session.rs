//! Per-connection state shared by a worker and the eviction path.

use crate::heap::HeapHandle;
use crate::transport;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tracing::debug;

/// One accepted client connection.
///
/// The worker task reads and writes the stream. The accept loop may evict
/// the session concurrently; `closed` makes sure only one of the two paths
/// ever closes the transport.
#[derive(Debug)]
pub struct ConnectionSession {
    handle: HeapHandle,
    stream: TcpStream,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl ConnectionSession {
    pub fn new(handle: HeapHandle, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            handle,
            stream,
            peer,
            connected_at: Utc::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Position of this session in the recency heap.
    pub fn handle(&self) -> HeapHandle {
        self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Whether either path has already closed the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the transport. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if !self.claim_close() {
            return false;
        }
        transport::shutdown(&self.stream);
        true
    }

    /// Forced close: write `notice` without waiting, then close.
    ///
    /// A worker blocked on the stream wakes up and finds `is_closed` set.
    pub fn evict(&self, notice: &[u8]) -> bool {
        if !self.claim_close() {
            return false;
        }
        match transport::try_write_once(&self.stream, notice) {
            Ok(n) if n < notice.len() => {
                debug!(session = self.id(), written = n, "Eviction notice truncated");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(session = self.id(), error = %e, "Failed to write eviction notice");
            }
        }
        transport::shutdown(&self.stream);
        true
    }

    fn claim_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}
