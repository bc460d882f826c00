//! Per-connection echo loop.
//!
//! Each accepted connection runs [`run`] on its own task:
//!
//! ```text
//! Reading -> Echoing -> Reading ...
//!         -> TimedOut | Eof | QuitRequested | Error | Evicted
//! ```
//!
//! Data is echoed per physical read: a payload larger than
//! `max_read_bytes` comes back in several chunks, and the quit token is only
//! recognized when a single read returns exactly those bytes.

use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::session::ConnectionSession;
use crate::transport;
use bytes::BytesMut;
use chrono::Utc;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::debug;

/// Payload that ends the session when received on its own.
pub const QUIT_TOKEN: &[u8] = b"quit";

pub const IDLE_NOTICE: &[u8] = b"Exit due to idle.\n";
pub const EOF_NOTICE: &[u8] = b"Reached end of stream.\n";
pub const QUIT_NOTICE: &[u8] = b"Got quit signal. Aborting.\n";
pub const EVICTED_NOTICE: &[u8] = b"Exit due to server capacity.\n";

/// Limits applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_read_bytes: usize,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            max_read_bytes: config.max_read_bytes,
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    TimedOut,
    Eof,
    QuitRequested,
    Error(io::Error),
    /// Closed by the accept loop to make room for a new connection.
    Evicted,
}

impl SessionEnd {
    /// Message sent to the client before the worker closes the connection.
    fn notice(&self) -> Option<&'static [u8]> {
        match self {
            SessionEnd::TimedOut => Some(IDLE_NOTICE),
            SessionEnd::Eof => Some(EOF_NOTICE),
            SessionEnd::QuitRequested => Some(QUIT_NOTICE),
            // The eviction path writes its own notice.
            SessionEnd::Error(_) | SessionEnd::Evicted => None,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::TimedOut => write!(f, "idle timeout"),
            SessionEnd::Eof => write!(f, "end of stream"),
            SessionEnd::QuitRequested => write!(f, "quit requested"),
            SessionEnd::Error(e) => write!(f, "i/o error: {e}"),
            SessionEnd::Evicted => write!(f, "evicted"),
        }
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    reads: u64,
    bytes_echoed: u64,
}

/// Whether a single read carried the quit token.
pub fn is_quit(data: &[u8]) -> bool {
    data == QUIT_TOKEN
}

/// Serve a session until it ends, then release it.
pub async fn run(
    session: Arc<ConnectionSession>,
    pool: Arc<ConnectionPool>,
    settings: SessionSettings,
) {
    let mut stats = SessionStats::default();
    let end = serve(&session, &pool, &settings, &mut stats).await;
    finish(&session, &pool, &settings, end, stats).await;
}

async fn serve(
    session: &ConnectionSession,
    pool: &ConnectionPool,
    settings: &SessionSettings,
    stats: &mut SessionStats,
) -> SessionEnd {
    let mut buf = BytesMut::zeroed(settings.max_read_bytes);

    loop {
        let read = time::timeout(
            settings.idle_timeout,
            transport::read_chunk(session.stream(), &mut buf),
        )
        .await;

        // Eviction shuts the stream down, which surfaces here as EOF or an
        // error. The flag tells the two apart.
        if session.is_closed() {
            return SessionEnd::Evicted;
        }

        let n = match read {
            Err(_) => return SessionEnd::TimedOut,
            Ok(Ok(0)) => return SessionEnd::Eof,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return SessionEnd::Error(e),
        };

        stats.reads += 1;
        pool.touch(session.handle());

        let data = &buf[..n];
        if is_quit(data) {
            return SessionEnd::QuitRequested;
        }

        if let Err(e) = transport::write_all(session.stream(), data).await {
            return if session.is_closed() {
                SessionEnd::Evicted
            } else {
                SessionEnd::Error(e)
            };
        }
        stats.bytes_echoed += n as u64;
    }
}

async fn finish(
    session: &ConnectionSession,
    pool: &ConnectionPool,
    settings: &SessionSettings,
    end: SessionEnd,
    stats: SessionStats,
) {
    // Whoever removes the session from the pool owns closing it. Losing the
    // race here means the accept loop evicted us.
    let end = match pool.release(session.handle()) {
        Some(_) => end,
        None => SessionEnd::Evicted,
    };

    if !matches!(end, SessionEnd::Evicted) {
        if let Some(notice) = end.notice() {
            let written =
                time::timeout(settings.idle_timeout, transport::write_all(session.stream(), notice))
                    .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session = session.id(), error = %e, "Failed to write notice"),
                Err(_) => debug!(session = session.id(), "Timed out writing notice"),
            }
        }
        session.close();
    }

    let connected_for = Utc::now() - session.connected_at();
    debug!(
        session = session.id(),
        peer = %session.peer(),
        outcome = %end,
        reads = stats.reads,
        bytes_echoed = stats.bytes_echoed,
        connected_at = %session.connected_at(),
        connected_ms = connected_for.num_milliseconds(),
        "Session ended"
    );
}
