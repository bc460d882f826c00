//! TCP server for the capped echo service.
//!
//! Binds the listener, accepts connections, keeps the number of live
//! sessions at or below the configured cap by evicting the least recently
//! active one, and spawns a worker per connection.

use crate::config::Config;
use crate::pool::{ConnectionPool, Room};
use crate::worker::{self, SessionSettings, EVICTED_NOTICE};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Listen backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after running out of descriptors or buffers before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The listener could not be created.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to resolve '{host}': {source}")]
    Resolve { host: String, source: io::Error },
    #[error("'{host}' did not resolve to any address")]
    NoAddress { host: String },
    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },
}

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("accept failed permanently: {0}")]
    Accept(#[source] io::Error),
}

/// A bound server, ready to accept connections.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    pool: Arc<ConnectionPool>,
    settings: SessionSettings,
}

impl Server {
    /// Bind the listening socket. No retry on failure.
    pub async fn bind(config: &Config) -> Result<Self, BindError> {
        let addr = resolve(&config.host, config.port).await?;
        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|source| BindError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError::Listen { addr, source })?;

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            idle_timeout_secs = config.idle_timeout.as_secs_f64(),
            max_read_bytes = config.max_read_bytes,
            "Server listening"
        );

        Ok(Server {
            listener,
            local_addr,
            pool: ConnectionPool::new(config.max_connections),
            settings: SessionSettings::from(config),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until a permanent accept error occurs.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    if is_resource_exhaustion(&e) {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Listener failed, no longer accepting");
                    return Err(ServerError::Accept(e));
                }
            };

            self.make_room();

            let session = self.pool.admit(stream, peer);
            debug!(peer = %peer, session = session.id(), live = self.pool.live(), "New connection");

            tokio::spawn(worker::run(session, Arc::clone(&self.pool), self.settings));
        }
    }

    /// Evict the stalest session if admitting another would exceed the cap.
    fn make_room(&self) {
        match self.pool.make_room() {
            Room::Available => {}
            Room::Evicted(session) => {
                debug!(
                    session = session.id(),
                    peer = %session.peer(),
                    "Evicting least recently active connection"
                );
                session.evict(EVICTED_NOTICE);
            }
            Room::Inconsistent { live } => {
                error!(
                    live,
                    capacity = self.pool.capacity(),
                    "At capacity with no session to evict, admitting anyway"
                );
            }
        }
    }

    #[cfg(test)]
    fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, BindError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| BindError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| BindError::NoAddress {
        host: host.to_string(),
    })
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // SO_REUSEADDR only lets us rebind over TIME_WAIT; a live listener on the
    // same address still fails with AddrInUse.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Accept errors that concern a single pending connection or a temporary
/// resource shortage. Anything else means the listener itself is broken.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(e)
        || matches!(e.raw_os_error(), Some(libc::EPROTO) | Some(libc::EPERM))
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{IDLE_NOTICE, QUIT_NOTICE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_test::{assert_err, assert_ok};

    fn test_config(max_connections: usize, idle: Duration, max_read_bytes: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: None,
            max_connections,
            idle_timeout: idle,
            max_read_bytes,
            log_level: "info".to_string(),
        }
    }

    /// Start a server on an ephemeral port.
    async fn start(config: Config) -> (SocketAddr, Arc<ConnectionPool>) {
        let server = assert_ok!(Server::bind(&config).await);
        let addr = server.local_addr();
        let pool = Arc::clone(server.pool());
        tokio::spawn(server.run());
        (addr, pool)
    }

    async fn echo(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn wait_for_live(pool: &ConnectionPool, expected: usize) {
        for _ in 0..100 {
            if pool.live() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("live count stuck at {}, expected {expected}", pool.live());
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (addr, _pool) = start(test_config(16, Duration::from_secs(10), 8192)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        assert_eq!(echo(&mut client, b"Hello").await, b"Hello");
        let binary: Vec<u8> = (0..=255).collect();
        assert_eq!(echo(&mut client, &binary).await, binary);
    }

    #[tokio::test]
    async fn test_many_sequential_clients() {
        let (addr, pool) = start(test_config(16, Duration::from_secs(10), 8192)).await;

        for i in 0..50 {
            let payload = format!("Hello from {i}");
            let mut client = TcpStream::connect(addr).await.unwrap();
            assert_eq!(echo(&mut client, payload.as_bytes()).await, payload.as_bytes());
        }
        assert!(pool.live() <= 16);
    }

    #[tokio::test]
    async fn test_oversized_payload_echoed_in_chunks() {
        let (addr, _pool) = start(test_config(16, Duration::from_secs(10), 10)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        assert_eq!(echo(&mut client, b"HelloHelloABCDEFG").await, b"HelloHelloABCDEFG");
    }

    #[tokio::test]
    async fn test_quit_token_matched_per_read() {
        let (addr, _pool) = start(test_config(16, Duration::from_secs(10), 10)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // The first read takes ten bytes and is echoed, the second is
        // exactly the quit token.
        client.write_all(b"HelloHelloquit").await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        let mut expected = b"HelloHello".to_vec();
        expected.extend_from_slice(QUIT_NOTICE);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_quit_closes_without_echo() {
        let (addr, pool) = start(test_config(16, Duration::from_secs(10), 8192)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"quit").await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, QUIT_NOTICE);
        wait_for_live(&pool, 0).await;
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (addr, pool) = start(test_config(16, Duration::from_millis(200), 8192)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, IDLE_NOTICE);
        wait_for_live(&pool, 0).await;
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_active() {
        let (addr, pool) = start(test_config(2, Duration::from_secs(10), 8192)).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut a, b"a").await, b"a");
        let mut b = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut b, b"b").await, b"b");
        assert_eq!(pool.live(), 2);

        let mut c = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut c, b"c").await, b"c");

        let mut received = Vec::new();
        a.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, EVICTED_NOTICE);

        assert_eq!(echo(&mut b, b"still here").await, b"still here");
        assert_eq!(echo(&mut c, b"me too").await, b"me too");
        assert_eq!(pool.live(), 2);
    }

    #[tokio::test]
    async fn test_activity_changes_eviction_order() {
        let (addr, pool) = start(test_config(2, Duration::from_secs(10), 8192)).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut a, b"a").await, b"a");
        let mut b = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut b, b"b").await, b"b");
        // A becomes the most recently active.
        assert_eq!(echo(&mut a, b"again").await, b"again");

        let mut c = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut c, b"c").await, b"c");

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, EVICTED_NOTICE);
        assert_eq!(echo(&mut a, b"a").await, b"a");
        assert_eq!(pool.live(), 2);
    }

    #[tokio::test]
    async fn test_backlogged_connection_receives_eviction_notice() {
        let config = test_config(1, Duration::from_secs(10), 8192);
        let server = assert_ok!(Server::bind(&config).await);
        let addr = server.local_addr();
        let pool = Arc::clone(server.pool());

        // Both handshakes complete in the listen backlog, so A is evicted
        // right after it is accepted.
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        tokio::spawn(server.run());

        let mut received = Vec::new();
        a.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, EVICTED_NOTICE);
        assert_eq!(echo(&mut b, b"b").await, b"b");
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn test_accounting_mismatch_still_admits() {
        let (addr, pool) = start(test_config(1, Duration::from_secs(10), 8192)).await;
        pool.force_live(1);

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(echo(&mut client, b"still served").await, b"still served");
        assert_eq!(pool.live(), 2);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let config = test_config(16, Duration::from_secs(10), 8192);
        let first = assert_ok!(Server::bind(&config).await);

        let taken = Config {
            port: first.local_addr().port(),
            ..config
        };
        let err = assert_err!(Server::bind(&taken).await);
        match err {
            BindError::Listen { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_bind_unresolvable_host() {
        let config = Config {
            host: "not a host name".to_string(),
            ..test_config(16, Duration::from_secs(10), 8192)
        };
        let err = assert_err!(Server::bind(&config).await);
        assert!(matches!(
            err,
            BindError::Resolve { .. } | BindError::NoAddress { .. }
        ));
    }

    #[test]
    fn test_accept_error_classification() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(is_transient_accept_error(&kind.into()), "{kind:?}");
        }

        let exhausted = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(is_transient_accept_error(&exhausted));
        assert!(is_resource_exhaustion(&exhausted));

        for errno in [libc::EBADF, libc::EINVAL, libc::ENOTSOCK] {
            let e = io::Error::from_raw_os_error(errno);
            assert!(!is_transient_accept_error(&e), "errno {errno}");
        }
        assert!(!is_resource_exhaustion(&io::ErrorKind::ConnectionReset.into()));
    }
}
