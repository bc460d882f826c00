//! Byte-stream helpers over a shared TCP stream.
//!
//! A session's stream is read and written by its worker while the eviction
//! path may shut it down at any moment, so everything here works through
//! `&TcpStream` using readiness plus `try_read`/`try_write`. The eviction
//! notice bypasses readiness and goes straight to the socket.

use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use tokio::net::TcpStream;
use tracing::trace;

/// Read whatever is available, up to `buf.len()` bytes.
///
/// Returns `Ok(0)` at end of stream, including after a local shutdown.
pub async fn read_chunk(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write the whole buffer, waiting for the socket to drain as needed.
pub async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Single non-blocking write attempt. Never waits for the peer.
///
/// Issues the `send` directly: `TcpStream::try_write` reports `WouldBlock`
/// without a syscall until the runtime has seen the stream become writable,
/// which a freshly accepted stream has not.
pub fn try_write_once(stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    SockRef::from(stream).send(buf)
}

/// Shut down both directions, waking any task blocked on the stream.
pub fn shutdown(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
        // NotConnected once the peer has already reset the connection.
        trace!(error = %e, "Shutdown failed");
    }
}

#[cfg(test)]
pub(crate) async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accepted.unwrap().0, client.unwrap())
}
