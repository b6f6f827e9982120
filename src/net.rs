//! Connection layer: opening, accepting, and binding sockets.
//!
//! Failures here (DNS, refused connection, timeout, bind conflicts) map to
//! [`Error::Connection`] and are terminal; retry policy belongs to the
//! caller, never to the engine.

use crate::{Error, Result};
use log::debug;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

/// Bound on a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens one TCP connection to `host:port`.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Connection(format!(
            "connect to {} failed: {}",
            addr, e
        ))),
        Err(_) => Err(Error::Connection(format!("connect to {} timed out", addr))),
    }
}

/// Opens `count` TCP data connections to `host:port`. The first failure
/// aborts the whole attempt.
pub async fn connect_tcp_streams(host: &str, port: u16, count: usize) -> Result<Vec<TcpStream>> {
    let mut streams = Vec::with_capacity(count);
    for index in 0..count {
        let stream = connect_tcp(host, port).await?;
        debug!(
            "data connection {} established from {:?}",
            index,
            stream.local_addr().ok()
        );
        streams.push(stream);
    }
    Ok(streams)
}

/// Binds an ephemeral local UDP socket and connects it to `host:port`.
pub async fn connect_udp(host: &str, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::Connection(format!("UDP bind failed: {}", e)))?;
    let addr = format!("{}:{}", host, port);
    socket
        .connect(&addr)
        .await
        .map_err(|e| Error::Connection(format!("UDP connect to {} failed: {}", addr, e)))?;
    Ok(socket)
}

/// Binds the server's TCP listener.
pub async fn bind_listener(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Connection(format!("bind to port {} failed: {}", port, e)))
}

/// Binds the server's UDP data socket.
pub async fn bind_udp(port: u16) -> Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Connection(format!("UDP bind to port {} failed: {}", port, e)))
}
