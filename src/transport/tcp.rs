//! TCP transport implementation for Candycom.
//!
//! Carries the same 3-byte tokens over a TCP stream, for serial-over-network
//! bridges and for running host and client on one machine. The host
//! connects; the client listens and serves exactly one peer.

use std::net::SocketAddr;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use super::stream::{StreamOptions, StreamTransport};
use crate::error::{CandyError, Result};

/// TCP stream transport.
pub type TcpTransport = StreamTransport<OwnedWriteHalf>;

/// TCP endpoint address.
#[derive(Debug, Clone)]
pub struct TcpLink {
    /// Address to connect to or listen on.
    addr: SocketAddr,
}

impl TcpLink {
    /// Create a new TCP endpoint.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Create with localhost address.
    pub fn localhost(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Get the endpoint address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host side: connect to a listening client.
    pub async fn connect(&self, options: StreamOptions) -> Result<TcpTransport> {
        let stream = TcpStream::connect(self.addr).await.map_err(|e| {
            CandyError::Transport(format!("Failed to connect to {}: {}", self.addr, e))
        })?;
        tracing::info!("TCP transport connected to {}", self.addr);
        Ok(Self::wrap(stream, options))
    }

    /// Client side: bind and wait for one host.
    pub async fn accept(&self, options: StreamOptions) -> Result<TcpTransport> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            CandyError::Transport(format!("Failed to bind TCP to {}: {}", self.addr, e))
        })?;
        tracing::info!("TCP transport listening on {}", self.addr);
        Self::accept_on(&listener, options).await
    }

    /// Client side: wait for one host on an already bound listener.
    pub async fn accept_on(listener: &TcpListener, options: StreamOptions) -> Result<TcpTransport> {
        let (stream, peer) = listener.accept().await?;
        tracing::info!("TCP host connected from {}", peer);
        Ok(Self::wrap(stream, options))
    }

    fn wrap(stream: TcpStream, options: StreamOptions) -> TcpTransport {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }
        let (reader, writer) = stream.into_split();
        StreamTransport::from_parts("tcp", reader, writer, options)
    }
}

impl Default for TcpLink {
    fn default() -> Self {
        Self::localhost(7878)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_link_default() {
        let link = TcpLink::default();
        assert_eq!(link.addr().port(), 7878);
    }

    #[test]
    fn test_tcp_link_localhost() {
        let link = TcpLink::localhost(3000);
        assert_eq!(link.addr().to_string(), "127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = TcpLink::localhost(port).connect(StreamOptions::default()).await;
        assert!(matches!(result, Err(CandyError::Transport(_))));
    }
}
