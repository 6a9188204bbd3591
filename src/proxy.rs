//! Proxy bridge
//!
//! Substitutes a single bridged TCP connection for stdin/stdout. The bridge
//! accepts exactly one connection, then closes the listening socket: this is
//! not a multi-client proxy, just a way to attach a socket where a terminal
//! would otherwise be.

use log::info;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::TunnelError;

/// A bound, not-yet-accepted bridge.
pub struct ProxyBridge {
    listener: TcpListener,
}

impl ProxyBridge {
    /// Bind the bridge port on all interfaces with `SO_REUSEADDR`.
    ///
    /// # Errors
    ///
    /// Bind or listen failure is fatal at startup; there is no tunnel
    /// without a bridged client.
    pub fn bind(port: u16) -> Result<Self, TunnelError> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(format!("0.0.0.0:{}", port).parse().unwrap())?;
        let listener = socket.listen(1)?;

        info!("listening on port = {}", listener.local_addr()?.port());
        Ok(Self { listener })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the one client this bridge will ever serve.
    ///
    /// Consumes the bridge: the listening socket is dropped as soon as the
    /// connection is accepted, so later connection attempts are refused.
    pub async fn accept_one(self) -> Result<TcpStream, TunnelError> {
        let (stream, peer) = self.listener.accept().await?;
        info!("bridged connection from {}", peer);
        drop(self.listener);
        Ok(stream)
    }
}
