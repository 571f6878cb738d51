use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Transmits synthesized replies back to clients.
pub trait Responder: Send + Sync {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

/// Connectionless responder over a `socket2` UDP socket.
pub struct UdpResponder {
    socket: Socket,
}

impl UdpResponder {
    /// Open a dedicated socket for replies, e.g. `0.0.0.0:0` for an ephemeral port.
    pub fn bind(local: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create response socket")?;
        if let Err(e) = socket.set_send_buffer_size(1024 * 1024) {
            warn!("Failed to set send buffer for response socket: {}", e);
        }
        socket
            .bind(&local.into())
            .with_context(|| format!("Failed to bind response socket on {}", local))?;

        debug!("Response socket bound to {:?}", socket.local_addr().ok().and_then(|a| a.as_socket()));
        Ok(Self { socket })
    }

    pub fn from_socket(socket: Socket) -> Self {
        Self { socket }
    }
}

impl Responder for UdpResponder {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, &dest.into())
    }
}
