use anyhow::{Context, Result};
use pcap_file::DataLink;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::frame::build_ipv4_udp;
use super::{CaptureSource, SourceEvent};
use crate::packet::CapturedDatagram;
use crate::responder::UdpResponder;

const RECV_BUFFER_SIZE: usize = 2048;

/// Receives datagrams on a bound UDP socket, for deployments that answer
/// clients directly instead of sniffing an interface.
pub struct UdpListener {
    socket: Socket,
    reader: UdpSocket,
    local: SocketAddr,
    /// Destination stamped into synthesized frames; defaults to the bound address
    server_ip: Option<Ipv4Addr>,
    buffer: Vec<u8>,
}

impl UdpListener {
    pub fn bind(addr: SocketAddr, read_timeout: Duration) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;
        socket.set_reuse_address(true)?;
        if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
            warn!("Failed to set large receive buffer on {}: {}", addr, e);
        }
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind UDP listener on {}", addr))?;
        socket.set_read_timeout(Some(read_timeout))?;

        let reader: UdpSocket = socket.try_clone()?.into();
        let local = reader.local_addr()?;
        info!("Listening on UDP {}", local);

        Ok(Self {
            socket,
            reader,
            local,
            server_ip: None,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Record `ip` as the destination of captured frames. Needed when bound
    /// to a wildcard address, which would otherwise show up as 0.0.0.0.
    pub fn with_server_ip(mut self, ip: Ipv4Addr) -> Self {
        self.server_ip = Some(ip);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// A responder that replies from the listening socket, so clients see
    /// answers from the port they queried.
    pub fn responder(&self) -> Result<UdpResponder> {
        Ok(UdpResponder::from_socket(self.socket.try_clone()?))
    }

    fn local_ipv4(&self) -> Ipv4Addr {
        if let Some(ip) = self.server_ip {
            return ip;
        }
        match self.local.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl CaptureSource for UdpListener {
    fn next_event(&mut self) -> Result<SourceEvent> {
        match self.reader.recv_from(&mut self.buffer) {
            Ok((size, src)) => {
                let payload = self.buffer[..size].to_vec();
                let mut datagram = CapturedDatagram::new(src, self.local.port(), payload, SystemTime::now());

                match build_ipv4_udp(src, self.local_ipv4(), self.local.port(), &datagram.payload) {
                    Some(frame) => {
                        let len = frame.len() as u32;
                        datagram = datagram.with_frame(frame, len);
                    }
                    None => debug!("No IPv4 frame for datagram from {}", src),
                }
                Ok(SourceEvent::Datagram(datagram))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(SourceEvent::Idle),
            Err(e) => {
                // Transient socket errors (e.g. ICMP unreachable surfacing) should not end the server
                warn!("Error reading packet on {}: {}", self.local, e);
                Ok(SourceEvent::Idle)
            }
        }
    }

    fn link_type(&self) -> DataLink {
        DataLink::IPV4
    }

    fn describe(&self) -> String {
        format!("UDP socket {}", self.local)
    }
}
